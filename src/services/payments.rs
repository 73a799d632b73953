//! Pending payment index over the external payment store.
//!
//! Payments are referenced by `{kind, external_id}` only; the three source
//! tables belong to the payment subsystem and are mutated here exclusively
//! through [`PaymentStore::confirm`].

use crate::error::{AppError, ConfirmError};
use crate::models::{PaymentKind, PendingPayment};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::{info, instrument};
use uuid::Uuid;

/// External payment collaborator seam.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Snapshot every payment awaiting reconciliation for one property:
    /// settled manual payments, non-terminal online intents, and
    /// uploaded/awaiting-review bank-transfer submissions. Taken once per
    /// batch run; later payments wait for a later batch.
    async fn pending_for_property(&self, property_id: Uuid)
        -> Result<Vec<PendingPayment>, AppError>;

    /// Confirm one payment: an intent transitions to approved, a transfer
    /// submission to confirmed, a manual payment needs no external change.
    async fn confirm(&self, kind: PaymentKind, external_id: Uuid) -> Result<(), ConfirmError>;
}

#[derive(Debug, FromRow)]
struct PendingRow {
    external_id: Uuid,
    amount: Decimal,
    currency: String,
    reference_date: NaiveDate,
    reservation_id: Uuid,
    created_utc: DateTime<Utc>,
}

impl PendingRow {
    fn into_payment(self, kind: PaymentKind) -> PendingPayment {
        PendingPayment {
            kind,
            external_id: self.external_id,
            amount: self.amount,
            currency: self.currency,
            reference_date: self.reference_date,
            reservation_id: self.reservation_id,
            created_utc: self.created_utc,
        }
    }
}

/// Postgres-backed payment store reading the payment subsystem's tables.
#[derive(Clone)]
pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_state(
        &self,
        table: &str,
        id_column: &str,
        external_id: Uuid,
    ) -> Result<Option<String>, AppError> {
        let query = format!("SELECT status FROM {table} WHERE {id_column} = $1");
        let status: Option<(String,)> = sqlx::query_as(&query)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to read payment state: {}", e))
            })?;
        Ok(status.map(|(s,)| s))
    }
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    #[instrument(skip(self), fields(property_id = %property_id))]
    async fn pending_for_property(
        &self,
        property_id: Uuid,
    ) -> Result<Vec<PendingPayment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["pending_for_property"])
            .start_timer();

        let manual = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT payment_id AS external_id, amount, currency, paid_date AS reference_date, reservation_id, created_utc
            FROM manual_payments
            WHERE property_id = $1 AND status = 'settled' AND reconciled = FALSE
            "#,
        )
        .bind(property_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load manual payments: {}", e)))?;

        let intents = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT intent_id AS external_id, amount, currency, initiated_date AS reference_date, reservation_id, created_utc
            FROM payment_intents
            WHERE property_id = $1 AND status NOT IN ('approved', 'rejected', 'expired')
            "#,
        )
        .bind(property_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load payment intents: {}", e)))?;

        let transfers = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT submission_id AS external_id, amount, currency, transfer_date AS reference_date, reservation_id, created_utc
            FROM bank_transfer_submissions
            WHERE property_id = $1 AND status IN ('uploaded', 'awaiting_review')
            "#,
        )
        .bind(property_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load transfer submissions: {}", e)))?;

        timer.observe_duration();

        let mut payments: Vec<PendingPayment> = Vec::new();
        payments.extend(manual.into_iter().map(|r| r.into_payment(PaymentKind::Manual)));
        payments.extend(
            intents
                .into_iter()
                .map(|r| r.into_payment(PaymentKind::OnlineIntent)),
        );
        payments.extend(
            transfers
                .into_iter()
                .map(|r| r.into_payment(PaymentKind::BankTransfer)),
        );

        info!(
            property_id = %property_id,
            count = payments.len(),
            "Pending payment snapshot taken"
        );

        Ok(payments)
    }

    #[instrument(skip(self), fields(kind = kind.as_str(), external_id = %external_id))]
    async fn confirm(&self, kind: PaymentKind, external_id: Uuid) -> Result<(), ConfirmError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["confirm_payment"])
            .start_timer();

        let (query, table, id_column) = match kind {
            // Already settled; flag it reconciled so the next snapshot skips it.
            PaymentKind::Manual => (
                r#"
                UPDATE manual_payments
                SET reconciled = TRUE, updated_utc = NOW()
                WHERE payment_id = $1 AND reconciled = FALSE
                "#,
                "manual_payments",
                "payment_id",
            ),
            PaymentKind::OnlineIntent => (
                r#"
                UPDATE payment_intents
                SET status = 'approved', updated_utc = NOW()
                WHERE intent_id = $1 AND status NOT IN ('approved', 'rejected', 'expired')
                "#,
                "payment_intents",
                "intent_id",
            ),
            PaymentKind::BankTransfer => (
                r#"
                UPDATE bank_transfer_submissions
                SET status = 'confirmed', updated_utc = NOW()
                WHERE submission_id = $1 AND status IN ('uploaded', 'awaiting_review')
                "#,
                "bank_transfer_submissions",
                "submission_id",
            ),
        };

        let result = sqlx::query(query)
            .bind(external_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                ConfirmError::Infra(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to confirm payment: {}",
                    e
                )))
            })?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            if kind == PaymentKind::Manual {
                let exists: Option<(bool,)> =
                    sqlx::query_as("SELECT reconciled FROM manual_payments WHERE payment_id = $1")
                        .bind(external_id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(|e| {
                            ConfirmError::Infra(AppError::DatabaseError(anyhow::anyhow!(
                                "Failed to read payment state: {}",
                                e
                            )))
                        })?;
                return match exists {
                    Some(_) => Err(ConfirmError::AlreadyClaimed(format!(
                        "{} already reconciled",
                        external_id
                    ))),
                    None => Err(ConfirmError::NotConfirmable(format!(
                        "{} no longer exists",
                        external_id
                    ))),
                };
            }
            return match self.current_state(table, id_column, external_id).await? {
                Some(status) if status == "approved" || status == "confirmed" => Err(
                    ConfirmError::AlreadyClaimed(format!("{} already {}", external_id, status)),
                ),
                Some(status) => Err(ConfirmError::NotConfirmable(format!(
                    "{} is in state '{}'",
                    external_id, status
                ))),
                None => Err(ConfirmError::NotConfirmable(format!(
                    "{} no longer exists",
                    external_id
                ))),
            };
        }

        info!(kind = kind.as_str(), external_id = %external_id, "Payment confirmed");
        Ok(())
    }
}
