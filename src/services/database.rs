//! Reconciliation storage: trait seam plus the sqlx Postgres implementation.
//!
//! The batch, transaction, match, and log tables are owned and mutated
//! exclusively by this subsystem. The log table is append-only; no update or
//! delete statement for it exists anywhere in this module.

#![allow(clippy::too_many_arguments)]

use crate::config::ReconciliationConfig;
use crate::error::{AppError, ConfirmError};
use crate::models::{
    BankTransaction, BatchStatus, LogEvent, NewBatch, PaymentKind, ReconciliationBatch,
    ReconciliationLogEntry, ReconciliationMatch, TransactionState,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::payments::PaymentStore;
use crate::services::scorer::MatchCandidate;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// One normalized statement row ready for insertion.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub row_number: i32,
    pub transaction_date: NaiveDate,
    pub description: String,
    pub amount: Decimal,
    pub original_currency: String,
    pub original_amount: Option<Decimal>,
    pub reference: Option<String>,
    pub rate_missing: bool,
}

/// Final tallies for a batch run.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchCounts {
    pub total: i32,
    pub matched: i32,
    pub unmatched: i32,
    pub pending_review: i32,
    pub error: i32,
    pub reversal: i32,
}

/// Append-only audit record payload.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub batch_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub match_id: Option<Uuid>,
    pub event: LogEvent,
    pub description: String,
    pub details: serde_json::Value,
    pub confidence: Option<f64>,
    pub actor: Option<String>,
}

/// Storage seam for the reconciliation engine. The Postgres implementation
/// below is the production store; tests drive the engine through an
/// in-memory implementation with the same semantics.
#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    // Batches
    async fn create_batch(&self, new: NewBatch) -> Result<ReconciliationBatch, AppError>;
    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<ReconciliationBatch>, AppError>;
    /// Move a pending or resubmitted failed batch to processing. Returns the
    /// updated row, or None when the batch was not in a startable state.
    async fn mark_batch_processing(
        &self,
        batch_id: Uuid,
    ) -> Result<Option<ReconciliationBatch>, AppError>;
    async fn mark_batch_completed(
        &self,
        batch_id: Uuid,
        counts: BatchCounts,
    ) -> Result<ReconciliationBatch, AppError>;
    /// Fail a batch, preserving whatever partial counts exist.
    async fn mark_batch_failed(
        &self,
        batch_id: Uuid,
        reason: &str,
        counts: Option<BatchCounts>,
    ) -> Result<ReconciliationBatch, AppError>;
    /// Oldest batch still waiting for a worker, if any.
    async fn next_pending_batch(&self) -> Result<Option<ReconciliationBatch>, AppError>;

    // Transactions
    /// Insert all parsed rows as one unit; a failure persists nothing.
    async fn insert_transactions(
        &self,
        batch_id: Uuid,
        rows: &[NewTransaction],
    ) -> Result<(), AppError>;
    async fn transactions_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<BankTransaction>, AppError>;
    async fn transaction_count(&self, batch_id: Uuid) -> Result<i64, AppError>;
    /// Terminal classification without a match (reversal, unmatched, error).
    async fn set_transaction_state(
        &self,
        transaction_id: Uuid,
        state: TransactionState,
    ) -> Result<(), AppError>;

    // Matches
    /// The confirmation applier: persist the confirmed match, update the
    /// transaction, and confirm the payment externally, as one unit.
    async fn apply_confirmed_match(
        &self,
        tx: &BankTransaction,
        candidate: &MatchCandidate,
        payments: &dyn PaymentStore,
    ) -> Result<ReconciliationMatch, ConfirmError>;
    /// Record an unconfirmed match and park the transaction for review.
    async fn create_pending_match(
        &self,
        tx: &BankTransaction,
        candidate: &MatchCandidate,
    ) -> Result<ReconciliationMatch, AppError>;
    async fn get_match(&self, match_id: Uuid) -> Result<Option<ReconciliationMatch>, AppError>;
    /// Staff approval of a pending match: confirm externally, flip the match
    /// to confirmed+manual, reclassify the transaction, adjust batch counts.
    async fn confirm_pending_match(
        &self,
        pending: &ReconciliationMatch,
        approver: &str,
        notes: Option<&str>,
        payments: &dyn PaymentStore,
    ) -> Result<ReconciliationMatch, ConfirmError>;
    /// Staff rejection (or collision cleanup): delete the pending match and
    /// reclassify the transaction unmatched, adjusting batch counts.
    async fn delete_pending_match(&self, pending: &ReconciliationMatch) -> Result<(), AppError>;

    // Audit log
    async fn append_log(&self, entry: NewLogEntry) -> Result<(), AppError>;
    async fn logs_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<ReconciliationLogEntry>, AppError>;

    // Property config
    async fn property_config(
        &self,
        property_id: Uuid,
    ) -> Result<Option<ReconciliationConfig>, AppError>;

    // Advisory per-property lock
    async fn try_acquire_property_lock(
        &self,
        property_id: Uuid,
        batch_id: Uuid,
    ) -> Result<bool, AppError>;
    async fn release_property_lock(&self, property_id: Uuid) -> Result<(), AppError>;
}

const BATCH_COLUMNS: &str = "batch_id, property_id, reconciliation_date, source_filename, \
     file_size_bytes, status, total_count, matched_count, unmatched_count, \
     pending_review_count, error_count, reversal_count, notes, error_detail, created_by, \
     created_utc, processing_started_utc, processing_completed_utc";

const TRANSACTION_COLUMNS: &str = "transaction_id, batch_id, row_number, transaction_date, \
     description, amount, original_currency, original_amount, reference, status, is_matched, \
     is_reversal, rate_missing, match_confidence, match_type, matched_payment_kind, \
     matched_payment_id, amount_difference, date_difference_days, created_utc";

const MATCH_COLUMNS: &str = "match_id, batch_id, transaction_id, payment_kind, \
     payment_external_id, match_type, confidence, amount_difference, date_difference_days, \
     is_confirmed, is_manual, approved_by, notes, matched_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl ReconciliationStore for Database {
    #[instrument(skip(self), fields(property_id = %new.property_id))]
    async fn create_batch(&self, new: NewBatch) -> Result<ReconciliationBatch, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_batch"])
            .start_timer();

        let batch = sqlx::query_as::<_, ReconciliationBatch>(&format!(
            r#"
            INSERT INTO reconciliation_batches
                (batch_id, property_id, reconciliation_date, source_filename, file_size_bytes, status, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {BATCH_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(new.property_id)
        .bind(new.reconciliation_date)
        .bind(&new.source_filename)
        .bind(new.file_size_bytes)
        .bind(BatchStatus::Pending.as_str())
        .bind(&new.created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create batch: {}", e)))?;

        timer.observe_duration();
        info!(batch_id = %batch.batch_id, "Reconciliation batch created");

        Ok(batch)
    }

    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<ReconciliationBatch>, AppError> {
        let batch = sqlx::query_as::<_, ReconciliationBatch>(&format!(
            "SELECT {BATCH_COLUMNS} FROM reconciliation_batches WHERE batch_id = $1",
        ))
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get batch: {}", e)))?;

        Ok(batch)
    }

    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn mark_batch_processing(
        &self,
        batch_id: Uuid,
    ) -> Result<Option<ReconciliationBatch>, AppError> {
        let batch = sqlx::query_as::<_, ReconciliationBatch>(&format!(
            r#"
            UPDATE reconciliation_batches
            SET status = $2, error_detail = NULL,
                processing_started_utc = NOW(), processing_completed_utc = NULL
            WHERE batch_id = $1 AND status IN ('pending', 'failed')
            RETURNING {BATCH_COLUMNS}
            "#,
        ))
        .bind(batch_id)
        .bind(BatchStatus::Processing.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark batch processing: {}", e))
        })?;

        Ok(batch)
    }

    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn mark_batch_completed(
        &self,
        batch_id: Uuid,
        counts: BatchCounts,
    ) -> Result<ReconciliationBatch, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_batch_completed"])
            .start_timer();

        let batch = sqlx::query_as::<_, ReconciliationBatch>(&format!(
            r#"
            UPDATE reconciliation_batches
            SET status = $2, total_count = $3, matched_count = $4, unmatched_count = $5,
                pending_review_count = $6, error_count = $7, reversal_count = $8,
                processing_completed_utc = NOW()
            WHERE batch_id = $1
            RETURNING {BATCH_COLUMNS}
            "#,
        ))
        .bind(batch_id)
        .bind(BatchStatus::Completed.as_str())
        .bind(counts.total)
        .bind(counts.matched)
        .bind(counts.unmatched)
        .bind(counts.pending_review)
        .bind(counts.error)
        .bind(counts.reversal)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to complete batch: {}", e))
        })?;

        timer.observe_duration();
        Ok(batch)
    }

    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn mark_batch_failed(
        &self,
        batch_id: Uuid,
        reason: &str,
        counts: Option<BatchCounts>,
    ) -> Result<ReconciliationBatch, AppError> {
        let counts = counts.unwrap_or_default();
        let batch = sqlx::query_as::<_, ReconciliationBatch>(&format!(
            r#"
            UPDATE reconciliation_batches
            SET status = $2, error_detail = $3, total_count = $4, matched_count = $5,
                unmatched_count = $6, pending_review_count = $7, error_count = $8,
                reversal_count = $9, processing_completed_utc = NOW()
            WHERE batch_id = $1
            RETURNING {BATCH_COLUMNS}
            "#,
        ))
        .bind(batch_id)
        .bind(BatchStatus::Failed.as_str())
        .bind(reason)
        .bind(counts.total)
        .bind(counts.matched)
        .bind(counts.unmatched)
        .bind(counts.pending_review)
        .bind(counts.error)
        .bind(counts.reversal)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to fail batch: {}", e)))?;

        Ok(batch)
    }

    #[instrument(skip(self))]
    async fn next_pending_batch(&self) -> Result<Option<ReconciliationBatch>, AppError> {
        let batch = sqlx::query_as::<_, ReconciliationBatch>(&format!(
            r#"
            SELECT {BATCH_COLUMNS}
            FROM reconciliation_batches
            WHERE status = 'pending'
            ORDER BY created_utc
            LIMIT 1
            "#,
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to poll pending batches: {}", e))
        })?;

        Ok(batch)
    }

    #[instrument(skip(self, rows), fields(batch_id = %batch_id, count = rows.len()))]
    async fn insert_transactions(
        &self,
        batch_id: Uuid,
        rows: &[NewTransaction],
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_transactions"])
            .start_timer();

        let mut txn = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO bank_transactions
                    (transaction_id, batch_id, row_number, transaction_date, description, amount,
                     original_currency, original_amount, reference, status, is_reversal, rate_missing)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(batch_id)
            .bind(row.row_number)
            .bind(row.transaction_date)
            .bind(&row.description)
            .bind(row.amount)
            .bind(&row.original_currency)
            .bind(row.original_amount)
            .bind(&row.reference)
            .bind(TransactionState::Unprocessed.as_str())
            .bind(row.amount < Decimal::ZERO)
            .bind(row.rate_missing)
            .execute(&mut *txn)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert transaction: {}", e))
            })?;
        }

        txn.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transactions: {}", e))
        })?;

        timer.observe_duration();
        info!(batch_id = %batch_id, count = rows.len(), "Statement rows ingested");

        Ok(())
    }

    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn transactions_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<BankTransaction>, AppError> {
        let rows = sqlx::query_as::<_, BankTransaction>(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM bank_transactions
            WHERE batch_id = $1
            ORDER BY row_number
            "#,
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load transactions: {}", e))
        })?;

        Ok(rows)
    }

    async fn transaction_count(&self, batch_id: Uuid) -> Result<i64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM bank_transactions WHERE batch_id = $1")
                .bind(batch_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!(
                        "Failed to count transactions: {}",
                        e
                    ))
                })?;
        Ok(count)
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id, state = state.as_str()))]
    async fn set_transaction_state(
        &self,
        transaction_id: Uuid,
        state: TransactionState,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE bank_transactions
            SET status = $2, is_reversal = (amount < 0 AND $2 = 'reversal') OR is_reversal
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .bind(state.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to set transaction state: {}", e))
        })?;

        Ok(())
    }

    #[instrument(
        skip(self, candidate, payments),
        fields(transaction_id = %tx.transaction_id, payment_id = %candidate.payment.external_id)
    )]
    async fn apply_confirmed_match(
        &self,
        tx: &BankTransaction,
        candidate: &MatchCandidate,
        payments: &dyn PaymentStore,
    ) -> Result<ReconciliationMatch, ConfirmError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_confirmed_match"])
            .start_timer();

        let mut txn = self.pool.begin().await.map_err(|e| {
            ConfirmError::Infra(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        let matched = sqlx::query_as::<_, ReconciliationMatch>(&format!(
            r#"
            INSERT INTO reconciliation_matches
                (match_id, batch_id, transaction_id, payment_kind, payment_external_id,
                 match_type, confidence, amount_difference, date_difference_days,
                 is_confirmed, is_manual)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE, FALSE)
            RETURNING {MATCH_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(tx.batch_id)
        .bind(tx.transaction_id)
        .bind(candidate.payment.kind.as_str())
        .bind(candidate.payment.external_id)
        .bind(candidate.match_type.as_str())
        .bind(candidate.confidence)
        .bind(candidate.amount_difference)
        .bind(candidate.date_difference_days as i32)
        .fetch_one(&mut *txn)
        .await
        .map_err(|e| {
            ConfirmError::Infra(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to insert match: {}",
                e
            )))
        })?;

        update_transaction_match_fields(
            &mut txn,
            tx.transaction_id,
            TransactionState::AutoMatched,
            true,
            candidate,
        )
        .await
        .map_err(ConfirmError::Infra)?;

        // The external confirm runs before commit: a rejected confirm rolls
        // the local writes back, so a transaction is never flagged matched
        // against a payment that was not actually confirmed.
        payments
            .confirm(candidate.payment.kind, candidate.payment.external_id)
            .await?;

        txn.commit().await.map_err(|e| {
            ConfirmError::Infra(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to commit match: {}",
                e
            )))
        })?;

        timer.observe_duration();
        info!(
            match_id = %matched.match_id,
            confidence = matched.confidence,
            "Confirmed match applied"
        );

        Ok(matched)
    }

    #[instrument(
        skip(self, candidate),
        fields(transaction_id = %tx.transaction_id, payment_id = %candidate.payment.external_id)
    )]
    async fn create_pending_match(
        &self,
        tx: &BankTransaction,
        candidate: &MatchCandidate,
    ) -> Result<ReconciliationMatch, AppError> {
        let mut txn = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let matched = sqlx::query_as::<_, ReconciliationMatch>(&format!(
            r#"
            INSERT INTO reconciliation_matches
                (match_id, batch_id, transaction_id, payment_kind, payment_external_id,
                 match_type, confidence, amount_difference, date_difference_days,
                 is_confirmed, is_manual)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, FALSE)
            RETURNING {MATCH_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(tx.batch_id)
        .bind(tx.transaction_id)
        .bind(candidate.payment.kind.as_str())
        .bind(candidate.payment.external_id)
        .bind(candidate.match_type.as_str())
        .bind(candidate.confidence)
        .bind(candidate.amount_difference)
        .bind(candidate.date_difference_days as i32)
        .fetch_one(&mut *txn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert pending match: {}", e))
        })?;

        update_transaction_match_fields(
            &mut txn,
            tx.transaction_id,
            TransactionState::PendingReview,
            false,
            candidate,
        )
        .await?;

        txn.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit pending match: {}", e))
        })?;

        Ok(matched)
    }

    async fn get_match(&self, match_id: Uuid) -> Result<Option<ReconciliationMatch>, AppError> {
        let matched = sqlx::query_as::<_, ReconciliationMatch>(&format!(
            "SELECT {MATCH_COLUMNS} FROM reconciliation_matches WHERE match_id = $1",
        ))
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get match: {}", e)))?;

        Ok(matched)
    }

    #[instrument(skip(self, payments), fields(match_id = %pending.match_id, approver = %approver))]
    async fn confirm_pending_match(
        &self,
        pending: &ReconciliationMatch,
        approver: &str,
        notes: Option<&str>,
        payments: &dyn PaymentStore,
    ) -> Result<ReconciliationMatch, ConfirmError> {
        let mut txn = self.pool.begin().await.map_err(|e| {
            ConfirmError::Infra(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        let matched = sqlx::query_as::<_, ReconciliationMatch>(&format!(
            r#"
            UPDATE reconciliation_matches
            SET is_confirmed = TRUE, is_manual = TRUE, approved_by = $2, notes = $3,
                matched_utc = NOW()
            WHERE match_id = $1 AND is_confirmed = FALSE
            RETURNING {MATCH_COLUMNS}
            "#,
        ))
        .bind(pending.match_id)
        .bind(approver)
        .bind(notes)
        .fetch_optional(&mut *txn)
        .await
        .map_err(|e| {
            ConfirmError::Infra(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to approve match: {}",
                e
            )))
        })?
        .ok_or_else(|| ConfirmError::NotConfirmable("match is not pending".to_string()))?;

        sqlx::query(
            r#"
            UPDATE bank_transactions
            SET status = $2, is_matched = TRUE
            WHERE transaction_id = $1
            "#,
        )
        .bind(pending.transaction_id)
        .bind(TransactionState::ManuallyMatched.as_str())
        .execute(&mut *txn)
        .await
        .map_err(|e| {
            ConfirmError::Infra(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to update transaction: {}",
                e
            )))
        })?;

        sqlx::query(
            r#"
            UPDATE reconciliation_batches
            SET matched_count = matched_count + 1,
                pending_review_count = pending_review_count - 1
            WHERE batch_id = $1
            "#,
        )
        .bind(pending.batch_id)
        .execute(&mut *txn)
        .await
        .map_err(|e| {
            ConfirmError::Infra(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to adjust batch counts: {}",
                e
            )))
        })?;

        payments
            .confirm(
                PaymentKind::from_str(&pending.payment_kind),
                pending.payment_external_id,
            )
            .await?;

        txn.commit().await.map_err(|e| {
            ConfirmError::Infra(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to commit approval: {}",
                e
            )))
        })?;

        Ok(matched)
    }

    #[instrument(skip(self), fields(match_id = %pending.match_id))]
    async fn delete_pending_match(&self, pending: &ReconciliationMatch) -> Result<(), AppError> {
        let mut txn = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let result = sqlx::query(
            "DELETE FROM reconciliation_matches WHERE match_id = $1 AND is_confirmed = FALSE",
        )
        .bind(pending.match_id)
        .execute(&mut *txn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to delete match: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "match {} is not pending",
                pending.match_id
            )));
        }

        sqlx::query(
            r#"
            UPDATE bank_transactions
            SET status = $2, is_matched = FALSE, match_confidence = NULL, match_type = NULL,
                matched_payment_kind = NULL, matched_payment_id = NULL,
                amount_difference = NULL, date_difference_days = NULL
            WHERE transaction_id = $1
            "#,
        )
        .bind(pending.transaction_id)
        .bind(TransactionState::Unmatched.as_str())
        .execute(&mut *txn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to reclassify transaction: {}", e))
        })?;

        sqlx::query(
            r#"
            UPDATE reconciliation_batches
            SET unmatched_count = unmatched_count + 1,
                pending_review_count = pending_review_count - 1
            WHERE batch_id = $1
            "#,
        )
        .bind(pending.batch_id)
        .execute(&mut *txn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to adjust batch counts: {}", e))
        })?;

        txn.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit rejection: {}", e))
        })?;

        Ok(())
    }

    async fn append_log(&self, entry: NewLogEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_log
                (log_id, batch_id, transaction_id, match_id, event, description, details,
                 confidence, actor)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.batch_id)
        .bind(entry.transaction_id)
        .bind(entry.match_id)
        .bind(entry.event.as_str())
        .bind(&entry.description)
        .bind(&entry.details)
        .bind(entry.confidence)
        .bind(&entry.actor)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to append log: {}", e)))?;

        Ok(())
    }

    async fn logs_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<ReconciliationLogEntry>, AppError> {
        let entries = sqlx::query_as::<_, ReconciliationLogEntry>(
            r#"
            SELECT log_id, batch_id, transaction_id, match_id, event, description, details,
                   confidence, actor, created_utc
            FROM reconciliation_log
            WHERE batch_id = $1
            ORDER BY created_utc
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load log: {}", e)))?;

        Ok(entries)
    }

    #[instrument(skip(self), fields(property_id = %property_id))]
    async fn property_config(
        &self,
        property_id: Uuid,
    ) -> Result<Option<ReconciliationConfig>, AppError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT config FROM property_configs WHERE property_id = $1")
                .bind(property_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!(
                        "Failed to load property config: {}",
                        e
                    ))
                })?;

        match row {
            Some((value,)) => {
                let config = serde_json::from_value(value).map_err(|e| {
                    AppError::ConfigError(anyhow::anyhow!(
                        "Stored config for property {} is invalid: {}",
                        property_id,
                        e
                    ))
                })?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(property_id = %property_id, batch_id = %batch_id))]
    async fn try_acquire_property_lock(
        &self,
        property_id: Uuid,
        batch_id: Uuid,
    ) -> Result<bool, AppError> {
        // Reap a stale lock left by a crashed worker.
        sqlx::query(
            r#"
            DELETE FROM reconciliation_locks
            WHERE property_id = $1 AND locked_utc < NOW() - INTERVAL '1 hour'
            "#,
        )
        .bind(property_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to reap stale lock: {}", e))
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO reconciliation_locks (property_id, batch_id, locked_utc)
            VALUES ($1, $2, NOW())
            ON CONFLICT (property_id) DO NOTHING
            "#,
        )
        .bind(property_id)
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to acquire property lock: {}", e))
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_property_lock(&self, property_id: Uuid) -> Result<(), AppError> {
        sqlx::query("DELETE FROM reconciliation_locks WHERE property_id = $1")
            .bind(property_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to release property lock: {}",
                    e
                ))
            })?;
        Ok(())
    }
}

async fn update_transaction_match_fields(
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    transaction_id: Uuid,
    state: TransactionState,
    is_matched: bool,
    candidate: &MatchCandidate,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE bank_transactions
        SET status = $2, is_matched = $3, match_confidence = $4, match_type = $5,
            matched_payment_kind = $6, matched_payment_id = $7,
            amount_difference = $8, date_difference_days = $9
        WHERE transaction_id = $1
        "#,
    )
    .bind(transaction_id)
    .bind(state.as_str())
    .bind(is_matched)
    .bind(candidate.confidence)
    .bind(candidate.match_type.as_str())
    .bind(candidate.payment.kind.as_str())
    .bind(candidate.payment.external_id)
    .bind(candidate.amount_difference)
    .bind(candidate.date_difference_days as i32)
    .execute(&mut **txn)
    .await
    .map_err(|e| {
        AppError::DatabaseError(anyhow::anyhow!("Failed to update transaction: {}", e))
    })?;

    Ok(())
}
