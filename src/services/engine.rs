//! Reconciliation engine: the batch state machine.
//!
//! One `process_batch` call drives a batch from pending through ingestion,
//! scoring, and classification to completed or failed. All side effects go
//! through the store, payment, file, and notifier seams, so the engine itself
//! holds no connection state and tests can drive it entirely in memory.

use crate::config::ReconciliationConfig;
use crate::error::{AppError, ConfirmError};
use crate::models::{
    BankTransaction, BatchStatus, BatchSummary, NewBatch, PaymentKind, PendingPayment,
    ReconciliationBatch, ReconciliationMatch, TransactionState, UnmatchedAlert,
};
use crate::services::audit::{AlertNotifier, AuditLog};
use crate::services::csv_import;
use crate::services::currency;
use crate::services::database::{BatchCounts, NewTransaction, ReconciliationStore};
use crate::services::metrics::{
    ALERTS_RAISED, BATCH_RUNS, REVIEW_DECISIONS, TRANSACTIONS_CLASSIFIED,
};
use crate::services::payments::PaymentStore;
use crate::services::scorer;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Statement file collaborator seam. Upload and storage mechanics live
/// elsewhere; the engine only fetches the bytes it was told about.
#[async_trait]
pub trait StatementFiles: Send + Sync {
    async fn fetch(&self, property_id: Uuid, filename: &str) -> Result<Vec<u8>, AppError>;
}

/// Reads statements from `<root>/<property_id>/<filename>`, the layout the
/// upload collaborator writes into.
pub struct LocalStatementFiles {
    root: PathBuf,
}

impl LocalStatementFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StatementFiles for LocalStatementFiles {
    async fn fetch(&self, property_id: Uuid, filename: &str) -> Result<Vec<u8>, AppError> {
        let path = self.root.join(property_id.to_string()).join(filename);
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound(anyhow::anyhow!("statement file {} not found", path.display()))
            } else {
                AppError::from(e)
            }
        })
    }
}

/// Engine tunables supplied by the worker configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Soft wall-clock budget for one batch run.
    pub batch_timeout: Duration,
    /// Base currency assumed when a property has no stored configuration.
    pub default_currency: String,
}

pub struct ReconciliationEngine {
    store: Arc<dyn ReconciliationStore>,
    payments: Arc<dyn PaymentStore>,
    files: Arc<dyn StatementFiles>,
    notifier: Arc<dyn AlertNotifier>,
    settings: EngineSettings,
    audit: AuditLog,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn ReconciliationStore>,
        payments: Arc<dyn PaymentStore>,
        files: Arc<dyn StatementFiles>,
        notifier: Arc<dyn AlertNotifier>,
        settings: EngineSettings,
    ) -> Self {
        let audit = AuditLog::new(store.clone());
        Self {
            store,
            payments,
            files,
            notifier,
            settings,
            audit,
        }
    }

    /// Record an uploaded statement as a pending batch.
    #[instrument(skip(self, new), fields(property_id = %new.property_id))]
    pub async fn create_batch(&self, new: NewBatch) -> Result<ReconciliationBatch, AppError> {
        let batch = self.store.create_batch(new).await?;
        self.audit.batch_created(&batch).await?;
        Ok(batch)
    }

    /// Run one batch to a terminal state. Completed batches return as-is;
    /// a batch already processing, or another batch holding the property
    /// lock, is a retryable conflict.
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn process_batch(&self, batch_id: Uuid) -> Result<ReconciliationBatch, AppError> {
        let batch = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("batch {} not found", batch_id)))?;

        match batch.status() {
            BatchStatus::Completed => {
                info!(batch_id = %batch_id, "Batch already completed");
                return Ok(batch);
            }
            BatchStatus::Processing => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "batch {} is already processing",
                    batch_id
                )));
            }
            BatchStatus::Pending | BatchStatus::Failed => {}
        }

        if !self
            .store
            .try_acquire_property_lock(batch.property_id, batch_id)
            .await?
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "property {} is already being reconciled",
                batch.property_id
            )));
        }

        let result = self.run_locked(&batch).await;

        if let Err(e) = self.store.release_property_lock(batch.property_id).await {
            error!(property_id = %batch.property_id, error = %e, "Failed to release property lock");
        }

        match &result {
            Ok(b) => BATCH_RUNS.with_label_values(&[b.status.as_str()]).inc(),
            Err(_) => BATCH_RUNS.with_label_values(&["error"]).inc(),
        }

        result
    }

    async fn run_locked(
        &self,
        batch: &ReconciliationBatch,
    ) -> Result<ReconciliationBatch, AppError> {
        let config = match self.store.property_config(batch.property_id).await? {
            Some(config) => config,
            None => ReconciliationConfig::default_for(&self.settings.default_currency),
        };
        if let Err(e) = config.validate() {
            return self
                .fail_batch(batch.batch_id, &format!("invalid configuration: {}", e), None)
                .await;
        }

        let batch = self
            .store
            .mark_batch_processing(batch.batch_id)
            .await?
            .ok_or_else(|| {
                AppError::Conflict(anyhow::anyhow!(
                    "batch {} changed state before processing",
                    batch.batch_id
                ))
            })?;
        self.audit.processing_started(batch.batch_id).await?;

        if self.store.transaction_count(batch.batch_id).await? == 0 {
            let bytes = match self
                .files
                .fetch(batch.property_id, &batch.source_filename)
                .await
            {
                Ok(bytes) => bytes,
                Err(AppError::NotFound(e)) => {
                    return self
                        .fail_batch(
                            batch.batch_id,
                            &format!("statement ingestion failed: {}", e),
                            None,
                        )
                        .await;
                }
                Err(e) => return Err(e),
            };

            let rows = match csv_import::parse_statement(&bytes, &config) {
                Ok(rows) => rows,
                Err(e) => {
                    return self
                        .fail_batch(
                            batch.batch_id,
                            &format!("statement ingestion failed: {}", e),
                            None,
                        )
                        .await;
                }
            };

            let new_rows: Vec<NewTransaction> = rows
                .into_iter()
                .map(|row| {
                    let normalized =
                        currency::normalize(row.amount, &row.currency, row.date, &config);
                    NewTransaction {
                        row_number: row.row_number as i32,
                        transaction_date: row.date,
                        description: row.description,
                        amount: normalized.amount,
                        original_currency: row.currency,
                        original_amount: normalized.original_amount,
                        reference: row.reference,
                        rate_missing: normalized.rate_missing,
                    }
                })
                .collect();

            self.store
                .insert_transactions(batch.batch_id, &new_rows)
                .await?;
        }

        let pending = self.payments.pending_for_property(batch.property_id).await?;
        let transactions = self.store.transactions_for_batch(batch.batch_id).await?;

        let deadline = Instant::now() + self.settings.batch_timeout;
        let mut counts = BatchCounts {
            total: transactions.len() as i32,
            ..Default::default()
        };
        // Payments confirmed within this run (or by an earlier run of this
        // batch). First claimant in file order wins.
        let mut claimed: HashSet<(PaymentKind, Uuid)> = HashSet::new();

        for tx in &transactions {
            let state = tx.state();
            if state.is_terminal() {
                tally(&mut counts, state);
                if let (Some(kind), Some(id)) = (&tx.matched_payment_kind, tx.matched_payment_id)
                {
                    if tx.is_matched {
                        claimed.insert((PaymentKind::from_str(kind), id));
                    }
                }
                continue;
            }

            if Instant::now() >= deadline {
                warn!(batch_id = %batch.batch_id, "Batch processing timed out");
                return self
                    .fail_batch(batch.batch_id, "processing timed out", Some(counts))
                    .await;
            }

            let outcome = self
                .process_transaction(tx, &pending, &config, &mut claimed)
                .await;
            match outcome {
                Ok(state) => tally(&mut counts, state),
                Err(e) => {
                    error!(
                        batch_id = %batch.batch_id,
                        row_number = tx.row_number,
                        error = %e,
                        "Transaction processing failed"
                    );
                    self.store
                        .set_transaction_state(tx.transaction_id, TransactionState::Error)
                        .await?;
                    self.audit.transaction_error(tx, &e.to_string()).await?;
                    TRANSACTIONS_CLASSIFIED
                        .with_label_values(&[TransactionState::Error.as_str()])
                        .inc();
                    counts.error += 1;
                }
            }
        }

        let completed = self.store.mark_batch_completed(batch.batch_id, counts).await?;
        self.audit.batch_completed(batch.batch_id, counts).await?;
        info!(
            batch_id = %batch.batch_id,
            total = counts.total,
            matched = counts.matched,
            unmatched = counts.unmatched,
            pending_review = counts.pending_review,
            "Batch completed"
        );

        self.maybe_alert(&completed, &config).await?;

        Ok(completed)
    }

    async fn process_transaction(
        &self,
        tx: &BankTransaction,
        pending: &[PendingPayment],
        config: &ReconciliationConfig,
        claimed: &mut HashSet<(PaymentKind, Uuid)>,
    ) -> Result<TransactionState, AppError> {
        if tx.amount < Decimal::ZERO {
            self.store
                .set_transaction_state(tx.transaction_id, TransactionState::Reversal)
                .await?;
            self.audit.reversal_detected(tx).await?;
            TRANSACTIONS_CLASSIFIED
                .with_label_values(&[TransactionState::Reversal.as_str()])
                .inc();
            return Ok(TransactionState::Reversal);
        }

        if tx.rate_missing {
            self.audit.rate_unavailable(tx).await?;
        }

        let candidate = scorer::best_candidate(tx.amount, tx.transaction_date, pending, config);

        let state = match candidate {
            None => {
                self.store
                    .set_transaction_state(tx.transaction_id, TransactionState::Unmatched)
                    .await?;
                self.audit
                    .unmatched(tx, None, "no candidate within tolerances")
                    .await?;
                TransactionState::Unmatched
            }
            Some(candidate) => {
                let key = (candidate.payment.kind, candidate.payment.external_id);
                if claimed.contains(&key) {
                    self.store
                        .set_transaction_state(tx.transaction_id, TransactionState::Unmatched)
                        .await?;
                    self.audit
                        .payment_already_claimed(
                            tx,
                            candidate.payment.kind.as_str(),
                            candidate.payment.external_id,
                            candidate.confidence,
                        )
                        .await?;
                    TransactionState::Unmatched
                } else if candidate.confidence >= config.auto_confirm_threshold
                    && !tx.rate_missing
                {
                    match self
                        .store
                        .apply_confirmed_match(tx, &candidate, self.payments.as_ref())
                        .await
                    {
                        Ok(matched) => {
                            claimed.insert(key);
                            self.audit.auto_matched(tx, &matched).await?;
                            TransactionState::AutoMatched
                        }
                        Err(ConfirmError::AlreadyClaimed(reason))
                        | Err(ConfirmError::NotConfirmable(reason)) => {
                            warn!(
                                transaction_id = %tx.transaction_id,
                                reason = %reason,
                                "Confirmation rejected; reclassifying unmatched"
                            );
                            self.store
                                .set_transaction_state(
                                    tx.transaction_id,
                                    TransactionState::Unmatched,
                                )
                                .await?;
                            self.audit
                                .unmatched(tx, Some(candidate.confidence), &reason)
                                .await?;
                            TransactionState::Unmatched
                        }
                        Err(ConfirmError::Infra(e)) => return Err(e),
                    }
                } else if candidate.confidence >= config.pending_review_threshold {
                    let matched = self.store.create_pending_match(tx, &candidate).await?;
                    self.audit.pending_review(tx, &matched).await?;
                    TransactionState::PendingReview
                } else {
                    self.store
                        .set_transaction_state(tx.transaction_id, TransactionState::Unmatched)
                        .await?;
                    self.audit
                        .unmatched(
                            tx,
                            Some(candidate.confidence),
                            "best candidate below review threshold",
                        )
                        .await?;
                    TransactionState::Unmatched
                }
            }
        };

        TRANSACTIONS_CLASSIFIED
            .with_label_values(&[state.as_str()])
            .inc();
        Ok(state)
    }

    async fn maybe_alert(
        &self,
        batch: &ReconciliationBatch,
        config: &ReconciliationConfig,
    ) -> Result<(), AppError> {
        if batch.total_count == 0 {
            return Ok(());
        }
        let unmatched_fraction = batch.unmatched_count as f64 / batch.total_count as f64;
        if unmatched_fraction <= config.unmatched_alert_threshold {
            return Ok(());
        }

        let alert = UnmatchedAlert {
            property_id: batch.property_id,
            batch_id: batch.batch_id,
            unmatched_percentage: unmatched_fraction * 100.0,
        };
        self.notifier.notify_unmatched(&alert).await?;
        self.audit.alert_raised(&alert).await?;
        ALERTS_RAISED.inc();
        Ok(())
    }

    async fn fail_batch(
        &self,
        batch_id: Uuid,
        reason: &str,
        counts: Option<BatchCounts>,
    ) -> Result<ReconciliationBatch, AppError> {
        warn!(batch_id = %batch_id, reason = %reason, "Batch failed");
        let failed = self.store.mark_batch_failed(batch_id, reason, counts).await?;
        self.audit.batch_failed(batch_id, reason).await?;
        Ok(failed)
    }

    /// Staff approval of a pending-review match.
    #[instrument(skip(self, notes), fields(match_id = %match_id, approver = %approver))]
    pub async fn approve_match(
        &self,
        match_id: Uuid,
        approver: &str,
        notes: Option<&str>,
    ) -> Result<ReconciliationMatch, AppError> {
        let pending = self
            .store
            .get_match(match_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("match {} not found", match_id)))?;
        if pending.is_confirmed {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "match {} is already confirmed",
                match_id
            )));
        }

        let confirmed = self
            .store
            .confirm_pending_match(&pending, approver, notes, self.payments.as_ref())
            .await
            .map_err(|e| match e {
                ConfirmError::Infra(inner) => inner,
                other => AppError::Conflict(anyhow::anyhow!("{}", other)),
            })?;
        self.audit.manual_match_approved(&confirmed, approver).await?;
        REVIEW_DECISIONS.with_label_values(&["approved"]).inc();

        Ok(confirmed)
    }

    /// Staff rejection of a pending-review match. The match row is deleted
    /// and the transaction goes back to unmatched.
    #[instrument(skip(self, notes), fields(match_id = %match_id, approver = %approver))]
    pub async fn reject_match(
        &self,
        match_id: Uuid,
        approver: &str,
        notes: Option<&str>,
    ) -> Result<(), AppError> {
        let pending = self
            .store
            .get_match(match_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("match {} not found", match_id)))?;
        if pending.is_confirmed {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "match {} is already confirmed",
                match_id
            )));
        }

        self.store.delete_pending_match(&pending).await?;
        self.audit
            .manual_match_rejected(&pending, approver, notes)
            .await?;
        REVIEW_DECISIONS.with_label_values(&["rejected"]).inc();

        Ok(())
    }

    pub async fn batch_summary(&self, batch_id: Uuid) -> Result<BatchSummary, AppError> {
        let batch = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("batch {} not found", batch_id)))?;
        Ok(batch.summary())
    }
}

fn tally(counts: &mut BatchCounts, state: TransactionState) {
    match state {
        TransactionState::AutoMatched | TransactionState::ManuallyMatched => counts.matched += 1,
        TransactionState::Unmatched => counts.unmatched += 1,
        TransactionState::PendingReview => counts.pending_review += 1,
        TransactionState::Error => counts.error += 1,
        TransactionState::Reversal => counts.reversal += 1,
        TransactionState::Unprocessed => {}
    }
}
