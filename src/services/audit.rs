//! Audit log writer and the alert notification seam.
//!
//! Every engine decision lands here as one immutable log entry. The entry
//! body pairs a fixed event kind with a human-readable description and a
//! JSON details payload for downstream tooling.

use crate::error::AppError;
use crate::models::{
    BankTransaction, LogEvent, ReconciliationBatch, ReconciliationMatch, UnmatchedAlert,
};
use crate::services::database::{BatchCounts, NewLogEntry, ReconciliationStore};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Delivery seam for post-completion alerts. The worker binary wires a
/// tracing-based notifier; delivery mechanics belong to the notification
/// collaborator.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify_unmatched(&self, alert: &UnmatchedAlert) -> Result<(), AppError>;
}

/// Notifier that surfaces alerts as structured warning events.
pub struct TracingAlertNotifier;

#[async_trait]
impl AlertNotifier for TracingAlertNotifier {
    async fn notify_unmatched(&self, alert: &UnmatchedAlert) -> Result<(), AppError> {
        warn!(
            property_id = %alert.property_id,
            batch_id = %alert.batch_id,
            unmatched_percentage = alert.unmatched_percentage,
            "Unmatched rate exceeded the alert threshold"
        );
        Ok(())
    }
}

/// Append-only writer over the store's log table.
pub struct AuditLog {
    store: Arc<dyn ReconciliationStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn ReconciliationStore>) -> Self {
        Self { store }
    }

    pub async fn batch_created(&self, batch: &ReconciliationBatch) -> Result<(), AppError> {
        self.store
            .append_log(NewLogEntry {
                batch_id: batch.batch_id,
                transaction_id: None,
                match_id: None,
                event: LogEvent::BatchCreated,
                description: format!("Batch created from '{}'", batch.source_filename),
                details: json!({
                    "property_id": batch.property_id,
                    "source_filename": batch.source_filename,
                    "file_size_bytes": batch.file_size_bytes,
                }),
                confidence: None,
                actor: batch.created_by.clone(),
            })
            .await
    }

    pub async fn processing_started(&self, batch_id: Uuid) -> Result<(), AppError> {
        self.store
            .append_log(NewLogEntry {
                batch_id,
                transaction_id: None,
                match_id: None,
                event: LogEvent::ProcessingStarted,
                description: "Batch processing started".to_string(),
                details: json!({}),
                confidence: None,
                actor: None,
            })
            .await
    }

    pub async fn reversal_detected(&self, tx: &BankTransaction) -> Result<(), AppError> {
        self.store
            .append_log(NewLogEntry {
                batch_id: tx.batch_id,
                transaction_id: Some(tx.transaction_id),
                match_id: None,
                event: LogEvent::ReversalDetected,
                description: format!("Row {} is a reversal of {}", tx.row_number, tx.amount),
                details: json!({
                    "row_number": tx.row_number,
                    "amount": tx.amount,
                    "description": tx.description,
                }),
                confidence: None,
                actor: None,
            })
            .await
    }

    pub async fn auto_matched(
        &self,
        tx: &BankTransaction,
        matched: &ReconciliationMatch,
    ) -> Result<(), AppError> {
        self.store
            .append_log(NewLogEntry {
                batch_id: tx.batch_id,
                transaction_id: Some(tx.transaction_id),
                match_id: Some(matched.match_id),
                event: LogEvent::AutoMatched,
                description: format!(
                    "Row {} auto-matched to {} payment {} ({})",
                    tx.row_number, matched.payment_kind, matched.payment_external_id, matched.match_type
                ),
                details: json!({
                    "row_number": tx.row_number,
                    "payment_kind": matched.payment_kind,
                    "payment_external_id": matched.payment_external_id,
                    "match_type": matched.match_type,
                    "amount_difference": matched.amount_difference,
                    "date_difference_days": matched.date_difference_days,
                }),
                confidence: Some(matched.confidence),
                actor: None,
            })
            .await
    }

    pub async fn pending_review(
        &self,
        tx: &BankTransaction,
        matched: &ReconciliationMatch,
    ) -> Result<(), AppError> {
        self.store
            .append_log(NewLogEntry {
                batch_id: tx.batch_id,
                transaction_id: Some(tx.transaction_id),
                match_id: Some(matched.match_id),
                event: LogEvent::PendingReview,
                description: format!(
                    "Row {} queued for review against {} payment {}",
                    tx.row_number, matched.payment_kind, matched.payment_external_id
                ),
                details: json!({
                    "row_number": tx.row_number,
                    "payment_kind": matched.payment_kind,
                    "payment_external_id": matched.payment_external_id,
                    "match_type": matched.match_type,
                    "rate_missing": tx.rate_missing,
                }),
                confidence: Some(matched.confidence),
                actor: None,
            })
            .await
    }

    pub async fn unmatched(
        &self,
        tx: &BankTransaction,
        best_confidence: Option<f64>,
        reason: &str,
    ) -> Result<(), AppError> {
        self.store
            .append_log(NewLogEntry {
                batch_id: tx.batch_id,
                transaction_id: Some(tx.transaction_id),
                match_id: None,
                event: LogEvent::Unmatched,
                description: format!("Row {} unmatched: {}", tx.row_number, reason),
                details: json!({
                    "row_number": tx.row_number,
                    "amount": tx.amount,
                    "transaction_date": tx.transaction_date,
                    "reason": reason,
                }),
                confidence: best_confidence,
                actor: None,
            })
            .await
    }

    pub async fn payment_already_claimed(
        &self,
        tx: &BankTransaction,
        payment_kind: &str,
        payment_external_id: Uuid,
        confidence: f64,
    ) -> Result<(), AppError> {
        self.store
            .append_log(NewLogEntry {
                batch_id: tx.batch_id,
                transaction_id: Some(tx.transaction_id),
                match_id: None,
                event: LogEvent::PaymentAlreadyClaimed,
                description: format!(
                    "Row {} best candidate {} payment {} was already claimed",
                    tx.row_number, payment_kind, payment_external_id
                ),
                details: json!({
                    "row_number": tx.row_number,
                    "payment_kind": payment_kind,
                    "payment_external_id": payment_external_id,
                }),
                confidence: Some(confidence),
                actor: None,
            })
            .await
    }

    pub async fn rate_unavailable(&self, tx: &BankTransaction) -> Result<(), AppError> {
        self.store
            .append_log(NewLogEntry {
                batch_id: tx.batch_id,
                transaction_id: Some(tx.transaction_id),
                match_id: None,
                event: LogEvent::RateUnavailable,
                description: format!(
                    "Row {} stated in {} with no usable exchange rate",
                    tx.row_number, tx.original_currency
                ),
                details: json!({
                    "row_number": tx.row_number,
                    "original_currency": tx.original_currency,
                    "amount": tx.amount,
                }),
                confidence: None,
                actor: None,
            })
            .await
    }

    pub async fn transaction_error(
        &self,
        tx: &BankTransaction,
        message: &str,
    ) -> Result<(), AppError> {
        self.store
            .append_log(NewLogEntry {
                batch_id: tx.batch_id,
                transaction_id: Some(tx.transaction_id),
                match_id: None,
                event: LogEvent::TransactionError,
                description: format!("Row {} failed: {}", tx.row_number, message),
                details: json!({
                    "row_number": tx.row_number,
                    "error": message,
                }),
                confidence: None,
                actor: None,
            })
            .await
    }

    pub async fn batch_completed(
        &self,
        batch_id: Uuid,
        counts: BatchCounts,
    ) -> Result<(), AppError> {
        self.store
            .append_log(NewLogEntry {
                batch_id,
                transaction_id: None,
                match_id: None,
                event: LogEvent::BatchCompleted,
                description: format!(
                    "Batch completed: {} matched, {} pending review, {} unmatched of {}",
                    counts.matched, counts.pending_review, counts.unmatched, counts.total
                ),
                details: json!({
                    "total": counts.total,
                    "matched": counts.matched,
                    "unmatched": counts.unmatched,
                    "pending_review": counts.pending_review,
                    "error": counts.error,
                    "reversal": counts.reversal,
                }),
                confidence: None,
                actor: None,
            })
            .await
    }

    pub async fn batch_failed(&self, batch_id: Uuid, reason: &str) -> Result<(), AppError> {
        self.store
            .append_log(NewLogEntry {
                batch_id,
                transaction_id: None,
                match_id: None,
                event: LogEvent::BatchFailed,
                description: format!("Batch failed: {}", reason),
                details: json!({ "reason": reason }),
                confidence: None,
                actor: None,
            })
            .await
    }

    pub async fn manual_match_approved(
        &self,
        matched: &ReconciliationMatch,
        approver: &str,
    ) -> Result<(), AppError> {
        self.store
            .append_log(NewLogEntry {
                batch_id: matched.batch_id,
                transaction_id: Some(matched.transaction_id),
                match_id: Some(matched.match_id),
                event: LogEvent::ManualMatchApproved,
                description: format!(
                    "Pending match against {} payment {} approved",
                    matched.payment_kind, matched.payment_external_id
                ),
                details: json!({
                    "payment_kind": matched.payment_kind,
                    "payment_external_id": matched.payment_external_id,
                    "notes": matched.notes,
                }),
                confidence: Some(matched.confidence),
                actor: Some(approver.to_string()),
            })
            .await
    }

    pub async fn manual_match_rejected(
        &self,
        rejected: &ReconciliationMatch,
        approver: &str,
        notes: Option<&str>,
    ) -> Result<(), AppError> {
        self.store
            .append_log(NewLogEntry {
                batch_id: rejected.batch_id,
                transaction_id: Some(rejected.transaction_id),
                match_id: Some(rejected.match_id),
                event: LogEvent::ManualMatchRejected,
                description: format!(
                    "Pending match against {} payment {} rejected",
                    rejected.payment_kind, rejected.payment_external_id
                ),
                details: json!({
                    "payment_kind": rejected.payment_kind,
                    "payment_external_id": rejected.payment_external_id,
                    "notes": notes,
                }),
                confidence: Some(rejected.confidence),
                actor: Some(approver.to_string()),
            })
            .await
    }

    pub async fn alert_raised(&self, alert: &UnmatchedAlert) -> Result<(), AppError> {
        self.store
            .append_log(NewLogEntry {
                batch_id: alert.batch_id,
                transaction_id: None,
                match_id: None,
                event: LogEvent::AlertRaised,
                description: format!(
                    "Unmatched rate {:.1}% exceeded the alert threshold",
                    alert.unmatched_percentage
                ),
                details: json!({
                    "property_id": alert.property_id,
                    "unmatched_percentage": alert.unmatched_percentage,
                }),
                confidence: None,
                actor: None,
            })
            .await
    }
}
