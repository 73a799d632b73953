//! Domain models for property-reconciliation.

#![allow(clippy::should_implement_trait)]

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Batch Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Completed and failed are terminal; failed batches may be resubmitted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One CSV upload for one property on one date.
#[derive(Debug, Clone, FromRow)]
pub struct ReconciliationBatch {
    pub batch_id: Uuid,
    pub property_id: Uuid,
    pub reconciliation_date: NaiveDate,
    pub source_filename: String,
    pub file_size_bytes: i64,
    pub status: String,
    pub total_count: i32,
    pub matched_count: i32,
    pub unmatched_count: i32,
    pub pending_review_count: i32,
    pub error_count: i32,
    pub reversal_count: i32,
    pub notes: Option<String>,
    pub error_detail: Option<String>,
    pub created_by: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub processing_started_utc: Option<DateTime<Utc>>,
    pub processing_completed_utc: Option<DateTime<Utc>>,
}

impl ReconciliationBatch {
    pub fn status(&self) -> BatchStatus {
        BatchStatus::from_str(&self.status)
    }

    pub fn summary(&self) -> BatchSummary {
        let match_percentage = if self.total_count > 0 {
            (self.matched_count as f64 / self.total_count as f64) * 100.0
        } else {
            0.0
        };
        BatchSummary {
            batch_id: self.batch_id,
            total: self.total_count,
            matched: self.matched_count,
            pending_review: self.pending_review_count,
            unmatched: self.unmatched_count,
            errors: self.error_count,
            reversals: self.reversal_count,
            match_percentage,
            needs_manual_review: self.pending_review_count > 0 || self.error_count > 0,
        }
    }
}

/// Upload metadata from the upload collaborator; everything needed to record
/// a batch as pending.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub property_id: Uuid,
    pub reconciliation_date: NaiveDate,
    pub source_filename: String,
    pub file_size_bytes: i64,
    pub created_by: Option<String>,
}

/// Result surface exposed to collaborators after a batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub total: i32,
    pub matched: i32,
    pub pending_review: i32,
    pub unmatched: i32,
    pub errors: i32,
    pub reversals: i32,
    pub match_percentage: f64,
    pub needs_manual_review: bool,
}

// ============================================================================
// Transaction Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Unprocessed,
    Reversal,
    AutoMatched,
    PendingReview,
    ManuallyMatched,
    Unmatched,
    Error,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Reversal => "reversal",
            Self::AutoMatched => "auto_matched",
            Self::PendingReview => "pending_review",
            Self::ManuallyMatched => "manually_matched",
            Self::Unmatched => "unmatched",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "unprocessed" => Self::Unprocessed,
            "reversal" => Self::Reversal,
            "auto_matched" => Self::AutoMatched,
            "pending_review" => Self::PendingReview,
            "manually_matched" => Self::ManuallyMatched,
            "unmatched" => Self::Unmatched,
            "error" => Self::Error,
            _ => Self::Unprocessed,
        }
    }

    /// Terminal within a batch run. PendingReview still transitions via staff
    /// action, but reprocessing never touches it again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Unprocessed)
    }
}

/// One parsed statement row, owned by exactly one batch.
#[derive(Debug, Clone, FromRow)]
pub struct BankTransaction {
    pub transaction_id: Uuid,
    pub batch_id: Uuid,
    /// 1-indexed position in the source file.
    pub row_number: i32,
    pub transaction_date: NaiveDate,
    pub description: String,
    /// Signed amount in the base currency, unless `rate_missing`.
    pub amount: Decimal,
    pub original_currency: String,
    /// Set when a foreign amount could not be converted.
    pub original_amount: Option<Decimal>,
    pub reference: Option<String>,
    pub status: String,
    pub is_matched: bool,
    pub is_reversal: bool,
    pub rate_missing: bool,
    pub match_confidence: Option<f64>,
    pub match_type: Option<String>,
    pub matched_payment_kind: Option<String>,
    pub matched_payment_id: Option<Uuid>,
    pub amount_difference: Option<Decimal>,
    pub date_difference_days: Option<i32>,
    pub created_utc: DateTime<Utc>,
}

impl BankTransaction {
    pub fn state(&self) -> TransactionState {
        TransactionState::from_str(&self.status)
    }
}

// ============================================================================
// Match Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Exact,
    Fuzzy,
    Partial,
    Manual,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
            Self::Partial => "partial",
            Self::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "exact" => Self::Exact,
            "fuzzy" => Self::Fuzzy,
            "partial" => Self::Partial,
            "manual" => Self::Manual,
            _ => Self::Manual,
        }
    }

    /// Lower ranks outrank higher ones when confidences tie.
    pub fn tier_rank(&self) -> u8 {
        match self {
            Self::Exact => 0,
            Self::Fuzzy => 1,
            Self::Partial => 2,
            Self::Manual => 3,
        }
    }
}

/// A proposed or confirmed pairing between a bank transaction and an
/// external payment.
#[derive(Debug, Clone, FromRow)]
pub struct ReconciliationMatch {
    pub match_id: Uuid,
    pub batch_id: Uuid,
    pub transaction_id: Uuid,
    pub payment_kind: String,
    pub payment_external_id: Uuid,
    pub match_type: String,
    pub confidence: f64,
    pub amount_difference: Decimal,
    pub date_difference_days: i32,
    pub is_confirmed: bool,
    pub is_manual: bool,
    pub approved_by: Option<String>,
    pub notes: Option<String>,
    pub matched_utc: DateTime<Utc>,
}

// ============================================================================
// Pending Payment Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentKind {
    /// Settled but unreconciled cash/transfer/POS payment.
    Manual,
    /// Non-terminal card payment intent.
    OnlineIntent,
    /// Uploaded bank-transfer submission awaiting review.
    BankTransfer,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::OnlineIntent => "online_intent",
            Self::BankTransfer => "bank_transfer",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "manual" => Self::Manual,
            "online_intent" => Self::OnlineIntent,
            "bank_transfer" => Self::BankTransfer,
            _ => Self::Manual,
        }
    }
}

/// One snapshot entry from the external payment store. Referenced only by
/// `{kind, external_id}`; never owned by this subsystem.
#[derive(Debug, Clone)]
pub struct PendingPayment {
    pub kind: PaymentKind,
    pub external_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub reference_date: NaiveDate,
    pub reservation_id: Uuid,
    pub created_utc: DateTime<Utc>,
}

// ============================================================================
// Audit Log Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    BatchCreated,
    ProcessingStarted,
    ReversalDetected,
    AutoMatched,
    PendingReview,
    Unmatched,
    PaymentAlreadyClaimed,
    RateUnavailable,
    TransactionError,
    BatchCompleted,
    BatchFailed,
    ManualMatchApproved,
    ManualMatchRejected,
    AlertRaised,
}

impl LogEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BatchCreated => "batch_created",
            Self::ProcessingStarted => "processing_started",
            Self::ReversalDetected => "reversal_detected",
            Self::AutoMatched => "auto_matched",
            Self::PendingReview => "pending_review",
            Self::Unmatched => "unmatched",
            Self::PaymentAlreadyClaimed => "payment_already_claimed",
            Self::RateUnavailable => "rate_unavailable",
            Self::TransactionError => "transaction_error",
            Self::BatchCompleted => "batch_completed",
            Self::BatchFailed => "batch_failed",
            Self::ManualMatchApproved => "manual_match_approved",
            Self::ManualMatchRejected => "manual_match_rejected",
            Self::AlertRaised => "alert_raised",
        }
    }
}

/// Append-only audit record. Never mutated or deleted; the store exposes no
/// update path for it.
#[derive(Debug, Clone, FromRow)]
pub struct ReconciliationLogEntry {
    pub log_id: Uuid,
    pub batch_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub match_id: Option<Uuid>,
    pub event: String,
    pub description: String,
    pub details: serde_json::Value,
    pub confidence: Option<f64>,
    /// None means the system itself acted.
    pub actor: Option<String>,
    pub created_utc: DateTime<Utc>,
}

// ============================================================================
// Alert Models
// ============================================================================

/// Payload handed to the notification collaborator when a completed batch
/// exceeds the unmatched threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmatchedAlert {
    pub property_id: Uuid,
    pub batch_id: Uuid,
    pub unmatched_percentage: f64,
}
