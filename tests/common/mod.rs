//! Shared test harness: in-memory implementations of the engine's seams and
//! a few builders. The doubles mirror the Postgres implementations' observable
//! semantics (status-guarded transitions, confirm-before-visible writes).

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use property_reconciliation::config::ReconciliationConfig;
use property_reconciliation::error::{AppError, ConfirmError};
use property_reconciliation::models::{
    BankTransaction, BatchStatus, LogEvent, NewBatch, PaymentKind, PendingPayment,
    ReconciliationBatch, ReconciliationLogEntry, ReconciliationMatch, TransactionState,
    UnmatchedAlert,
};
use property_reconciliation::services::audit::AlertNotifier;
use property_reconciliation::services::database::{
    BatchCounts, NewLogEntry, NewTransaction, ReconciliationStore,
};
use property_reconciliation::services::engine::{
    EngineSettings, ReconciliationEngine, StatementFiles,
};
use property_reconciliation::services::payments::PaymentStore;
use property_reconciliation::services::scorer::MatchCandidate;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use uuid::Uuid;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info")
            .with_test_writer()
            .init();
    });
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct StoreInner {
    batches: HashMap<Uuid, ReconciliationBatch>,
    transactions: HashMap<Uuid, BankTransaction>,
    matches: HashMap<Uuid, ReconciliationMatch>,
    logs: Vec<ReconciliationLogEntry>,
    configs: HashMap<Uuid, ReconciliationConfig>,
    locks: HashMap<Uuid, (Uuid, DateTime<Utc>)>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_config(&self, property_id: Uuid, config: ReconciliationConfig) {
        self.inner
            .lock()
            .unwrap()
            .configs
            .insert(property_id, config);
    }

    pub fn events_for_batch(&self, batch_id: Uuid) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .logs
            .iter()
            .filter(|l| l.batch_id == batch_id)
            .map(|l| l.event.clone())
            .collect()
    }

    pub fn has_event(&self, batch_id: Uuid, event: LogEvent) -> bool {
        self.events_for_batch(batch_id)
            .iter()
            .any(|e| e == event.as_str())
    }

    pub fn matches_for_batch(&self, batch_id: Uuid) -> Vec<ReconciliationMatch> {
        self.inner
            .lock()
            .unwrap()
            .matches
            .values()
            .filter(|m| m.batch_id == batch_id)
            .cloned()
            .collect()
    }

    /// Pre-seed a terminal transaction state, as a crashed-then-resumed run
    /// would leave behind.
    pub fn force_transaction_state(
        &self,
        transaction_id: Uuid,
        state: TransactionState,
        matched_payment: Option<(PaymentKind, Uuid)>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let tx = inner.transactions.get_mut(&transaction_id).unwrap();
        tx.status = state.as_str().to_string();
        if let Some((kind, id)) = matched_payment {
            tx.is_matched = true;
            tx.matched_payment_kind = Some(kind.as_str().to_string());
            tx.matched_payment_id = Some(id);
            tx.match_confidence = Some(100.0);
            tx.match_type = Some("exact".to_string());
        }
    }
}

fn apply_candidate(tx: &mut BankTransaction, state: TransactionState, candidate: &MatchCandidate) {
    tx.status = state.as_str().to_string();
    tx.is_matched = state == TransactionState::AutoMatched;
    tx.match_confidence = Some(candidate.confidence);
    tx.match_type = Some(candidate.match_type.as_str().to_string());
    tx.matched_payment_kind = Some(candidate.payment.kind.as_str().to_string());
    tx.matched_payment_id = Some(candidate.payment.external_id);
    tx.amount_difference = Some(candidate.amount_difference);
    tx.date_difference_days = Some(candidate.date_difference_days as i32);
}

fn match_from_candidate(
    tx: &BankTransaction,
    candidate: &MatchCandidate,
    is_confirmed: bool,
) -> ReconciliationMatch {
    ReconciliationMatch {
        match_id: Uuid::new_v4(),
        batch_id: tx.batch_id,
        transaction_id: tx.transaction_id,
        payment_kind: candidate.payment.kind.as_str().to_string(),
        payment_external_id: candidate.payment.external_id,
        match_type: candidate.match_type.as_str().to_string(),
        confidence: candidate.confidence,
        amount_difference: candidate.amount_difference,
        date_difference_days: candidate.date_difference_days as i32,
        is_confirmed,
        is_manual: false,
        approved_by: None,
        notes: None,
        matched_utc: Utc::now(),
    }
}

#[async_trait]
impl ReconciliationStore for MemoryStore {
    async fn create_batch(&self, new: NewBatch) -> Result<ReconciliationBatch, AppError> {
        let batch = ReconciliationBatch {
            batch_id: Uuid::new_v4(),
            property_id: new.property_id,
            reconciliation_date: new.reconciliation_date,
            source_filename: new.source_filename,
            file_size_bytes: new.file_size_bytes,
            status: BatchStatus::Pending.as_str().to_string(),
            total_count: 0,
            matched_count: 0,
            unmatched_count: 0,
            pending_review_count: 0,
            error_count: 0,
            reversal_count: 0,
            notes: None,
            error_detail: None,
            created_by: new.created_by,
            created_utc: Utc::now(),
            processing_started_utc: None,
            processing_completed_utc: None,
        };
        self.inner
            .lock()
            .unwrap()
            .batches
            .insert(batch.batch_id, batch.clone());
        Ok(batch)
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<ReconciliationBatch>, AppError> {
        Ok(self.inner.lock().unwrap().batches.get(&batch_id).cloned())
    }

    async fn mark_batch_processing(
        &self,
        batch_id: Uuid,
    ) -> Result<Option<ReconciliationBatch>, AppError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(batch) = inner.batches.get_mut(&batch_id) else {
            return Ok(None);
        };
        if batch.status != "pending" && batch.status != "failed" {
            return Ok(None);
        }
        batch.status = BatchStatus::Processing.as_str().to_string();
        batch.error_detail = None;
        batch.processing_started_utc = Some(Utc::now());
        batch.processing_completed_utc = None;
        Ok(Some(batch.clone()))
    }

    async fn mark_batch_completed(
        &self,
        batch_id: Uuid,
        counts: BatchCounts,
    ) -> Result<ReconciliationBatch, AppError> {
        let mut inner = self.inner.lock().unwrap();
        let batch = inner
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("batch {} not found", batch_id)))?;
        batch.status = BatchStatus::Completed.as_str().to_string();
        set_counts(batch, counts);
        batch.processing_completed_utc = Some(Utc::now());
        Ok(batch.clone())
    }

    async fn mark_batch_failed(
        &self,
        batch_id: Uuid,
        reason: &str,
        counts: Option<BatchCounts>,
    ) -> Result<ReconciliationBatch, AppError> {
        let mut inner = self.inner.lock().unwrap();
        let batch = inner
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("batch {} not found", batch_id)))?;
        batch.status = BatchStatus::Failed.as_str().to_string();
        batch.error_detail = Some(reason.to_string());
        set_counts(batch, counts.unwrap_or_default());
        batch.processing_completed_utc = Some(Utc::now());
        Ok(batch.clone())
    }

    async fn next_pending_batch(&self) -> Result<Option<ReconciliationBatch>, AppError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .batches
            .values()
            .filter(|b| b.status == "pending")
            .min_by_key(|b| b.created_utc)
            .cloned())
    }

    async fn insert_transactions(
        &self,
        batch_id: Uuid,
        rows: &[NewTransaction],
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        for row in rows {
            let tx = BankTransaction {
                transaction_id: Uuid::new_v4(),
                batch_id,
                row_number: row.row_number,
                transaction_date: row.transaction_date,
                description: row.description.clone(),
                amount: row.amount,
                original_currency: row.original_currency.clone(),
                original_amount: row.original_amount,
                reference: row.reference.clone(),
                status: TransactionState::Unprocessed.as_str().to_string(),
                is_matched: false,
                is_reversal: row.amount < Decimal::ZERO,
                rate_missing: row.rate_missing,
                match_confidence: None,
                match_type: None,
                matched_payment_kind: None,
                matched_payment_id: None,
                amount_difference: None,
                date_difference_days: None,
                created_utc: Utc::now(),
            };
            inner.transactions.insert(tx.transaction_id, tx);
        }
        Ok(())
    }

    async fn transactions_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<BankTransaction>, AppError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<BankTransaction> = inner
            .transactions
            .values()
            .filter(|t| t.batch_id == batch_id)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.row_number);
        Ok(rows)
    }

    async fn transaction_count(&self, batch_id: Uuid) -> Result<i64, AppError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .transactions
            .values()
            .filter(|t| t.batch_id == batch_id)
            .count() as i64)
    }

    async fn set_transaction_state(
        &self,
        transaction_id: Uuid,
        state: TransactionState,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        let tx = inner.transactions.get_mut(&transaction_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("transaction {} not found", transaction_id))
        })?;
        tx.status = state.as_str().to_string();
        if state == TransactionState::Reversal && tx.amount < Decimal::ZERO {
            tx.is_reversal = true;
        }
        Ok(())
    }

    async fn apply_confirmed_match(
        &self,
        tx: &BankTransaction,
        candidate: &MatchCandidate,
        payments: &dyn PaymentStore,
    ) -> Result<ReconciliationMatch, ConfirmError> {
        // Confirm first: a rejected confirm must leave no local writes, which
        // is what the rollback in the Postgres implementation guarantees.
        payments
            .confirm(candidate.payment.kind, candidate.payment.external_id)
            .await?;

        let mut inner = self.inner.lock().unwrap();
        let matched = match_from_candidate(tx, candidate, true);
        inner.matches.insert(matched.match_id, matched.clone());
        let stored = inner.transactions.get_mut(&tx.transaction_id).unwrap();
        apply_candidate(stored, TransactionState::AutoMatched, candidate);
        Ok(matched)
    }

    async fn create_pending_match(
        &self,
        tx: &BankTransaction,
        candidate: &MatchCandidate,
    ) -> Result<ReconciliationMatch, AppError> {
        let mut inner = self.inner.lock().unwrap();
        let matched = match_from_candidate(tx, candidate, false);
        inner.matches.insert(matched.match_id, matched.clone());
        let stored = inner.transactions.get_mut(&tx.transaction_id).unwrap();
        apply_candidate(stored, TransactionState::PendingReview, candidate);
        Ok(matched)
    }

    async fn get_match(&self, match_id: Uuid) -> Result<Option<ReconciliationMatch>, AppError> {
        Ok(self.inner.lock().unwrap().matches.get(&match_id).cloned())
    }

    async fn confirm_pending_match(
        &self,
        pending: &ReconciliationMatch,
        approver: &str,
        notes: Option<&str>,
        payments: &dyn PaymentStore,
    ) -> Result<ReconciliationMatch, ConfirmError> {
        payments
            .confirm(
                PaymentKind::from_str(&pending.payment_kind),
                pending.payment_external_id,
            )
            .await?;

        let mut inner = self.inner.lock().unwrap();
        let matched = inner
            .matches
            .get_mut(&pending.match_id)
            .ok_or_else(|| ConfirmError::NotConfirmable("match is gone".to_string()))?;
        if matched.is_confirmed {
            return Err(ConfirmError::NotConfirmable(
                "match is not pending".to_string(),
            ));
        }
        matched.is_confirmed = true;
        matched.is_manual = true;
        matched.approved_by = Some(approver.to_string());
        matched.notes = notes.map(|n| n.to_string());
        matched.matched_utc = Utc::now();
        let matched = matched.clone();

        let tx = inner.transactions.get_mut(&pending.transaction_id).unwrap();
        tx.status = TransactionState::ManuallyMatched.as_str().to_string();
        tx.is_matched = true;

        let batch = inner.batches.get_mut(&pending.batch_id).unwrap();
        batch.matched_count += 1;
        batch.pending_review_count -= 1;

        Ok(matched)
    }

    async fn delete_pending_match(&self, pending: &ReconciliationMatch) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.matches.get(&pending.match_id) {
            Some(m) if !m.is_confirmed => {
                inner.matches.remove(&pending.match_id);
            }
            _ => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "match {} is not pending",
                    pending.match_id
                )));
            }
        }

        let tx = inner.transactions.get_mut(&pending.transaction_id).unwrap();
        tx.status = TransactionState::Unmatched.as_str().to_string();
        tx.is_matched = false;
        tx.match_confidence = None;
        tx.match_type = None;
        tx.matched_payment_kind = None;
        tx.matched_payment_id = None;
        tx.amount_difference = None;
        tx.date_difference_days = None;

        let batch = inner.batches.get_mut(&pending.batch_id).unwrap();
        batch.unmatched_count += 1;
        batch.pending_review_count -= 1;

        Ok(())
    }

    async fn append_log(&self, entry: NewLogEntry) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        inner.logs.push(ReconciliationLogEntry {
            log_id: Uuid::new_v4(),
            batch_id: entry.batch_id,
            transaction_id: entry.transaction_id,
            match_id: entry.match_id,
            event: entry.event.as_str().to_string(),
            description: entry.description,
            details: entry.details,
            confidence: entry.confidence,
            actor: entry.actor,
            created_utc: Utc::now(),
        });
        Ok(())
    }

    async fn logs_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<ReconciliationLogEntry>, AppError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .logs
            .iter()
            .filter(|l| l.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn property_config(
        &self,
        property_id: Uuid,
    ) -> Result<Option<ReconciliationConfig>, AppError> {
        Ok(self.inner.lock().unwrap().configs.get(&property_id).cloned())
    }

    async fn try_acquire_property_lock(
        &self,
        property_id: Uuid,
        batch_id: Uuid,
    ) -> Result<bool, AppError> {
        let mut inner = self.inner.lock().unwrap();
        let stale = inner
            .locks
            .get(&property_id)
            .map(|(_, locked_utc)| Utc::now() - *locked_utc > chrono::Duration::hours(1))
            .unwrap_or(false);
        if stale {
            inner.locks.remove(&property_id);
        }
        if inner.locks.contains_key(&property_id) {
            return Ok(false);
        }
        inner.locks.insert(property_id, (batch_id, Utc::now()));
        Ok(true)
    }

    async fn release_property_lock(&self, property_id: Uuid) -> Result<(), AppError> {
        self.inner.lock().unwrap().locks.remove(&property_id);
        Ok(())
    }
}

fn set_counts(batch: &mut ReconciliationBatch, counts: BatchCounts) {
    batch.total_count = counts.total;
    batch.matched_count = counts.matched;
    batch.unmatched_count = counts.unmatched;
    batch.pending_review_count = counts.pending_review;
    batch.error_count = counts.error;
    batch.reversal_count = counts.reversal;
}

// ============================================================================
// In-memory payment store
// ============================================================================

#[derive(Default)]
struct PaymentsInner {
    pending: HashMap<Uuid, Vec<PendingPayment>>,
    confirmed: HashSet<(PaymentKind, Uuid)>,
    externally_claimed: HashSet<(PaymentKind, Uuid)>,
    confirm_calls: usize,
}

#[derive(Default)]
pub struct MemoryPayments {
    inner: Mutex<PaymentsInner>,
}

impl MemoryPayments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pending(&self, property_id: Uuid, payment: PendingPayment) {
        self.inner
            .lock()
            .unwrap()
            .pending
            .entry(property_id)
            .or_default()
            .push(payment);
    }

    /// Mark a payment as confirmed by someone else, so the next confirm
    /// attempt collides.
    pub fn claim_externally(&self, kind: PaymentKind, external_id: Uuid) {
        self.inner
            .lock()
            .unwrap()
            .externally_claimed
            .insert((kind, external_id));
    }

    pub fn is_confirmed(&self, kind: PaymentKind, external_id: Uuid) -> bool {
        self.inner
            .lock()
            .unwrap()
            .confirmed
            .contains(&(kind, external_id))
    }

    pub fn confirm_calls(&self) -> usize {
        self.inner.lock().unwrap().confirm_calls
    }
}

#[async_trait]
impl PaymentStore for MemoryPayments {
    async fn pending_for_property(
        &self,
        property_id: Uuid,
    ) -> Result<Vec<PendingPayment>, AppError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .pending
            .get(&property_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn confirm(&self, kind: PaymentKind, external_id: Uuid) -> Result<(), ConfirmError> {
        let mut inner = self.inner.lock().unwrap();
        inner.confirm_calls += 1;
        let key = (kind, external_id);
        if inner.externally_claimed.contains(&key) || inner.confirmed.contains(&key) {
            return Err(ConfirmError::AlreadyClaimed(format!(
                "{} already claimed",
                external_id
            )));
        }
        inner.confirmed.insert(key);
        Ok(())
    }
}

// ============================================================================
// In-memory statement files and notifier
// ============================================================================

#[derive(Default)]
pub struct MemoryFiles {
    files: Mutex<HashMap<(Uuid, String), Vec<u8>>>,
}

impl MemoryFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, property_id: Uuid, filename: &str, bytes: Vec<u8>) {
        self.files
            .lock()
            .unwrap()
            .insert((property_id, filename.to_string()), bytes);
    }
}

#[async_trait]
impl StatementFiles for MemoryFiles {
    async fn fetch(&self, property_id: Uuid, filename: &str) -> Result<Vec<u8>, AppError> {
        self.files
            .lock()
            .unwrap()
            .get(&(property_id, filename.to_string()))
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("statement file {} not found", filename))
            })
    }
}

#[derive(Default)]
pub struct MemoryNotifier {
    alerts: Mutex<Vec<UnmatchedAlert>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<UnmatchedAlert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertNotifier for MemoryNotifier {
    async fn notify_unmatched(&self, alert: &UnmatchedAlert) -> Result<(), AppError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

// ============================================================================
// Harness and builders
// ============================================================================

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub payments: Arc<MemoryPayments>,
    pub files: Arc<MemoryFiles>,
    pub notifier: Arc<MemoryNotifier>,
    pub engine: ReconciliationEngine,
}

pub fn harness() -> TestHarness {
    harness_with_timeout(Duration::from_secs(300))
}

pub fn harness_with_timeout(batch_timeout: Duration) -> TestHarness {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let payments = Arc::new(MemoryPayments::new());
    let files = Arc::new(MemoryFiles::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let engine = build_engine(&store, &payments, &files, &notifier, batch_timeout);
    TestHarness {
        store,
        payments,
        files,
        notifier,
        engine,
    }
}

/// A second engine over the same doubles, e.g. to resume a failed batch with
/// a different timeout.
pub fn engine_with_timeout(h: &TestHarness, batch_timeout: Duration) -> ReconciliationEngine {
    build_engine(&h.store, &h.payments, &h.files, &h.notifier, batch_timeout)
}

fn build_engine(
    store: &Arc<MemoryStore>,
    payments: &Arc<MemoryPayments>,
    files: &Arc<MemoryFiles>,
    notifier: &Arc<MemoryNotifier>,
    batch_timeout: Duration,
) -> ReconciliationEngine {
    ReconciliationEngine::new(
        store.clone(),
        payments.clone(),
        files.clone(),
        notifier.clone(),
        EngineSettings {
            batch_timeout,
            default_currency: "ARS".to_string(),
        },
    )
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Decimal from a cent count, e.g. `cents(100000)` is 1000.00.
pub fn cents(c: i64) -> Decimal {
    Decimal::new(c, 2)
}

pub fn payment(amount: Decimal, reference_date: NaiveDate) -> PendingPayment {
    PendingPayment {
        kind: PaymentKind::Manual,
        external_id: Uuid::new_v4(),
        amount,
        currency: "ARS".to_string(),
        reference_date,
        reservation_id: Uuid::new_v4(),
        created_utc: Utc::now(),
    }
}

pub fn payment_with_kind(
    kind: PaymentKind,
    amount: Decimal,
    reference_date: NaiveDate,
) -> PendingPayment {
    PendingPayment {
        kind,
        ..payment(amount, reference_date)
    }
}

/// Store a CSV file for the property and record it as a pending batch.
pub async fn batch_with_csv(
    h: &TestHarness,
    property_id: Uuid,
    filename: &str,
    csv_text: &str,
) -> ReconciliationBatch {
    h.files.put(property_id, filename, csv_text.as_bytes().to_vec());
    h.engine
        .create_batch(NewBatch {
            property_id,
            reconciliation_date: date(2024, 3, 31),
            source_filename: filename.to_string(),
            file_size_bytes: csv_text.len() as i64,
            created_by: Some("tester".to_string()),
        })
        .await
        .unwrap()
}
