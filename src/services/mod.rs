//! Services module for property-reconciliation.

pub mod audit;
pub mod csv_import;
pub mod currency;
pub mod database;
pub mod engine;
pub mod metrics;
pub mod payments;
pub mod scorer;

pub use audit::{AlertNotifier, AuditLog, TracingAlertNotifier};
pub use database::{BatchCounts, Database, NewLogEntry, NewTransaction, ReconciliationStore};
pub use engine::{
    EngineSettings, LocalStatementFiles, ReconciliationEngine, StatementFiles,
};
pub use metrics::{get_metrics, init_metrics};
pub use payments::{PaymentStore, PgPaymentStore};
pub use scorer::MatchCandidate;
