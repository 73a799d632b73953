//! Application startup and lifecycle management.

use crate::config::ServiceConfig;
use crate::error::AppError;
use crate::services::{
    init_metrics, Database, EngineSettings, LocalStatementFiles, PgPaymentStore,
    ReconciliationEngine, ReconciliationStore, TracingAlertNotifier,
};
use std::sync::Arc;
use std::time::Duration;

/// Application container for the reconciliation worker.
pub struct Application {
    db: Arc<Database>,
    engine: ReconciliationEngine,
    poll_interval: Duration,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: ServiceConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: ServiceConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: ServiceConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let store: Arc<dyn ReconciliationStore> = db.clone();
        let payments = Arc::new(PgPaymentStore::new(db.pool().clone()));
        let files = Arc::new(LocalStatementFiles::new(config.statement_dir.clone()));
        let notifier = Arc::new(TracingAlertNotifier);

        let engine = ReconciliationEngine::new(
            store,
            payments,
            files,
            notifier,
            EngineSettings {
                batch_timeout: Duration::from_secs(config.batch_timeout_secs),
                default_currency: config.default_currency.clone(),
            },
        );

        Ok(Self {
            db,
            engine,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    /// Run the worker until stopped: claim the oldest pending batch, process
    /// it, sleep when the queue is empty. A lock conflict means another
    /// worker holds the property; the batch stays pending and is retried on
    /// a later poll.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            poll_interval_secs = self.poll_interval.as_secs(),
            "Reconciliation worker started"
        );

        loop {
            let claimed = self.db.next_pending_batch().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to poll for pending batches");
                std::io::Error::other(format!("Batch poll error: {}", e))
            })?;

            let Some(batch) = claimed else {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            };

            match self.engine.process_batch(batch.batch_id).await {
                Ok(done) => {
                    tracing::info!(
                        batch_id = %done.batch_id,
                        status = %done.status,
                        "Batch run finished"
                    );
                }
                Err(AppError::Conflict(reason)) => {
                    tracing::info!(
                        batch_id = %batch.batch_id,
                        reason = %reason,
                        "Batch deferred; will retry on a later poll"
                    );
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    tracing::error!(batch_id = %batch.batch_id, error = %e, "Batch run errored");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}
