//! Background sweepers. Every loop is a cooperative periodic task that
//! logs and continues on per-cycle failures; no error escapes a task.

use crate::config::SweeperConfig;
use crate::pipeline::{dlq_backoff, PipelineHandler};
use chrono::Utc;
use ngs_correlator::Correlator;
use ngs_maintenance::MaintenanceEngine;
use ngs_storage::MailStore;
use std::sync::Arc;
use tokio::time::{interval, Duration};

pub struct Sweepers {
    store: Arc<MailStore>,
    correlator: Arc<Correlator>,
    maintenance: Arc<MaintenanceEngine>,
    pipeline: Arc<PipelineHandler>,
    config: SweeperConfig,
    dlq_sweep_interval_secs: u64,
    maintenance_tick_secs: u64,
}

impl Sweepers {
    pub fn new(
        store: Arc<MailStore>,
        correlator: Arc<Correlator>,
        maintenance: Arc<MaintenanceEngine>,
        pipeline: Arc<PipelineHandler>,
        config: SweeperConfig,
        dlq_sweep_interval_secs: u64,
        maintenance_tick_secs: u64,
    ) -> Self {
        Self {
            store,
            correlator,
            maintenance,
            pipeline,
            config,
            dlq_sweep_interval_secs,
            maintenance_tick_secs,
        }
    }

    /// Auto-resolve silent incidents and promote quiet resolving ones.
    pub async fn run_auto_resolve(self: Arc<Self>) {
        let mut tick = interval(Duration::from_secs(self.config.auto_resolve_interval_secs));
        loop {
            tick.tick().await;
            if let Err(e) = self.correlator.auto_resolve_stale().await {
                tracing::error!(error = %e, "Auto-resolve sweep failed");
            }
            if let Err(e) = self.correlator.promote_quiet_resolving().await {
                tracing::error!(error = %e, "Quiet-period promotion failed");
            }
        }
    }

    /// Maintenance evaluation tick: incident matching plus expired-flag
    /// clearing.
    pub async fn run_maintenance_tick(self: Arc<Self>) {
        let mut tick = interval(Duration::from_secs(self.maintenance_tick_secs));
        loop {
            tick.tick().await;
            if let Err(e) = self.maintenance.tick().await {
                tracing::error!(error = %e, "Maintenance tick failed");
            }
        }
    }

    /// Dead-letter retry loop.
    pub async fn run_dlq(self: Arc<Self>) {
        let mut tick = interval(Duration::from_secs(self.dlq_sweep_interval_secs));
        loop {
            tick.tick().await;
            if let Err(e) = self.sweep_dlq_once().await {
                tracing::error!(error = %e, "DLQ sweep failed");
            }
        }
    }

    async fn sweep_dlq_once(&self) -> anyhow::Result<()> {
        let claimed = self.store.claim_due_dead_letters(10).await?;
        for entry in claimed {
            match self.pipeline.dispatch_dead_letter(&entry).await {
                Ok(()) => {
                    self.store.resolve_dead_letter(&entry.id).await?;
                }
                Err(e) => {
                    let next = Utc::now()
                        + dlq_backoff(self.pipeline.dlq_policy(), entry.retry_count);
                    self.store
                        .fail_dead_letter(&entry.id, &e.to_string(), Some(next))
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Expired idempotency keys and aged-out quarantine/DLQ records.
    pub async fn run_idempotency_cleanup(self: Arc<Self>) {
        let mut tick = interval(Duration::from_secs(
            self.config.idempotency_cleanup_interval_secs,
        ));
        loop {
            tick.tick().await;
            if let Err(e) = self.store.cleanup_expired_idempotency_keys().await {
                tracing::error!(error = %e, "Idempotency cleanup failed");
            }
            match self.store.cleanup_old_dead_letters(30).await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "Cleaned up old DLQ entries")
                }
                Err(e) => tracing::error!(error = %e, "DLQ cleanup failed"),
                _ => {}
            }
            match self.store.cleanup_old_quarantine(30).await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "Cleaned up reviewed quarantine records")
                }
                Err(e) => tracing::error!(error = %e, "Quarantine cleanup failed"),
                _ => {}
            }
            match self
                .store
                .purge_old_emails(self.config.raw_email_retention_days)
                .await
            {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "Purged raw emails past retention")
                }
                Err(e) => tracing::error!(error = %e, "Raw email purge failed"),
                _ => {}
            }
        }
    }

    /// Recover emails stuck in pending after a mid-pipeline crash.
    pub async fn run_reprocess(self: Arc<Self>) {
        let mut tick = interval(Duration::from_secs(self.config.reprocess_interval_secs));
        loop {
            tick.tick().await;
            let stuck = match self
                .store
                .list_stuck_pending(self.config.reprocess_stuck_minutes, 50)
                .await
            {
                Ok(stuck) => stuck,
                Err(e) => {
                    tracing::error!(error = %e, "Reprocess scan failed");
                    continue;
                }
            };
            if stuck.is_empty() {
                continue;
            }
            tracing::info!(count = stuck.len(), "Reprocessing stuck pending emails");
            for email in stuck {
                if let Err(e) = self.pipeline.process(&email).await {
                    tracing::error!(email_id = %email.id, error = %e, "Reprocess failed");
                }
            }
        }
    }
}
