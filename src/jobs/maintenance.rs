//! Periodic stale sync and daily lifecycle checks.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use super::config::MaintenanceConfig;
use crate::clock::Clock;
use crate::subscription::{
    BatchReport, DailyReport, NotificationScheduler, PaymentSyncService, Result, StatusResolver,
};

/// Runs [`PaymentSyncService::sync_stale`] and
/// [`NotificationScheduler::daily_checks`] on fixed intervals.
///
/// Both run once immediately on start. A failed pass is logged and retried at
/// the next tick.
pub struct MaintenanceWorker {
    sync: PaymentSyncService,
    notices: NotificationScheduler,
    resolver: StatusResolver,
    clock: Arc<dyn Clock>,
    config: MaintenanceConfig,
}

/// Handle to a spawned [`MaintenanceWorker`].
pub struct MaintenanceHandle {
    task: JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl MaintenanceWorker {
    pub fn new(
        sync: PaymentSyncService,
        notices: NotificationScheduler,
        resolver: StatusResolver,
        clock: Arc<dyn Clock>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            sync,
            notices,
            resolver,
            clock,
            config,
        }
    }

    /// One stale-sync pass.
    pub async fn run_sync_once(&self) -> Result<BatchReport> {
        let report = self.sync.sync_stale().await?;
        if report.total() > 0 {
            tracing::info!(
                target: "subscription.sync",
                succeeded = report.succeeded,
                changed = report.changed,
                failed = report.failed.len(),
                "Stale sync pass complete"
            );
        }
        Ok(report)
    }

    /// One pass of the daily lifecycle checks.
    pub async fn run_daily_once(&self) -> Result<DailyReport> {
        self.notices.daily_checks(&self.resolver, self.clock.now()).await
    }

    /// Spawn the worker onto the current runtime.
    pub fn spawn(self) -> MaintenanceHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(self.start(shutdown_rx));
        MaintenanceHandle { task, shutdown_tx }
    }

    /// Run until a shutdown signal arrives or the sender is dropped.
    pub async fn start(self, mut shutdown_rx: mpsc::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!(target: "subscription.maintenance", "Maintenance worker disabled");
            return;
        }

        tracing::info!(
            target: "subscription.maintenance",
            sync_interval_secs = self.config.sync_interval_secs,
            daily_interval_secs = self.config.daily_interval_secs,
            "Maintenance worker started"
        );

        let mut sync_tick = interval(self.config.sync_interval());
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut daily_tick = interval(self.config.daily_interval());
        daily_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!(target: "subscription.maintenance", "Shutdown signal received");
                    break;
                }
                _ = sync_tick.tick() => {
                    if let Err(e) = self.run_sync_once().await {
                        tracing::error!(target: "subscription.maintenance", error = %e, "Stale sync pass failed");
                    }
                }
                _ = daily_tick.tick() => {
                    if let Err(e) = self.run_daily_once().await {
                        tracing::error!(target: "subscription.maintenance", error = %e, "Daily checks failed");
                    }
                }
            }
        }

        tracing::info!(target: "subscription.maintenance", "Maintenance worker stopped");
    }
}

impl MaintenanceHandle {
    /// Stop the worker after its current pass and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}
