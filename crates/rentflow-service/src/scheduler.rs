//! Periodic reconciliation sweep

use crate::config::SchedulerConfig;
use rentflow_core::SettlementEngine;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Drives [`SettlementEngine::reconcile`] on an interval and on demand.
pub struct ReconcileScheduler {
    config: SchedulerConfig,
    engine: Arc<SettlementEngine>,
    trigger_tx: mpsc::Sender<()>,
    running: Arc<RwLock<bool>>,
}

impl ReconcileScheduler {
    pub fn new(
        config: SchedulerConfig,
        engine: Arc<SettlementEngine>,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(10);
        let scheduler = Arc::new(Self {
            config,
            engine,
            trigger_tx,
            running: Arc::new(RwLock::new(false)),
        });
        (scheduler, trigger_rx)
    }

    /// Request a sweep without waiting for the next tick.
    pub async fn trigger(&self) {
        let _ = self.trigger_tx.send(()).await;
    }

    pub async fn start(self: Arc<Self>, mut trigger_rx: mpsc::Receiver<()>) {
        *self.running.write().await = true;
        tracing::info!(
            interval_secs = self.config.reconcile_interval_secs,
            "reconciliation scheduler started"
        );

        let mut ticker = interval(Duration::from_secs(
            self.config.reconcile_interval_secs.max(1),
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep("interval").await,
                Some(_) = trigger_rx.recv() => self.sweep("trigger").await,
                else => break,
            }

            if !*self.running.read().await {
                break;
            }
        }

        tracing::info!("reconciliation scheduler stopped");
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.trigger().await;
    }

    async fn sweep(&self, cause: &'static str) {
        match self.engine.reconcile().await {
            Ok(report) if report.examined > 0 || !report.stuck_submitting.is_empty() => {
                tracing::info!(
                    cause,
                    examined = report.examined,
                    resolved = report.resolved,
                    activated = report.activated_leases.len(),
                    "reconciliation sweep"
                );
            }
            Ok(_) => tracing::debug!(cause, "reconciliation sweep found nothing in flight"),
            Err(e) => tracing::error!(cause, error = %e, "reconciliation sweep failed"),
        }
    }
}
