//! Turns a reconnect into one flush-and-classify run and owns the
//! process-wide [`ConnectionStatus`].

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;

use crate::config::PipelineConfig;
use crate::error::{ExamSaveError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::health::ConnectivityListener;
use crate::types::{ConnectionStatus, FlushReport, RecoveryReport};

/// What recovery needs from the autosave side.
#[async_trait]
pub trait PendingFlusher: Send + Sync {
    async fn save_all_pending(&self) -> Result<FlushReport>;
    fn pending_count(&self) -> usize;
}

pub struct RecoveryCoordinator {
    flusher: Arc<dyn PendingFlusher>,
    events: EventBus,
    settle_delay: Duration,
    runtime: Handle,
    status: AtomicU8,
    recovering: AtomicBool,
    /// Bumped on every disconnect; a run that sees it change keeps `Disconnected`.
    disconnects: AtomicU64,
    last_report: Mutex<Option<RecoveryReport>>,
    me: Weak<Self>,
}

impl RecoveryCoordinator {
    /// Must be called from within a Tokio runtime; recovery runs are spawned
    /// onto it.
    pub fn new(config: &PipelineConfig, flusher: Arc<dyn PendingFlusher>, events: EventBus) -> Arc<Self> {
        let runtime = Handle::current();
        Arc::new_cyclic(|me| Self {
            flusher,
            events,
            settle_delay: config.settle_delay,
            runtime,
            status: AtomicU8::new(ConnectionStatus::Connected.as_u8()),
            recovering: AtomicBool::new(false),
            disconnects: AtomicU64::new(0),
            last_report: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    pub fn last_report(&self) -> Option<RecoveryReport> {
        *self.last_report.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Manually rerun recovery, e.g. from a "retry" button.
    pub fn force_retry(&self) {
        if self.try_begin() {
            tracing::info!("[RECOVERY] manual retry requested");
            self.launch();
        } else {
            tracing::warn!("[RECOVERY] recovery already in progress, ignoring retry");
        }
    }

    fn try_begin(&self) -> bool {
        self.recovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn launch(&self) {
        let Some(this) = self.me.upgrade() else {
            self.recovering.store(false, Ordering::Release);
            return;
        };
        let epoch = self.disconnects.load(Ordering::Acquire);
        self.set_status(ConnectionStatus::Reconnecting);
        tracing::info!("[RECOVERY] starting connection recovery");

        self.runtime.spawn(async move {
            let pending_before = this.flusher.pending_count();
            let run = this.runtime.spawn(perform_recovery(
                Arc::clone(&this.flusher),
                this.settle_delay,
                pending_before,
            ));

            let report = match run.await {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => {
                    tracing::error!("[RECOVERY] recovery failed: {}", e);
                    failed_report(pending_before, this.flusher.pending_count())
                }
                Err(join_err) => {
                    tracing::error!("[RECOVERY] recovery task aborted: {}", join_err);
                    failed_report(pending_before, this.flusher.pending_count())
                }
            };
            this.finish(report, epoch);
        });
    }

    fn finish(&self, report: RecoveryReport, epoch: u64) {
        match report.status {
            ConnectionStatus::Connected => tracing::info!(
                "[RECOVERY] recovery complete, {} answers saved",
                report.succeeded
            ),
            ConnectionStatus::PartialRecovery => tracing::warn!(
                "[RECOVERY] partial recovery: {} saved, {} still pending",
                report.succeeded,
                report.failed
            ),
            _ => tracing::error!(
                "[RECOVERY] recovery ended as {}, {} answers pending",
                report.status,
                report.failed
            ),
        }

        *self.last_report.lock().unwrap_or_else(|p| p.into_inner()) = Some(report);
        self.recovering.store(false, Ordering::Release);
        if self.disconnects.load(Ordering::Acquire) == epoch {
            self.set_status(report.status);
        } else {
            tracing::warn!(
                "[RECOVERY] connection lost during recovery, keeping {}",
                self.status()
            );
        }
        self.events.emit(PipelineEvent::RecoveryFinished(report));
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
        self.events
            .emit(PipelineEvent::ConnectionStatusChanged(status));
    }
}

impl ConnectivityListener for RecoveryCoordinator {
    fn on_disconnected(&self) {
        tracing::warn!("[RECOVERY] network disconnected");
        self.disconnects.fetch_add(1, Ordering::AcqRel);
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn on_connected(&self) {
        tracing::info!("[RECOVERY] network reconnected");
        if !self.try_begin() {
            tracing::warn!("[RECOVERY] recovery already in progress, skipping");
            return;
        }
        self.launch();
    }
}

async fn perform_recovery(
    flusher: Arc<dyn PendingFlusher>,
    settle_delay: Duration,
    pending_before: usize,
) -> Result<RecoveryReport> {
    if pending_before == 0 {
        tracing::info!("[RECOVERY] no pending answers to recover");
        return Ok(RecoveryReport {
            status: ConnectionStatus::Connected,
            pending_before: 0,
            succeeded: 0,
            failed: 0,
        });
    }

    tracing::info!("[RECOVERY] flushing {} pending answers", pending_before);
    let flush = flusher.save_all_pending().await;
    match flush {
        Ok(_) => {}
        Err(ExamSaveError::TimeExpired(msg)) => {
            return Err(ExamSaveError::Recovery(format!("exam time expired: {}", msg)));
        }
        Err(e) => return Err(e),
    }

    tokio::time::sleep(settle_delay).await;

    let remaining = flusher.pending_count();
    let status = if remaining == 0 {
        ConnectionStatus::Connected
    } else {
        ConnectionStatus::PartialRecovery
    };
    Ok(RecoveryReport {
        status,
        pending_before,
        succeeded: pending_before.saturating_sub(remaining),
        failed: remaining,
    })
}

fn failed_report(pending_before: usize, remaining: usize) -> RecoveryReport {
    RecoveryReport {
        status: ConnectionStatus::RecoveryFailed,
        pending_before,
        succeeded: pending_before.saturating_sub(remaining),
        failed: remaining,
    }
}
