//! Server reachability monitor with edge-triggered notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::api::HealthProbe;
use crate::config::PipelineConfig;

/// Receives connectivity transitions. Each method is called at most once per
/// transition, on the monitor's worker, so implementations must not block.
pub trait ConnectivityListener: Send + Sync {
    fn on_connected(&self);
    fn on_disconnected(&self);
}

struct ProbeWorker {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

pub struct HealthMonitor {
    probe: Arc<dyn HealthProbe>,
    probe_interval: Duration,
    probe_timeout: Duration,
    shutdown_timeout: Duration,
    listeners: RwLock<Vec<Arc<dyn ConnectivityListener>>>,
    connected: AtomicBool,
    running: AtomicBool,
    /// Serializes probes so transitions are compared and delivered in order.
    probe_lock: tokio::sync::Mutex<()>,
    worker: Mutex<Option<ProbeWorker>>,
    runtime: Handle,
    me: Weak<Self>,
}

impl HealthMonitor {
    /// Must be called from within a Tokio runtime. The server is assumed
    /// reachable until a probe says otherwise.
    pub fn new(config: &PipelineConfig, probe: Arc<dyn HealthProbe>) -> Arc<Self> {
        let runtime = Handle::current();
        Arc::new_cyclic(|me| Self {
            probe,
            probe_interval: config.probe_interval,
            probe_timeout: config.probe_timeout,
            shutdown_timeout: config.shutdown_timeout,
            listeners: RwLock::new(Vec::new()),
            connected: AtomicBool::new(true),
            running: AtomicBool::new(false),
            probe_lock: tokio::sync::Mutex::new(()),
            worker: Mutex::new(None),
            runtime,
            me: me.clone(),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectivityListener>) {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ConnectivityListener>) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    /// Probe immediately, then every `probe_interval`.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            tracing::warn!("[HEALTH] monitor already running");
            return;
        }
        tracing::info!(
            "[HEALTH] starting, probe every {:?} (timeout {:?})",
            self.probe_interval,
            self.probe_timeout
        );

        let shutdown = Arc::new(Notify::new());
        let handle = self.runtime.spawn(run_probe_loop(
            self.me.clone(),
            Arc::clone(&shutdown),
            self.probe_interval,
        ));
        *self.worker.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(ProbeWorker { handle, shutdown });
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!("[HEALTH] stopping");

        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(w) = worker {
            w.shutdown.notify_one();
            let abort = w.handle.abort_handle();
            if tokio::time::timeout(self.shutdown_timeout, w.handle)
                .await
                .is_err()
            {
                tracing::warn!(
                    "[HEALTH] probe worker still busy after {:?}, aborting",
                    self.shutdown_timeout
                );
                abort.abort();
            }
        }
        tracing::info!("[HEALTH] stopped");
    }

    /// Last observed state. Never blocks.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one probe outside the schedule and return the observed state.
    pub async fn force_probe(&self) -> bool {
        tracing::debug!("[HEALTH] forced probe requested");
        self.run_probe().await
    }

    async fn run_probe(&self) -> bool {
        let _guard = self.probe_lock.lock().await;

        let reachable = match tokio::time::timeout(self.probe_timeout, self.probe.probe()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!("[HEALTH] probe timed out after {:?}", self.probe_timeout);
                false
            }
        };

        let was_connected = self.connected.swap(reachable, Ordering::AcqRel);
        if was_connected != reachable {
            tracing::info!(
                "[HEALTH] connection status changed: {} -> {}",
                label(was_connected),
                label(reachable)
            );
            self.notify_listeners(reachable);
        } else {
            tracing::trace!("[HEALTH] connection status unchanged: {}", label(reachable));
        }
        reachable
    }

    fn notify_listeners(&self, connected: bool) {
        let listeners: Vec<Arc<dyn ConnectivityListener>> = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for listener in listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                if connected {
                    listener.on_connected();
                } else {
                    listener.on_disconnected();
                }
            }));
            if let Err(panic_info) = result {
                let msg = if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else {
                    "unknown panic".to_string()
                };
                tracing::error!("[HEALTH] listener panicked during notification: {}", msg);
            }
        }
    }
}

async fn run_probe_loop(monitor: Weak<HealthMonitor>, shutdown: Arc<Notify>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(this) = monitor.upgrade() else {
                    break;
                };
                this.run_probe().await;
            }
            _ = shutdown.notified() => {
                break;
            }
        }
    }
}

fn same_listener(a: &Arc<dyn ConnectivityListener>, b: &Arc<dyn ConnectivityListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn label(connected: bool) -> &'static str {
    if connected {
        "CONNECTED"
    } else {
        "DISCONNECTED"
    }
}
