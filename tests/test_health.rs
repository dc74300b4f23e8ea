//! Tests for HealthMonitor (health.rs): probing schedule, edge-triggered
//! notifications, listener isolation.

mod common;

use common::{test_config, FakeProbe};
use examsave::{ConnectivityListener, HealthMonitor, PipelineConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct CountingListener {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

impl CountingListener {
    fn counts(&self) -> (usize, usize) {
        (
            self.connected.load(Ordering::SeqCst),
            self.disconnected.load(Ordering::SeqCst),
        )
    }
}

impl ConnectivityListener for CountingListener {
    fn on_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&self) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

struct PanickingListener;

impl ConnectivityListener for PanickingListener {
    fn on_connected(&self) {
        panic!("listener blew up on connect");
    }

    fn on_disconnected(&self) {
        panic!("listener blew up on disconnect");
    }
}

fn config(tmp: &TempDir) -> PipelineConfig {
    test_config(tmp.path())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn first_probe_runs_immediately() {
    let tmp = TempDir::new().unwrap();
    let probe = FakeProbe::new(false);
    let monitor = HealthMonitor::new(&config(&tmp), probe.clone());
    let listener = Arc::new(CountingListener::default());
    monitor.add_listener(listener.clone());

    assert!(monitor.is_connected());
    monitor.start();
    settle().await;

    assert_eq!(probe.probe_count(), 1);
    assert!(!monitor.is_connected());
    assert_eq!(listener.counts(), (0, 1));
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn steady_state_does_not_notify() {
    let tmp = TempDir::new().unwrap();
    let probe = FakeProbe::new(true);
    let monitor = HealthMonitor::new(&config(&tmp), probe.clone());
    let listener = Arc::new(CountingListener::default());
    monitor.add_listener(listener.clone());

    monitor.start();
    tokio::time::sleep(Duration::from_secs(35)).await;

    // t = 0, 10, 20, 30
    assert_eq!(probe.probe_count(), 4);
    assert_eq!(listener.counts(), (0, 0));
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn each_transition_notifies_once() {
    let tmp = TempDir::new().unwrap();
    let probe = FakeProbe::new(true);
    let monitor = HealthMonitor::new(&config(&tmp), probe.clone());
    let listener = Arc::new(CountingListener::default());
    monitor.add_listener(listener.clone());
    monitor.start();
    settle().await;

    probe.set_reachable(false);
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(listener.counts(), (0, 1));

    probe.set_reachable(true);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(listener.counts(), (1, 1));
    assert!(monitor.is_connected());
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn hung_probe_counts_as_unreachable() {
    let tmp = TempDir::new().unwrap();
    let probe = FakeProbe::new(true);
    probe.set_hang(true);
    let monitor = HealthMonitor::new(&config(&tmp), probe.clone());

    monitor.start();
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!monitor.is_connected());
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn panicking_listener_does_not_starve_others() {
    let tmp = TempDir::new().unwrap();
    let probe = FakeProbe::new(false);
    let monitor = HealthMonitor::new(&config(&tmp), probe.clone());
    let listener = Arc::new(CountingListener::default());
    monitor.add_listener(Arc::new(PanickingListener));
    monitor.add_listener(listener.clone());

    monitor.start();
    settle().await;
    assert_eq!(listener.counts(), (0, 1));

    // The probe loop survived the panic.
    probe.set_reachable(true);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(listener.counts(), (1, 1));
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn listeners_are_deduplicated_and_removable() {
    let tmp = TempDir::new().unwrap();
    let probe = FakeProbe::new(true);
    let monitor = HealthMonitor::new(&config(&tmp), probe.clone());
    let listener = Arc::new(CountingListener::default());
    let as_dyn: Arc<dyn ConnectivityListener> = listener.clone();

    monitor.add_listener(as_dyn.clone());
    monitor.add_listener(as_dyn.clone());
    probe.set_reachable(false);
    monitor.force_probe().await;
    assert_eq!(listener.counts(), (0, 1));

    assert!(monitor.remove_listener(&as_dyn));
    assert!(!monitor.remove_listener(&as_dyn));
    probe.set_reachable(true);
    monitor.force_probe().await;
    assert_eq!(listener.counts(), (0, 1));
}

#[tokio::test(start_paused = true)]
async fn force_probe_works_without_start() {
    let tmp = TempDir::new().unwrap();
    let probe = FakeProbe::new(false);
    let monitor = HealthMonitor::new(&config(&tmp), probe.clone());

    assert!(!monitor.is_running());
    assert!(!monitor.force_probe().await);
    assert!(!monitor.is_connected());
    assert_eq!(probe.probe_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_ends_probing() {
    let tmp = TempDir::new().unwrap();
    let probe = FakeProbe::new(true);
    let monitor = HealthMonitor::new(
        &PipelineConfig {
            probe_interval: Duration::from_secs(1),
            ..config(&tmp)
        },
        probe.clone(),
    );

    monitor.start();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    monitor.stop().await;
    assert!(!monitor.is_running());
    let after_stop = probe.probe_count();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(probe.probe_count(), after_stop);
}
