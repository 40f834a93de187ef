//! Integration tests for collection: row counts, isolation and lifecycle.

use async_trait::async_trait;
use daq_buffer::core::{AcquisitionConfig, DeviceAdapter, DeviceRegistration, Sample};
use daq_buffer::error::{BufferError, DeviceError};
use daq_buffer::hardware::mock::ConstantAdapter;
use daq_buffer::messages::PipelineState;
use daq_buffer::BufferManager;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Delivers exactly `limit` samples, then only communication errors.
struct FiniteAdapter {
    delivered: AtomicU64,
    limit: u64,
}

impl FiniteAdapter {
    fn new(limit: u64) -> Self {
        Self {
            delivered: AtomicU64::new(0),
            limit,
        }
    }
}

#[async_trait]
impl DeviceAdapter for FiniteAdapter {
    fn identify(&self) -> String {
        format!("finite({})", self.limit)
    }

    async fn poll(&self) -> Result<Sample, DeviceError> {
        let n = self.delivered.fetch_add(1, Ordering::SeqCst);
        if n >= self.limit {
            return Err(DeviceError::Communication("exhausted".into()));
        }
        Ok(Sample::now([("x", n as f64), ("y", -(n as f64))]))
    }
}

/// Reports a channel it never declared on every third poll.
struct SloppyAdapter {
    polls: AtomicU64,
}

#[async_trait]
impl DeviceAdapter for SloppyAdapter {
    fn identify(&self) -> String {
        "sloppy".into()
    }

    async fn poll(&self) -> Result<Sample, DeviceError> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst);
        if n % 3 == 2 {
            return Ok(Sample::now([("value", 1.0), ("bogus", 2.0)]));
        }
        Ok(Sample::now([("value", 1.0)]))
    }
}

/// Never fails; counts every sample it hands out.
#[derive(Default)]
struct CountingAdapter {
    produced: AtomicU64,
}

#[async_trait]
impl DeviceAdapter for CountingAdapter {
    fn identify(&self) -> String {
        "counting".into()
    }

    async fn poll(&self) -> Result<Sample, DeviceError> {
        let n = self.produced.fetch_add(1, Ordering::SeqCst);
        Ok(Sample::now([("value", n as f64)]))
    }
}

fn every(ms: u64, channels: &[&str]) -> AcquisitionConfig {
    AcquisitionConfig::new(channels.iter().copied()).with_poll_interval(Duration::from_millis(ms))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn n_successful_polls_give_exactly_n_rows() {
    let mut manager = BufferManager::default();
    manager
        .register(vec![DeviceRegistration::new(
            "D1",
            Arc::new(FiniteAdapter::new(25)),
            every(1, &["x", "y"]),
        )])
        .unwrap();

    manager.start_collection().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    manager.stop_collection().await.unwrap();

    let table = manager.snapshot().device("D1").cloned().unwrap();
    assert_eq!(table.validate("D1").unwrap(), 25);
    assert_eq!(table.timestamps.len(), 25);
    assert_eq!(table.column("x").unwrap().len(), 25);
    assert_eq!(table.column("y").unwrap().len(), 25);

    // Production order is preserved.
    let xs = table.column("x").unwrap();
    assert!(xs.windows(2).all(|w| w[0] < w[1]));
    assert!(table.timestamps.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_devices_do_not_cross_contaminate() {
    let mut manager = BufferManager::default();
    manager
        .register(vec![
            DeviceRegistration::new(
                "A",
                Arc::new(ConstantAdapter::new(["value"], 1.0)),
                every(2, &["value"]),
            ),
            DeviceRegistration::new(
                "B",
                Arc::new(ConstantAdapter::new(["value", "other"], 2.0)),
                every(3, &["value", "other"]),
            ),
        ])
        .unwrap();

    manager.start_collection().await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    manager.stop_collection().await.unwrap();

    let snapshot = manager.snapshot();
    snapshot.validate().unwrap();

    let a = snapshot.device("A").unwrap();
    let b = snapshot.device("B").unwrap();
    assert!(!a.is_empty() && !b.is_empty());
    assert_eq!(a.column_names(), vec!["timestamp", "value"]);
    assert_eq!(b.column_names(), vec!["timestamp", "value", "other"]);
    assert!(a.column("value").unwrap().iter().all(|v| *v == 1.0));
    assert!(b.column("value").unwrap().iter().all(|v| *v == 2.0));
}

#[tokio::test]
async fn malformed_samples_never_desynchronize_columns() {
    let mut manager = BufferManager::default();
    manager
        .register(vec![DeviceRegistration::new(
            "D1",
            Arc::new(SloppyAdapter {
                polls: AtomicU64::new(0),
            }),
            every(1, &["value"]),
        )])
        .unwrap();

    manager.start_collection().await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(manager.pipeline_states()["D1"], PipelineState::Running);
    manager.stop_collection().await.unwrap();

    let table = manager.snapshot().device("D1").cloned().unwrap();
    let rows = table.validate("D1").unwrap();
    assert!(rows > 0);
    assert_eq!(table.column_names(), vec!["timestamp", "value"]);
}

#[tokio::test]
async fn snapshot_is_a_detached_copy() {
    let mut manager = BufferManager::default();
    manager
        .register(vec![DeviceRegistration::new(
            "D1",
            Arc::new(ConstantAdapter::new(["value"], 5.0)),
            every(1, &["value"]),
        )])
        .unwrap();

    manager.start_collection().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let early = manager.snapshot();
    let early_rows = early.total_rows();
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.stop_collection().await.unwrap();

    assert_eq!(early.total_rows(), early_rows);
    assert!(manager.snapshot().total_rows() > early_rows);
}

#[tokio::test]
async fn restart_after_stop_keeps_appending() {
    let mut manager = BufferManager::default();
    manager
        .register(vec![DeviceRegistration::new(
            "D1",
            Arc::new(ConstantAdapter::new(["value"], 5.0)),
            every(2, &["value"]),
        )])
        .unwrap();

    manager.start_collection().await.unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;
    manager.stop_collection().await.unwrap();
    let first = manager.accumulator("D1").unwrap().len();

    manager.start_collection().await.unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;
    manager.stop_collection().await.unwrap();

    assert!(manager.accumulator("D1").unwrap().len() > first);
}

#[test]
fn empty_registration_is_a_config_error() {
    let mut manager = BufferManager::default();
    assert!(matches!(manager.register(Vec::new()), Err(BufferError::Config(_))));
}

#[tokio::test]
async fn stop_completes_quickly_with_slow_polling() {
    let mut manager = BufferManager::default();
    manager
        .register(vec![DeviceRegistration::new(
            "slow",
            Arc::new(ConstantAdapter::new(["value"], 0.0)),
            every(10_000, &["value"]),
        )])
        .unwrap();

    manager.start_collection().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = std::time::Instant::now();
    manager.stop_collection().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    // The first tick fires immediately.
    assert_eq!(manager.accumulator("slow").unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bounded_queue_delivers_exactly_n_rows() {
    let mut manager = BufferManager::default();
    manager
        .register(vec![DeviceRegistration::new(
            "D1",
            Arc::new(FiniteAdapter::new(40)),
            every(1, &["x", "y"]).with_queue_capacity(2),
        )])
        .unwrap();

    manager.start_collection().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.stop_collection().await.unwrap();

    let table = manager.snapshot().device("D1").cloned().unwrap();
    assert_eq!(table.validate("D1").unwrap(), 40);
    let xs = table.column("x").unwrap();
    assert!(xs.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bounded_queue_with_busy_reader_stops_promptly() {
    let adapter = Arc::new(CountingAdapter::default());
    let mut manager = BufferManager::default();
    manager
        .register(vec![DeviceRegistration::new(
            "D1",
            adapter.clone(),
            every(1, &["value"]).with_queue_capacity(1),
        )])
        .unwrap();

    // Readers contend with the aggregation worker for the table lock.
    let accumulator = manager.accumulator("D1").unwrap();
    let (done_tx, mut done_rx) = tokio::sync::oneshot::channel::<()>();
    let reader = tokio::spawn(async move {
        let mut copies = 0u64;
        while done_rx.try_recv().is_err() {
            let _ = accumulator.snapshot();
            copies += 1;
            tokio::task::yield_now().await;
        }
        copies
    });

    manager.start_collection().await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let started = std::time::Instant::now();
    manager.stop_collection().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    let _ = done_tx.send(());
    assert!(reader.await.unwrap() > 0);

    let rows = manager.accumulator("D1").unwrap().len() as u64;
    let produced = adapter.produced.load(Ordering::SeqCst);
    assert!(rows > 0);
    // At most one queued sample and one in-flight poll are lost on stop.
    assert!(produced - rows <= 2, "produced {produced}, stored {rows}");

    let table = manager.snapshot().device("D1").cloned().unwrap();
    assert_eq!(table.validate("D1").unwrap() as u64, rows);
    let values = table.column("value").unwrap();
    assert!(values.windows(2).all(|w| w[1] == w[0] + 1.0));
}
