//! Periodic snapshot writer.
//!
//! While recording, a background task captures every accumulator at a fixed
//! interval and rewrites the whole session file through a [`TableStore`],
//! one `raw/<device>` table per device. The file name is fixed when the
//! recording starts:
//!
//! ```text
//! <folder>/2024-03-05T14-07-09_Test_Measurement.json
//! ```
//!
//! A snapshot that fails validation is skipped as a whole: nothing from that
//! cycle reaches the file, a [`BufferEvent::SnapshotSkipped`] is published and
//! the next cycle tries again. Storage errors are logged and counted; the
//! writer keeps going. Blocking file I/O runs on the blocking pool.

use crate::data::accumulator::{Accumulator, BufferSnapshot};
use crate::data::storage::{table_key, SessionInfo, TableStore};
use crate::error::{AppResult, BufferError};
use crate::messages::BufferEvent;
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::Instrument;

/// Default delay between two snapshot writes.
pub const DEFAULT_RECORD_INTERVAL: Duration = Duration::from_millis(100);

/// Format of the timestamp prefix in session file names.
pub const FILE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// Anything that can produce a consistent-looking [`BufferSnapshot`].
pub trait SnapshotSource: Send + Sync {
    /// Copy every table.
    fn capture(&self) -> BufferSnapshot;
}

/// The manager's accumulators.
#[derive(Clone, Debug, Default)]
pub struct AccumulatorSet(pub Vec<Arc<Accumulator>>);

impl SnapshotSource for AccumulatorSet {
    fn capture(&self) -> BufferSnapshot {
        BufferSnapshot::capture(self.0.iter().map(Arc::as_ref))
    }
}

/// Session file name for a recording started at `started`.
pub fn session_file_name<Tz>(started: &DateTime<Tz>, measurement_name: &str, extension: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}_{}.{}",
        started.format(FILE_TIMESTAMP_FORMAT),
        measurement_name,
        extension
    )
}

/// First free session path in `folder`: `<stamp>_<name>.<ext>`, then
/// `<stamp>_<name>_1.<ext>` and so on.
pub fn unique_session_path<Tz>(
    folder: &Path,
    started: &DateTime<Tz>,
    measurement_name: &str,
    extension: &str,
) -> PathBuf
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let mut path = folder.join(session_file_name(started, measurement_name, extension));
    let mut suffix = 1u32;
    while path.exists() {
        let name = format!("{measurement_name}_{suffix}");
        path = folder.join(session_file_name(started, &name, extension));
        suffix += 1;
    }
    path
}

/// Create the folder, pick the file and initialise the store. Blocking.
fn open_session(
    mut store: Box<dyn TableStore>,
    folder: &Path,
    session: &SessionInfo,
) -> AppResult<(Box<dyn TableStore>, PathBuf)> {
    std::fs::create_dir_all(folder)?;
    let started = session.started_at.with_timezone(&Local);
    let path = unique_session_path(folder, &started, &session.measurement_name, store.extension());
    store.init(&path, session)?;
    Ok((store, path))
}

/// Counters returned when a snapshot writer stops.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingReport {
    /// Session file that was written.
    pub path: PathBuf,
    /// Snapshots written successfully, including the final one.
    pub snapshots: u64,
    /// Cycles skipped because the snapshot was torn.
    pub skipped: u64,
    /// Cycles whose write failed.
    pub failed: u64,
}

/// Handle to a running recording.
pub struct SnapshotWriter {
    path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<RecordingReport>,
}

impl SnapshotWriter {
    /// Open the session file and start writing snapshots every `interval`.
    ///
    /// The folder is created if missing. An existing session file is never
    /// reused: a numeric suffix is added to the name instead. The first
    /// snapshot is written right away; a final one is written when the writer
    /// is stopped.
    pub async fn start(
        source: Arc<dyn SnapshotSource>,
        store: Box<dyn TableStore>,
        measurement_name: &str,
        folder: &Path,
        interval: Duration,
        events: broadcast::Sender<BufferEvent>,
    ) -> AppResult<Self> {
        if interval.is_zero() {
            return Err(BufferError::config("record interval must be greater than zero"));
        }

        let backend = store.backend();
        let session = SessionInfo {
            measurement_name: measurement_name.to_string(),
            started_at: Utc::now(),
        };
        let folder = folder.to_path_buf();
        let (store, path) = tokio::task::spawn_blocking(move || open_session(store, &folder, &session))
            .await
            .map_err(|e| BufferError::WorkerPanicked("recorder".into(), e.to_string()))??;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let span = tracing::info_span!("recorder", path = %path.display());
        let task = tokio::spawn(
            write_loop(source, store, path.clone(), interval, events, shutdown_rx).instrument(span),
        );

        tracing::info!(path = %path.display(), backend, ?interval, "Recording started");
        Ok(Self {
            path,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    /// Session file this writer is producing.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the write loop is still alive.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Ask the write loop to finish; [`join`](Self::join) waits for it.
    pub fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }

    /// Stop, wait for the final write, and return the counters.
    pub async fn join(mut self) -> AppResult<RecordingReport> {
        self.stop();
        let abort = self.task.abort_handle();
        match tokio::time::timeout(crate::acquisition::JOIN_TIMEOUT, self.task).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(BufferError::WorkerPanicked("recorder".into(), e.to_string())),
            Err(_) => {
                abort.abort();
                Err(BufferError::WorkerPanicked(
                    "recorder".into(),
                    "join timed out".to_string(),
                ))
            }
        }
    }
}

async fn write_loop(
    source: Arc<dyn SnapshotSource>,
    store: Box<dyn TableStore>,
    path: PathBuf,
    period: Duration,
    events: broadcast::Sender<BufferEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> RecordingReport {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut store = Some(store);
    let mut report = RecordingReport {
        path,
        ..Default::default()
    };

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {}
        }
        if !write_cycle(source.as_ref(), &mut store, &mut report, &events).await {
            return report;
        }
    }

    write_cycle(source.as_ref(), &mut store, &mut report, &events).await;
    tracing::info!(
        snapshots = report.snapshots,
        skipped = report.skipped,
        failed = report.failed,
        "Recording stopped"
    );
    report
}

/// One capture-validate-write cycle. Returns `false` once the store is lost.
async fn write_cycle(
    source: &dyn SnapshotSource,
    store: &mut Option<Box<dyn TableStore>>,
    report: &mut RecordingReport,
    events: &broadcast::Sender<BufferEvent>,
) -> bool {
    let snapshot = source.capture();
    if let Err(err) = snapshot.validate() {
        report.skipped += 1;
        tracing::warn!(error = %err, "Skipping torn snapshot");
        let _ = events.send(BufferEvent::SnapshotSkipped {
            reason: err.to_string(),
        });
        return true;
    }

    let Some(mut taken) = store.take() else {
        return false;
    };
    let outcome = tokio::task::spawn_blocking(move || {
        let result = persist(taken.as_mut(), &snapshot);
        (taken, result)
    })
    .await;

    match outcome {
        Ok((returned, Ok(()))) => {
            *store = Some(returned);
            report.snapshots += 1;
            true
        }
        Ok((returned, Err(err))) => {
            *store = Some(returned);
            report.failed += 1;
            tracing::error!(error = %err, "Snapshot write failed");
            true
        }
        Err(err) => {
            report.failed += 1;
            tracing::error!(error = %err, "Snapshot write task panicked, recording ends");
            false
        }
    }
}

fn persist(store: &mut dyn TableStore, snapshot: &BufferSnapshot) -> Result<(), BufferError> {
    for (device, table) in &snapshot.devices {
        store.write_table(&table_key(device), table)?;
    }
    store.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Sample;
    use crate::data::accumulator::{Column, DeviceTable};
    use crate::data::storage::{read_session, JsonTableStore};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn accumulators() -> AccumulatorSet {
        let itc = Arc::new(Accumulator::new("ITC1", ["TSorp", "THe3"]));
        let ah = Arc::new(Accumulator::new("AH1", ["capacitance"]));
        itc.append(&Sample::now([("TSorp", 4.2), ("THe3", 0.3)])).unwrap();
        ah.append(&Sample::now([("capacitance", 12.5)])).unwrap();
        AccumulatorSet(vec![itc, ah])
    }

    /// Returns a torn table on every other capture.
    struct FlakySource {
        captures: AtomicU64,
    }

    impl SnapshotSource for FlakySource {
        fn capture(&self) -> BufferSnapshot {
            let n = self.captures.fetch_add(1, Ordering::SeqCst);
            let mut table = DeviceTable::with_channels(["value"]);
            table.timestamps.push(Utc::now());
            table.columns[0].values.push(n as f64);
            if n % 2 == 1 {
                table.columns.push(Column {
                    name: "extra".into(),
                    values: Vec::new(),
                });
            }
            BufferSnapshot {
                taken_at: Utc::now(),
                devices: [("D1".to_string(), table)].into_iter().collect(),
            }
        }
    }

    #[test]
    fn file_name_format() {
        let started = Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        assert_eq!(
            session_file_name(&started, "Test_Measurement", "json"),
            "2024-03-05T14-07-09_Test_Measurement.json"
        );
    }

    #[tokio::test]
    async fn writes_one_table_per_device() {
        let dir = TempDir::new().unwrap();
        let (events, _) = broadcast::channel(8);
        let writer = SnapshotWriter::start(
            Arc::new(accumulators()),
            Box::new(JsonTableStore::new()),
            "cooldown",
            dir.path(),
            Duration::from_millis(10),
            events,
        )
        .await
        .unwrap();
        let path = writer.path().to_path_buf();
        assert!(path.file_name().unwrap().to_string_lossy().ends_with("_cooldown.json"));

        tokio::time::sleep(Duration::from_millis(35)).await;
        let report = writer.join().await.unwrap();
        assert!(report.snapshots >= 2);
        assert_eq!(report.failed, 0);

        let session = read_session(&path).unwrap();
        assert_eq!(session.session.measurement_name, "cooldown");
        let keys: Vec<_> = session.tables.keys().cloned().collect();
        assert_eq!(keys, vec!["raw/AH1", "raw/ITC1"]);
        assert_eq!(session.device("ITC1").unwrap().column("THe3").unwrap(), &[0.3]);
    }

    #[tokio::test]
    async fn creates_missing_folder() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("nested").join("data");
        let (events, _) = broadcast::channel(8);
        let writer = SnapshotWriter::start(
            Arc::new(accumulators()),
            Box::new(JsonTableStore::new()),
            "m",
            &folder,
            Duration::from_millis(10),
            events,
        )
        .await
        .unwrap();
        let path = writer.path().to_path_buf();
        writer.join().await.unwrap();
        assert!(folder.is_dir());
        assert!(path.exists());
    }

    #[tokio::test]
    #[traced_test]
    async fn torn_snapshots_are_skipped_whole() {
        let dir = TempDir::new().unwrap();
        let (events, mut events_rx) = broadcast::channel(64);
        let writer = SnapshotWriter::start(
            Arc::new(FlakySource {
                captures: AtomicU64::new(0),
            }),
            Box::new(JsonTableStore::new()),
            "flaky",
            dir.path(),
            Duration::from_millis(5),
            events,
        )
        .await
        .unwrap();
        let path = writer.path().to_path_buf();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let report = writer.join().await.unwrap();
        assert!(report.skipped > 0);
        assert!(report.snapshots > 0);
        assert!(logs_contain("Skipping torn snapshot"));
        assert!(matches!(
            events_rx.try_recv(),
            Ok(BufferEvent::SnapshotSkipped { .. })
        ));

        // Only validated snapshots ever reach the file.
        let session = read_session(&path).unwrap();
        let table = session.device("D1").unwrap();
        assert_eq!(table.column_names(), vec!["timestamp", "value"]);
        assert_eq!(table.column("value").unwrap()[0] as u64 % 2, 0);
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (events, _) = broadcast::channel(1);
        let result = SnapshotWriter::start(
            Arc::new(AccumulatorSet::default()),
            Box::new(JsonTableStore::new()),
            "m",
            dir.path(),
            Duration::ZERO,
            events,
        )
        .await;
        assert!(matches!(result, Err(BufferError::Config(_))));
    }

    #[tokio::test]
    async fn existing_session_file_is_never_reused() {
        let dir = TempDir::new().unwrap();
        let started = Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let first = unique_session_path(dir.path(), &started, "run", "json");
        assert!(first.ends_with("2024-03-05T14-07-09_run.json"));

        std::fs::write(&first, "{}").unwrap();
        let second = unique_session_path(dir.path(), &started, "run", "json");
        assert!(second.ends_with("2024-03-05T14-07-09_run_1.json"));
        std::fs::write(&second, "{}").unwrap();
        assert!(unique_session_path(dir.path(), &started, "run", "json")
            .ends_with("2024-03-05T14-07-09_run_2.json"));

        // Two writers started back to back within the same second.
        let (events, _) = broadcast::channel(8);
        let mut paths = Vec::new();
        for _ in 0..2 {
            let writer = SnapshotWriter::start(
                Arc::new(accumulators()),
                Box::new(JsonTableStore::new()),
                "twice",
                dir.path(),
                Duration::from_millis(10),
                events.clone(),
            )
            .await
            .unwrap();
            paths.push(writer.path().to_path_buf());
            writer.join().await.unwrap();
        }
        assert_ne!(paths[0], paths[1]);
        assert!(paths.iter().all(|path| read_session(path).is_ok()));
    }
}
