//! Table storage backends for recording sessions.
//!
//! A recording session writes every device's accumulator into one file as a
//! set of named tables. Each snapshot cycle overwrites the same table keys, so
//! the file always mirrors the most recent consistent snapshot.
//!
//! Backends implement [`TableStore`]. Calls are synchronous; the snapshot
//! writer runs them on the blocking thread pool.
use crate::{data::accumulator::DeviceTable, error::BufferError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Group under which device tables are stored.
pub const RAW_GROUP: &str = "raw";

/// Table key for a device, e.g. `raw/ITC1`.
pub fn table_key(device: &str) -> String {
    format!("{RAW_GROUP}/{device}")
}

/// Session-level facts written alongside the tables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Measurement name given when recording started.
    pub measurement_name: String,
    /// When recording started.
    pub started_at: DateTime<Utc>,
}

/// A writer for one recording session file.
pub trait TableStore: Send {
    /// Backend identifier, e.g. `"json"`.
    fn backend(&self) -> &'static str;

    /// File extension without the dot.
    fn extension(&self) -> &'static str;

    /// Prepares the session file at `path`.
    fn init(&mut self, path: &Path, session: &SessionInfo) -> Result<(), BufferError>;

    /// Stores `table` under `key`, replacing any previous content.
    fn write_table(&mut self, key: &str, table: &DeviceTable) -> Result<(), BufferError>;

    /// Makes all tables written so far durable.
    fn flush(&mut self) -> Result<(), BufferError>;
}

/// One persisted device table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedTable {
    /// Name of the index column.
    pub index: String,
    /// Index and value columns.
    #[serde(flatten)]
    pub data: DeviceTable,
}

/// Content of a JSON session file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionFile {
    /// Session metadata.
    #[serde(flatten)]
    pub session: SessionInfo,
    /// Time of the latest flush.
    pub updated_at: DateTime<Utc>,
    /// Device tables keyed `raw/<device>`.
    pub tables: BTreeMap<String, PersistedTable>,
}

impl SessionFile {
    /// Table of a device, looked up by device name.
    pub fn device(&self, device: &str) -> Option<&DeviceTable> {
        self.tables.get(&table_key(device)).map(|table| &table.data)
    }
}

/// Load a JSON session file.
pub fn read_session(path: &Path) -> Result<SessionFile, BufferError> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// JSON session writer.
///
/// Keeps the latest version of every table in memory and rewrites the whole
/// document on [`flush`](TableStore::flush): the document is written to a
/// sibling temporary file and renamed over the target, so readers never see a
/// half-written file.
#[derive(Default)]
pub struct JsonTableStore {
    path: PathBuf,
    document: Option<SessionFile>,
}

impl JsonTableStore {
    /// Store that does nothing until [`TableStore::init`].
    pub fn new() -> Self {
        Self::default()
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl TableStore for JsonTableStore {
    fn backend(&self) -> &'static str {
        "json"
    }

    fn extension(&self) -> &'static str {
        "json"
    }

    fn init(&mut self, path: &Path, session: &SessionInfo) -> Result<(), BufferError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        self.path = path.to_path_buf();
        self.document = Some(SessionFile {
            session: session.clone(),
            updated_at: session.started_at,
            tables: BTreeMap::new(),
        });
        // Claim the path right away, even before the first table arrives.
        self.flush()?;
        tracing::info!(path = %self.path.display(), "JSON table store initialized");
        Ok(())
    }

    fn write_table(&mut self, key: &str, table: &DeviceTable) -> Result<(), BufferError> {
        let document = self
            .document
            .as_mut()
            .ok_or_else(|| BufferError::Storage("JSON table store not initialized".into()))?;
        document.tables.insert(
            key.to_string(),
            PersistedTable {
                index: crate::core::TIMESTAMP_COLUMN.to_string(),
                data: table.clone(),
            },
        );
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BufferError> {
        let staging = self.staging_path();
        let document = self
            .document
            .as_mut()
            .ok_or_else(|| BufferError::Storage("JSON table store not initialized".into()))?;
        document.updated_at = Utc::now();

        let mut writer = BufWriter::new(File::create(&staging)?);
        serde_json::to_writer(&mut writer, document)?;
        writer.flush()?;
        drop(writer);
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

/// HDF5 session writer.
///
/// Layout: one group per table key (`raw/<device>`) holding a `timestamp`
/// dataset (nanoseconds since the Unix epoch) and one `f64` dataset per
/// channel. Groups are replaced wholesale on every write.
#[cfg(feature = "storage_hdf5")]
#[derive(Default)]
pub struct Hdf5TableStore {
    file: Option<hdf5::File>,
}

#[cfg(feature = "storage_hdf5")]
impl Hdf5TableStore {
    /// Store that does nothing until [`TableStore::init`].
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(feature = "storage_hdf5")]
fn hdf5_err(err: hdf5::Error) -> BufferError {
    BufferError::Storage(err.to_string())
}

#[cfg(feature = "storage_hdf5")]
impl TableStore for Hdf5TableStore {
    fn backend(&self) -> &'static str {
        "hdf5"
    }

    fn extension(&self) -> &'static str {
        "h5"
    }

    fn init(&mut self, path: &Path, session: &SessionInfo) -> Result<(), BufferError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = hdf5::File::create(path).map_err(hdf5_err)?;
        file.new_attr::<i64>()
            .create("started_at_ns")
            .and_then(|attr| {
                attr.write_scalar(&session.started_at.timestamp_nanos_opt().unwrap_or_default())
            })
            .map_err(hdf5_err)?;
        self.file = Some(file);
        tracing::info!(path = %path.display(), "HDF5 table store initialized");
        Ok(())
    }

    fn write_table(&mut self, key: &str, table: &DeviceTable) -> Result<(), BufferError> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| BufferError::Storage("HDF5 table store not initialized".into()))?;

        let (parent_name, table_name) = key.rsplit_once('/').unwrap_or((RAW_GROUP, key));
        let parent = match file.group(parent_name) {
            Ok(group) => group,
            Err(_) => file.create_group(parent_name).map_err(hdf5_err)?,
        };
        if parent.link_exists(table_name) {
            parent.unlink(table_name).map_err(hdf5_err)?;
        }
        let group = parent.create_group(table_name).map_err(hdf5_err)?;

        let timestamps: Vec<i64> = table
            .timestamps
            .iter()
            .map(|ts| ts.timestamp_nanos_opt().unwrap_or_default())
            .collect();
        group
            .new_dataset_builder()
            .with_data(timestamps.as_slice())
            .create(crate::core::TIMESTAMP_COLUMN)
            .map_err(hdf5_err)?;

        for crate::data::accumulator::Column { name, values } in &table.columns {
            group
                .new_dataset_builder()
                .with_data(values.as_slice())
                .create(name.as_str())
                .map_err(hdf5_err)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BufferError> {
        if let Some(file) = self.file.as_ref() {
            file.flush().map_err(hdf5_err)?;
        }
        Ok(())
    }
}
