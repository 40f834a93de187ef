//! Per-device in-memory tables.
//!
//! An [`Accumulator`] is the growable table one aggregation worker appends
//! into. It holds a `timestamp` index plus one value column per declared
//! channel, and every append touches all columns under a single write lock,
//! so readers see either the whole row or none of it.
//!
//! Readers never borrow the live table. [`Accumulator::snapshot`] clones it
//! under the read lock into a [`DeviceTable`], and [`BufferSnapshot`] bundles
//! those copies for every registered device.

use crate::core::{Sample, TIMESTAMP_COLUMN};
use crate::error::BufferError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// One value column of a device table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Channel name.
    pub name: String,
    /// One value per row. Non-finite readings are kept as they are.
    #[serde(with = "float_column_serde")]
    pub values: Vec<f64>,
}

/// JSON has no NaN or infinity, so those values travel as the strings
/// `"NaN"`, `"inf"` and `"-inf"`.
mod float_column_serde {
    use serde::de::Error as _;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Encoded {
        Number(f64),
        Text(String),
    }

    fn label(value: f64) -> &'static str {
        if value.is_nan() {
            "NaN"
        } else if value > 0.0 {
            "inf"
        } else {
            "-inf"
        }
    }

    pub fn serialize<S>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            if value.is_finite() {
                seq.serialize_element(value)?;
            } else {
                seq.serialize_element(label(*value))?;
            }
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<Encoded>::deserialize(deserializer)?
            .into_iter()
            .map(|encoded| match encoded {
                Encoded::Number(value) => Ok(value),
                Encoded::Text(text) => match text.as_str() {
                    "NaN" => Ok(f64::NAN),
                    "inf" => Ok(f64::INFINITY),
                    "-inf" => Ok(f64::NEG_INFINITY),
                    other => Err(D::Error::custom(format!("invalid column value '{other}'"))),
                },
            })
            .collect()
    }
}

/// Column-oriented table of everything one device has produced.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTable {
    /// Index column.
    pub timestamps: Vec<DateTime<Utc>>,
    /// Value columns in declared channel order.
    pub columns: Vec<Column>,
}

/// Why a sample was refused by [`DeviceTable::append`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleRejection {
    /// A declared channel is absent from the sample.
    #[error("missing channel '{0}'")]
    MissingChannel(String),
    /// The sample carries a channel that was never declared.
    #[error("unexpected channel '{0}'")]
    UnexpectedChannel(String),
    /// The sample names the same channel twice.
    #[error("channel '{0}' reported more than once")]
    DuplicateChannel(String),
}

impl DeviceTable {
    /// Empty table with one column per channel.
    pub fn with_channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            timestamps: Vec::new(),
            columns: channels
                .into_iter()
                .map(|name| Column {
                    name: name.into(),
                    values: Vec::new(),
                })
                .collect(),
        }
    }

    /// Number of rows, i.e. the length of the timestamp index.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether no row has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Values of a channel. `"timestamp"` is not a value column.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|column| column.name == name)
            .map(|column| column.values.as_slice())
    }

    /// Declared channel names in column order.
    pub fn channel_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    /// Column names including the index, as they appear in a persisted table.
    pub fn column_names(&self) -> Vec<&str> {
        std::iter::once(TIMESTAMP_COLUMN)
            .chain(self.columns.iter().map(|column| column.name.as_str()))
            .collect()
    }

    /// Check that every value column is as long as the index.
    ///
    /// Returns the row count on success.
    pub fn validate(&self, table: &str) -> Result<usize, BufferError> {
        let rows = self.timestamps.len();
        for column in &self.columns {
            if column.values.len() != rows {
                return Err(BufferError::Structural {
                    table: table.to_string(),
                    message: format!(
                        "column '{}' has {} values but the index has {} rows",
                        column.name,
                        column.values.len(),
                        rows
                    ),
                });
            }
        }
        Ok(rows)
    }

    /// Append one sample as a new row.
    ///
    /// The sample must carry each declared channel exactly once and nothing
    /// else. A refused sample leaves the table untouched.
    pub fn append(&mut self, sample: &Sample) -> Result<(), SampleRejection> {
        let mut row = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let mut matches = sample
                .channels
                .iter()
                .filter(|(name, _)| *name == column.name);
            match (matches.next(), matches.next()) {
                (Some((_, value)), None) => row.push(*value),
                (Some(_), Some(_)) => {
                    return Err(SampleRejection::DuplicateChannel(column.name.clone()))
                }
                (None, _) => return Err(SampleRejection::MissingChannel(column.name.clone())),
            }
        }
        if let Some((name, _)) = sample
            .channels
            .iter()
            .find(|(name, _)| !self.columns.iter().any(|column| column.name == *name))
        {
            return Err(SampleRejection::UnexpectedChannel(name.clone()));
        }

        self.timestamps.push(sample.timestamp);
        for (column, value) in self.columns.iter_mut().zip(row) {
            column.values.push(value);
        }
        Ok(())
    }
}

/// Growable table owned for writing by a single aggregation worker.
#[derive(Debug)]
pub struct Accumulator {
    device: String,
    table: RwLock<DeviceTable>,
}

impl Accumulator {
    /// Empty accumulator with pre-allocated columns.
    pub fn new<I, S>(device: impl Into<String>, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            device: device.into(),
            table: RwLock::new(DeviceTable::with_channels(channels)),
        }
    }

    /// Name of the device this accumulator belongs to.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Append a sample atomically, returning the new row count.
    pub(crate) fn append(&self, sample: &Sample) -> Result<usize, SampleRejection> {
        let mut table = self.table.write();
        table.append(sample)?;
        Ok(table.len())
    }

    /// Current row count.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// Whether no row has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declared channel names.
    pub fn channels(&self) -> Vec<String> {
        self.table
            .read()
            .columns
            .iter()
            .map(|column| column.name.clone())
            .collect()
    }

    /// Copy of the table as of now.
    pub fn snapshot(&self) -> DeviceTable {
        self.table.read().clone()
    }
}

/// Read-only copy of every accumulator, keyed by device name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    /// When the copy was made.
    pub taken_at: DateTime<Utc>,
    /// One table per device.
    pub devices: BTreeMap<String, DeviceTable>,
}

impl BufferSnapshot {
    /// Copy each accumulator in turn.
    pub fn capture<'a, I>(accumulators: I) -> Self
    where
        I: IntoIterator<Item = &'a Accumulator>,
    {
        Self {
            taken_at: Utc::now(),
            devices: accumulators
                .into_iter()
                .map(|acc| (acc.device().to_string(), acc.snapshot()))
                .collect(),
        }
    }

    /// Table of one device.
    pub fn device(&self, name: &str) -> Option<&DeviceTable> {
        self.devices.get(name)
    }

    /// Device names in key order.
    pub fn device_names(&self) -> Vec<&str> {
        self.devices.keys().map(String::as_str).collect()
    }

    /// Validate every table, failing on the first torn one.
    pub fn validate(&self) -> Result<(), BufferError> {
        for (name, table) in &self.devices {
            table.validate(name)?;
        }
        Ok(())
    }

    /// Total number of rows across all devices.
    pub fn total_rows(&self) -> usize {
        self.devices.values().map(DeviceTable::len).sum()
    }
}
