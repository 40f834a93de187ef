//! In-memory accumulation and session storage.
pub mod accumulator;
pub mod storage;
pub mod storage_factory;

pub use accumulator::{Accumulator, BufferSnapshot, Column, DeviceTable, SampleRejection};
pub use storage::{read_session, table_key, SessionFile, SessionInfo, TableStore};
pub use storage_factory::TableStoreRegistry;
