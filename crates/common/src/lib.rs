pub mod error;

pub use error::{DealSyncError, DealSyncResult, ErrorKind, RecordError};
