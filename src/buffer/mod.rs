//! Write buffering: operation records, the buffer, and the flush engine

pub mod flush;
pub mod operation;
pub mod stats;
pub mod write_buffer;

pub use flush::{group_records, FlushEngine, FlushMode, FlushReport, GroupOutcome, ModelGroup};
pub use operation::{OperationKind, OperationOptions, OperationRecord};
pub use stats::{BufferMetrics, Statistics};
pub use write_buffer::{SharedSettings, WriteBuffer};
