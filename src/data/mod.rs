//! Measurement records and where they go.
pub mod record;
pub mod sink;

pub use record::MeasurementRecord;
#[cfg(feature = "storage_csv")]
pub use sink::CsvSink;
pub use sink::{ChannelSink, DataSink, MemorySink};
