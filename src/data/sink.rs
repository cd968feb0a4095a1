//! Destinations for measurement records.
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::data::record::MeasurementRecord;
use crate::error::{AppResult, DaqError};

#[cfg(feature = "storage_csv")]
use std::{fs::File, path::PathBuf};

/// Receives records in emission order.
#[async_trait]
pub trait DataSink: Send {
    /// Persist or forward one record.
    async fn write(&mut self, record: &MeasurementRecord) -> AppResult<()>;

    /// Called once after the run, successful or not.
    async fn flush(&mut self) -> AppResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<S: DataSink + ?Sized> DataSink for Box<S> {
    async fn write(&mut self, record: &MeasurementRecord) -> AppResult<()> {
        (**self).write(record).await
    }

    async fn flush(&mut self) -> AppResult<()> {
        (**self).flush().await
    }
}

/// Keeps every record in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<RwLock<Vec<MeasurementRecord>>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records written so far.
    pub async fn records(&self) -> Vec<MeasurementRecord> {
        self.records.read().await.clone()
    }

    /// Number of records written so far.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// True if nothing was written.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl DataSink for MemorySink {
    async fn write(&mut self, record: &MeasurementRecord) -> AppResult<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }
}

/// Forwards records to a tokio channel, e.g. a writer task or a GUI.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<MeasurementRecord>,
}

impl ChannelSink {
    /// Sink plus the receiving end, with room for `capacity` records.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MeasurementRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DataSink for ChannelSink {
    async fn write(&mut self, record: &MeasurementRecord) -> AppResult<()> {
        self.tx
            .send(record.clone())
            .await
            .map_err(|_| DaqError::Storage("record receiver dropped".to_string()))
    }
}

/// Writes one CSV row per record.
///
/// The header is taken from the first record: `run_id, plan, step,
/// direction, timestamp`, then every setpoint and reading column named
/// `terminal.parameter`.
#[cfg(feature = "storage_csv")]
pub struct CsvSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    columns: Option<Vec<crate::parameter::ParameterKey>>,
}

#[cfg(feature = "storage_csv")]
impl CsvSink {
    /// Create (or truncate) the file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let writer = csv::Writer::from_writer(File::create(&path)?);
        tracing::info!(path = %path.display(), "CSV sink created");
        Ok(Self {
            path,
            writer,
            columns: None,
        })
    }

    /// File being written.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(feature = "storage_csv")]
#[async_trait]
impl DataSink for CsvSink {
    async fn write(&mut self, record: &MeasurementRecord) -> AppResult<()> {
        let columns = match &self.columns {
            Some(columns) => columns.clone(),
            None => {
                let columns = record
                    .setpoints
                    .keys()
                    .chain(record.readings.keys())
                    .cloned()
                    .collect::<Vec<_>>();
                let header = ["run_id", "plan", "step", "direction", "timestamp"]
                    .into_iter()
                    .map(str::to_string)
                    .chain(columns.iter().map(ToString::to_string));
                self.writer
                    .write_record(header)
                    .map_err(|e| DaqError::Storage(e.to_string()))?;
                self.columns = Some(columns.clone());
                columns
            }
        };

        let direction = match record.direction {
            crate::experiment::plan::SweepDirection::Forward => "forward",
            crate::experiment::plan::SweepDirection::Backward => "backward",
        };
        let row = [
            record.run_id.to_string(),
            record.plan.clone(),
            record.step.to_string(),
            direction.to_string(),
            record.timestamp.to_rfc3339(),
        ]
        .into_iter()
        .chain(columns.iter().map(|key| {
            record
                .setpoint(key)
                .or_else(|| record.reading(key))
                .map(ToString::to_string)
                .unwrap_or_default()
        }));
        self.writer
            .write_record(row)
            .map_err(|e| DaqError::Storage(e.to_string()))
    }

    async fn flush(&mut self) -> AppResult<()> {
        self.writer.flush()?;
        tracing::info!(path = %self.path.display(), "CSV sink flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::plan::SweepDirection;
    use crate::parameter::{ParameterKey, Value};
    use chrono::Utc;
    use indexmap::IndexMap;
    use uuid::Uuid;

    fn record(step: usize, current: f64) -> MeasurementRecord {
        MeasurementRecord {
            run_id: Uuid::nil(),
            plan: "gate.voltage".into(),
            step,
            direction: SweepDirection::Forward,
            timestamp: Utc::now(),
            setpoints: IndexMap::from([(ParameterKey::new("gate", "voltage"), Value::Float(step as f64))]),
            readings: IndexMap::from([(ParameterKey::new("ohmic", "current"), Value::Float(current))]),
        }
    }

    #[tokio::test]
    async fn memory_sink_clones_share_records() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.write(&record(0, 0.5)).await.unwrap();
        writer.write(&record(1, 0.6)).await.unwrap();
        assert_eq!(sink.len().await, 2);
        assert_eq!(sink.records().await[1].step, 1);
    }

    #[tokio::test]
    async fn channel_sink_reports_dropped_receiver() {
        let (mut sink, mut rx) = ChannelSink::new(4);
        sink.write(&record(0, 0.5)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().step, 0);
        drop(rx);
        assert!(matches!(
            sink.write(&record(1, 0.5)).await,
            Err(DaqError::Storage(_))
        ));
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn csv_sink_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("sweep.csv");
        let mut sink = CsvSink::create(&path).unwrap();
        sink.write(&record(0, 0.5)).await.unwrap();
        sink.write(&record(1, 0.25)).await.unwrap();
        sink.flush().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "run_id,plan,step,direction,timestamp,gate.voltage,ohmic.current"
        );
        assert!(lines[2].ends_with(",1,0.25"));
    }
}
