//! Read-only live monitor of mapped channels.
//!
//! The monitor polls a fixed set of channels on a background task and
//! broadcasts every reading. It only ever calls `get`; sweep state is owned
//! by the orchestrator and never touched from here.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::hardware::registry::Channel;
use crate::parameter::{ParameterKey, Value};

/// One polled reading.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSample {
    /// Polled parameter
    pub key: ParameterKey,
    /// Reading
    pub value: Value,
    /// Time of the poll
    pub timestamp: DateTime<Utc>,
}

/// Background poller.
pub struct ParameterMonitor {
    sender: broadcast::Sender<MonitorSample>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ParameterMonitor {
    /// Start polling `channels` every `period` (at least 1 ms).
    pub fn spawn(channels: Vec<(ParameterKey, Channel)>, period: Duration, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let tx = sender.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        for (key, channel) in &channels {
                            match channel.get().await {
                                Ok(value) => {
                                    // no subscribers is fine
                                    let _ = tx.send(MonitorSample {
                                        key: key.clone(),
                                        value,
                                        timestamp: Utc::now(),
                                    });
                                }
                                Err(e) => tracing::debug!(%key, error = %e, "Monitor read failed"),
                            }
                        }
                    }
                }
            }
            tracing::debug!("Parameter monitor stopped");
        });

        Self {
            sender,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// Receive future samples.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorSample> {
        self.sender.subscribe()
    }

    /// Stop polling and wait for the task to end.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(error = %e, "Parameter monitor task failed");
        }
    }
}

impl Drop for ParameterMonitor {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}
