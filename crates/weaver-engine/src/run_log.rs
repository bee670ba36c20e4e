use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use weaver_core::event::EventBus;
use weaver_core::types::{ExecutionEvent, ExecutionId};

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{execution_id}.jsonl` for the events of a single execution.
/// Every line is flushed as it is written, so a crashed run still leaves a
/// readable log.
pub struct RunLogger {
    log_dir: PathBuf,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a ExecutionEvent,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    /// Path the log for `execution_id` is written to.
    pub fn log_path(&self, execution_id: &ExecutionId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", execution_id))
    }

    /// Run the logger as a background task.
    ///
    /// Subscribes when called, not when first polled, so spawning the
    /// returned future before starting the execution captures every event.
    /// Stops at the execution's `execution_finished` event, on cancellation,
    /// or when the bus closes.
    pub fn run(
        self,
        event_bus: Arc<EventBus>,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        let rx = event_bus.subscribe();
        self.write_events(rx, execution_id, cancel)
    }

    async fn write_events(
        self,
        mut rx: broadcast::Receiver<ExecutionEvent>,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create run log directory");
            return;
        }

        let log_path = self.log_path(&execution_id);
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open run log");
                return;
            }
        };

        info!(path = %log_path.display(), execution_id = %execution_id, "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.execution_id() != &execution_id {
                                continue;
                            }
                            let entry = LogEntry {
                                timestamp: Utc::now().to_rfc3339(),
                                event: &event,
                            };
                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write run log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush run log");
                                }
                            }
                            if matches!(event, ExecutionEvent::ExecutionFinished { .. }) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }
}
