use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use stepflow_core::event::{EventBus, EventKind, WorkflowEvent};

const MAX_DETAIL_LEN: usize = 2000;

/// JSONL run logger.
///
/// Subscribes to the EventBus and writes one JSON object per line. The file
/// is append-only and flushed per entry, so a crash mid-run leaves every
/// earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    workflow_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

/// Minimum logger level at which an event kind is written.
fn event_level(kind: EventKind) -> u8 {
    match kind {
        EventKind::WorkflowStarted
        | EventKind::WorkflowCompleted
        | EventKind::WorkflowFailed
        | EventKind::WorkflowCancelled => 1,
        EventKind::StepStarted
        | EventKind::StepCompleted
        | EventKind::StepSkipped
        | EventKind::StepFailed => 2,
        _ => 3,
    }
}

impl RunLogger {
    /// `log_dir` is the base directory; logs go to
    /// `{log_dir}/{key}/{timestamp}.jsonl`, where the key is a session or run
    /// id. `level`: 1 = workflow events, 2 = + step events, 3 = everything.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and write in a background task. Events published after
    /// this returns are never missed.
    pub fn spawn(
        self,
        event_bus: &EventBus,
        key: impl Into<String>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<Option<PathBuf>> {
        let rx = event_bus.subscribe();
        let key = key.into();
        tokio::spawn(async move { self.write_events(rx, &key, cancel).await })
    }

    /// Write events until the end of a run or cancellation. Events already
    /// queued when the token fires are still written. Returns the log path,
    /// or `None` if the file could not be opened.
    async fn write_events(
        self,
        mut rx: Receiver<WorkflowEvent>,
        key: &str,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let dir = self.log_dir.join(key.replace(['/', '\\'], "_"));
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return None;
            }
        };

        info!(path = %log_path.display(), level = self.level, "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                biased;
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }
                            if event.kind.is_terminal() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
        Some(log_path)
    }

    /// Convert an event to a log entry, or `None` if filtered by level.
    fn event_to_entry(&self, event: &WorkflowEvent) -> Option<LogEntry> {
        if event_level(event.kind) > self.level {
            return None;
        }
        let detail = match event.payload {
            serde_json::Value::Null => None,
            ref payload => Some(truncate_detail(payload, MAX_DETAIL_LEN)),
        };
        Some(LogEntry {
            timestamp: event.timestamp.to_rfc3339(),
            run_id: event.run_id.clone(),
            workflow_id: event.workflow_id.clone(),
            event_type: event.kind.as_str().to_string(),
            detail,
        })
    }
}

/// Keep small payloads as-is; replace large ones with a string preview.
fn truncate_detail(value: &serde_json::Value, max_len: usize) -> serde_json::Value {
    let s = value.to_string();
    if s.len() <= max_len {
        return value.clone();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    serde_json::json!({ "preview": format!("{}...", &s[..end]) })
}
