use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use stepflow_core::event::EventBus;
use stepflow_core::types::{FlowEvent, SessionId};

/// JSONL runtime logger.
///
/// Subscribes to the EventBus and appends one JSON object per line for every
/// event of its session. Lines already written survive a crash mid-run.
pub struct RunLogger {
    log_dir: PathBuf,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a FlowEvent,
}

impl RunLogger {
    /// Logs go to `{log_dir}/{session_id}/{timestamp}.jsonl`.
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    /// Run the logger until the session terminates or `cancel` fires.
    pub async fn run(self, event_bus: Arc<EventBus>, session_id: SessionId, cancel: CancellationToken) {
        // Subscribe before any await so no early event is missed.
        let mut rx = event_bus.subscribe();

        let session_dir = self.log_dir.join(&session_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&session_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = session_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
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
                            if event.session_id() != &session_id {
                                continue;
                            }
                            let entry = LogEntry {
                                timestamp: Utc::now().to_rfc3339(),
                                event: &event,
                            };
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
                            if matches!(event, FlowEvent::SessionTerminated { .. }) {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
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

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_core::{AgentRole, NodeStatus, SessionStatus};

    #[tokio::test]
    async fn test_writes_session_events_until_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let sid = SessionId::from_str("s1");
        let logger = RunLogger::new(dir.path().to_path_buf());
        let handle = tokio::spawn(logger.run(bus.clone(), sid.clone(), CancellationToken::new()));

        // Let the logger subscribe.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        bus.publish(FlowEvent::SessionStarted {
            session_id: sid.clone(),
        });
        bus.publish(FlowEvent::StepStarted {
            session_id: SessionId::from_str("other"),
            step_id: "X".into(),
            role: AgentRole::Qa,
            attempt: 1,
            status: NodeStatus::Running,
        });
        bus.publish(FlowEvent::StepStarted {
            session_id: sid.clone(),
            step_id: "T1".into(),
            role: AgentRole::Thinker,
            attempt: 1,
            status: NodeStatus::Running,
        });
        bus.publish(FlowEvent::SessionTerminated {
            session_id: sid.clone(),
            status: SessionStatus::Completed,
        });
        handle.await.unwrap();

        let session_dir = dir.path().join("s1");
        let file = std::fs::read_dir(&session_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let content = std::fs::read_to_string(file).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "session_started");
        assert_eq!(lines[1]["step_id"], "T1");
        assert_eq!(lines[2]["status"], "completed");
        assert!(lines[0]["timestamp"].is_string());
    }
}
