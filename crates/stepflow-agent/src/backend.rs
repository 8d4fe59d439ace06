use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info, warn};

use stepflow_core::config::RetryConfig;
use stepflow_core::traits::ReasoningBackend;
use stepflow_core::{AgentReply, AgentRequest, AgentRole, Result, StepflowError, Usage};

/// A backend that retries transient failures and then falls back to
/// alternative backends.
pub struct RetryingBackend {
    primary: Arc<dyn ReasoningBackend>,
    fallbacks: Vec<Arc<dyn ReasoningBackend>>,
    retry_config: RetryConfig,
}

impl RetryingBackend {
    pub fn new(
        primary: Arc<dyn ReasoningBackend>,
        fallbacks: Vec<Arc<dyn ReasoningBackend>>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
        }
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl ReasoningBackend for RetryingBackend {
    fn respond(&self, role: AgentRole, request: AgentRequest) -> BoxFuture<'_, Result<AgentReply>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            let mut last_err = None;
            for attempt in 0..=max_retries {
                match self.primary.respond(role, request.clone()).await {
                    Ok(reply) => return Ok(reply),
                    Err(e) => {
                        if e.is_retryable() && attempt < max_retries {
                            let backoff = calculate_backoff(attempt, &self.retry_config);
                            warn!(
                                step_id = %request.step_id,
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying backend request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }

            if !self.fallbacks.is_empty() {
                info!(step_id = %request.step_id, "Primary backend exhausted, trying fallbacks");
            }
            for (i, fallback) in self.fallbacks.iter().enumerate() {
                match fallback.respond(role, request.clone()).await {
                    Ok(reply) => {
                        info!(step_id = %request.step_id, fallback = i, "Fell back to alternative backend");
                        return Ok(reply);
                    }
                    Err(e) => {
                        warn!(fallback = i, error = %e, "Fallback backend also failed");
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| StepflowError::Backend("all backends failed".into())))
        })
    }
}

/// Serves pre-recorded replies from a JSON file.
///
/// The file maps a step id (or a role name, or `ROOT` for the planner) to a
/// list of replies served in order. The last reply of a list is repeated, so
/// retries see the same answer. An entry shaped `{"body": ..., "usage": ...}`
/// carries usage; anything else is taken as the reply body itself.
pub struct ReplayBackend {
    replies: Mutex<HashMap<String, VecDeque<AgentReply>>>,
}

impl ReplayBackend {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let raw: HashMap<String, Value> = serde_json::from_str(content)?;
        let mut replies = HashMap::new();
        for (key, entries) in raw {
            let list = match entries {
                Value::Array(items) => items,
                single => vec![single],
            };
            let queue: VecDeque<AgentReply> = list.into_iter().map(into_reply).collect();
            if !queue.is_empty() {
                replies.insert(key, queue);
            }
        }
        debug!(keys = replies.len(), "Loaded replay script");
        Ok(Self {
            replies: Mutex::new(replies),
        })
    }

    fn next_reply(&self, keys: &[&str]) -> Option<AgentReply> {
        let mut replies = self.replies.lock().ok()?;
        for key in keys {
            if let Some(queue) = replies.get_mut(*key) {
                return if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                };
            }
        }
        None
    }
}

fn into_reply(entry: Value) -> AgentReply {
    let is_wrapped = entry
        .as_object()
        .map(|o| o.contains_key("body") && o.keys().all(|k| k == "body" || k == "usage"))
        .unwrap_or(false);
    if is_wrapped {
        let usage = entry
            .get("usage")
            .cloned()
            .and_then(|u| serde_json::from_value::<Usage>(u).ok())
            .unwrap_or_default();
        let body = entry.get("body").cloned().unwrap_or(Value::Null);
        AgentReply { body, usage }
    } else {
        AgentReply::new(entry)
    }
}

impl ReasoningBackend for ReplayBackend {
    fn respond(&self, role: AgentRole, request: AgentRequest) -> BoxFuture<'_, Result<AgentReply>> {
        Box::pin(async move {
            self.next_reply(&[request.step_id.as_str(), role.as_str()])
                .ok_or_else(|| {
                    StepflowError::Backend(format!(
                        "no recorded reply for step {} ({})",
                        request.step_id, role
                    ))
                })
        })
    }
}
