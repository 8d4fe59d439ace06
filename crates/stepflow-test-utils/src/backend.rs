use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use stepflow_core::traits::ReasoningBackend;
use stepflow_core::{AgentReply, AgentRequest, AgentRole, Result, StepflowError, Usage};

enum Scripted {
    Reply(AgentReply),
    Error(String),
    Delayed(Duration, AgentReply),
    Hang,
}

/// Reasoning backend that plays back scripted entries per step id.
///
/// Each call pops the next entry queued for the request's step id (the
/// planner asks with step id `ROOT`), falling back to the queue of the
/// role name. An empty queue answers with a backend error.
#[derive(Default)]
pub struct ScriptedBackend {
    queues: Mutex<HashMap<String, VecDeque<Scripted>>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, key: &str, entry: Scripted) -> Self {
        if let Ok(mut queues) = self.queues.lock() {
            queues.entry(key.to_string()).or_default().push_back(entry);
        }
        self
    }

    pub fn reply(self, key: &str, body: Value) -> Self {
        self.push(key, Scripted::Reply(AgentReply::new(body)))
    }

    pub fn reply_with_usage(self, key: &str, body: Value, usage: Usage) -> Self {
        self.push(key, Scripted::Reply(AgentReply { body, usage }))
    }

    /// Answer with a (retryable) backend error.
    pub fn fail(self, key: &str, message: &str) -> Self {
        self.push(key, Scripted::Error(message.to_string()))
    }

    /// Answer after `ms` milliseconds.
    pub fn delayed(self, key: &str, ms: u64, body: Value) -> Self {
        self.push(
            key,
            Scripted::Delayed(Duration::from_millis(ms), AgentReply::new(body)),
        )
    }

    /// Never answer.
    pub fn hang(self, key: &str) -> Self {
        self.push(key, Scripted::Hang)
    }

    /// How many requests were made for `step_id`.
    pub fn calls_for(&self, step_id: &str) -> usize {
        self.requests
            .lock()
            .map(|r| r.iter().filter(|req| req.step_id == step_id).count())
            .unwrap_or(0)
    }

    /// Every request received, in arrival order.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next(&self, step_id: &str, role: AgentRole) -> Option<Scripted> {
        let mut queues = self.queues.lock().ok()?;
        for key in [step_id, role.as_str()] {
            if let Some(entry) = queues.get_mut(key).and_then(|q| q.pop_front()) {
                return Some(entry);
            }
        }
        None
    }
}

impl ReasoningBackend for ScriptedBackend {
    fn respond(&self, role: AgentRole, request: AgentRequest) -> BoxFuture<'_, Result<AgentReply>> {
        Box::pin(async move {
            let step_id = request.step_id.clone();
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request);
            }
            match self.next(&step_id, role) {
                Some(Scripted::Reply(reply)) => Ok(reply),
                Some(Scripted::Error(message)) => Err(StepflowError::Backend(message)),
                Some(Scripted::Delayed(delay, reply)) => {
                    tokio::time::sleep(delay).await;
                    Ok(reply)
                }
                Some(Scripted::Hang) => std::future::pending().await,
                None => Err(StepflowError::Backend(format!(
                    "no scripted reply left for step {} ({})",
                    step_id, role
                ))),
            }
        })
    }
}
