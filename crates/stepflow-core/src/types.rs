use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of agent kinds a plan node can be delegated to.
///
/// Agent-produced plans name roles either in short form (`coder`) or in
/// agent form (`CoderAgent`); both deserialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgentRole {
    /// Produces the initial plan graph for a query.
    #[serde(rename = "planner", alias = "PlannerAgent", alias = "DecisionAgent")]
    Planner,
    /// Gathers external information, usually through tool-calling code.
    #[serde(rename = "retriever", alias = "RetrieverAgent")]
    Retriever,
    #[serde(rename = "thinker", alias = "ThinkerAgent")]
    Thinker,
    #[serde(rename = "distiller", alias = "DistillerAgent")]
    Distiller,
    /// Produces code variants executed in the sandbox.
    #[serde(rename = "coder", alias = "CoderAgent")]
    Coder,
    #[serde(rename = "qa", alias = "QAAgent")]
    Qa,
    #[serde(rename = "formatter", alias = "FormatterAgent")]
    Formatter,
    #[serde(rename = "summarizer", alias = "SummarizerAgent")]
    Summarizer,
    #[serde(rename = "clarification", alias = "ClarificationAgent")]
    Clarification,
}

impl AgentRole {
    pub const ALL: [AgentRole; 9] = [
        Self::Planner,
        Self::Retriever,
        Self::Thinker,
        Self::Distiller,
        Self::Coder,
        Self::Qa,
        Self::Formatter,
        Self::Summarizer,
        Self::Clarification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Retriever => "retriever",
            Self::Thinker => "thinker",
            Self::Distiller => "distiller",
            Self::Coder => "coder",
            Self::Qa => "qa",
            Self::Formatter => "formatter",
            Self::Summarizer => "summarizer",
            Self::Clarification => "clarification",
        }
    }

    /// Whether replies from this role carry `code_variants` instead of `outputs`.
    pub fn produces_code(&self) -> bool {
        matches!(self, Self::Coder | Self::Retriever)
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a plan node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One of the (at most three) alternative code proposals for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Variant {
    A,
    B,
    C,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Self::A, Self::B, Self::C];

    pub fn letter(&self) -> char {
        match self {
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
        }
    }

    pub fn from_letter(c: char) -> Option<Self> {
        match c {
            'A' => Some(Self::A),
            'B' => Some(Self::B),
            'C' => Some(Self::C),
            _ => None,
        }
    }

    /// Key under which a reply carries this variant's code, e.g. `CODE_T3B`.
    pub fn code_key(&self, step_id: &str) -> String {
        format!("CODE_{}{}", step_id, self.letter())
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Build the store key `<name>_<step><variant>` for a step output.
pub fn output_key(name: &str, step_id: &str, variant: Option<Variant>) -> String {
    match variant {
        Some(v) => format!("{}_{}{}", name, step_id, v.letter()),
        None => format!("{}_{}", name, step_id),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanningStrategy {
    #[default]
    Conservative,
    Exploratory,
}

/// Cumulative reasoning cost for a step or a whole session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd += other.cost_usd;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Number,
    Boolean,
    List,
    Object,
    Null,
    File,
}

impl ContentType {
    pub fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(_) => Self::Boolean,
            serde_json::Value::Number(_) => Self::Number,
            serde_json::Value::String(_) => Self::Text,
            serde_json::Value::Array(_) => Self::List,
            serde_json::Value::Object(_) => Self::Object,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableMetadata {
    pub origin_step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<Variant>,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Commit sequence number of the write.
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

/// A named value produced by a completed step ("global").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: serde_json::Value,
    pub metadata: VariableMetadata,
}

/// The per-variable view handed to agents and written to archives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalEntry {
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub updated_at: DateTime<Utc>,
}

impl From<&Variable> for GlobalEntry {
    fn from(v: &Variable) -> Self {
        Self {
            value: v.value.clone(),
            path: v.metadata.path.clone(),
            content_type: v.metadata.content_type,
            updated_at: v.metadata.updated_at,
        }
    }
}

/// Error detail retained on a failed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Attempt number (1-based) on which the failure happened.
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl StepFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempt,
            at: Utc::now(),
        }
    }
}

/// Overall state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Running,
    Completed,
    Failed,
    TimedOut,
    Deadlocked,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Deadlocked => "deadlocked",
        };
        f.write_str(s)
    }
}

/// Request sent to the reasoning backend for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub session_id: SessionId,
    pub step_id: String,
    pub role: AgentRole,
    #[serde(default)]
    pub description: String,
    pub original_query: String,
    #[serde(default)]
    pub perception: serde_json::Value,
    #[serde(default)]
    pub planning_strategy: PlanningStrategy,
    /// Values bound to the step's `input_bindings`.
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub globals_schema: BTreeMap<String, GlobalEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_graph: Option<serde_json::Value>,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub failed_steps: Vec<String>,
}

/// Raw structured reply from the reasoning backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReply {
    pub body: serde_json::Value,
    #[serde(default)]
    pub usage: Usage,
}

impl AgentReply {
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            body,
            usage: Usage::default(),
        }
    }
}

/// One code variant to execute in the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub session_id: SessionId,
    pub step_id: String,
    pub variant: Variant,
    pub code: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub globals: BTreeMap<String, serde_json::Value>,
    pub output_dir: PathBuf,
}

/// What a variant produced when it ran to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxOutcome {
    /// The value the code returned; accepted only when it is a JSON object.
    pub result: serde_json::Value,
    #[serde(default)]
    pub created_files: Vec<PathBuf>,
    /// Tools the code called, in call order.
    #[serde(default)]
    pub tool_calls: Vec<String>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

/// A persisted session as seen by an archive backend.
#[derive(Debug, Clone)]
pub struct ArchivedSession {
    pub session_id: String,
    pub status: SessionStatus,
    /// Serialized session snapshot (JSON).
    pub snapshot: String,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle events emitted by the flow controller.
///
/// Observers are fire-and-forget: nothing they do feeds back into scheduling.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    SessionStarted {
        session_id: SessionId,
    },
    StepStarted {
        session_id: SessionId,
        step_id: String,
        role: AgentRole,
        attempt: u32,
        status: NodeStatus,
    },
    StepCompleted {
        session_id: SessionId,
        step_id: String,
        status: NodeStatus,
        variant: Option<Variant>,
        elapsed_ms: u64,
    },
    StepFailed {
        session_id: SessionId,
        step_id: String,
        status: NodeStatus,
        kind: ErrorKind,
        message: String,
        will_retry: bool,
    },
    StepSkipped {
        session_id: SessionId,
        step_id: String,
        status: NodeStatus,
        cause: String,
    },
    SessionTerminated {
        session_id: SessionId,
        status: SessionStatus,
    },
}

impl FlowEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionStarted { session_id }
            | Self::StepStarted { session_id, .. }
            | Self::StepCompleted { session_id, .. }
            | Self::StepFailed { session_id, .. }
            | Self::StepSkipped { session_id, .. }
            | Self::SessionTerminated { session_id, .. } => session_id,
        }
    }

    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step_id, .. }
            | Self::StepCompleted { step_id, .. }
            | Self::StepFailed { step_id, .. }
            | Self::StepSkipped { step_id, .. } => Some(step_id),
            Self::SessionStarted { .. } | Self::SessionTerminated { .. } => None,
        }
    }
}
