use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Envelope type carrying one [`RunLogEvent`].
pub const RUN_LOG: &str = "run_log";
/// Envelope type carrying one [`TaskUpdate`].
pub const TASK_UPDATE: &str = "task_update";

/// Body of a `run_log` envelope.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RunLogEvent {
    pub run_id: String,
    pub log: LogEntry,
}

/// One log line of an agent run.
#[non_exhaustive]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct LogEntry {
    pub id: Option<String>,
    /// Producer-side sequence number; informational only, arrival order wins
    pub seq: Option<i64>,
    pub stream: Option<LogStream>,
    pub message: Option<String>,
    pub created_at: Option<String>,
    /// Fields not modelled above
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
    #[serde(other)]
    Unknown,
}

/// Body of a `task_update` envelope.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TaskUpdate {
    pub project_id: String,
    /// Everything else the server sent
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TaskUpdate {
    /// The nested task record, under `task` or the server's `payload` key.
    #[must_use]
    pub fn task(&self) -> Option<&Value> {
        self.fields
            .get("task")
            .or_else(|| self.fields.get("payload"))
    }

    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        self.task()
            .and_then(|task| task.get("task_id").or_else(|| task.get("id")))
            .and_then(Value::as_str)
    }
}
