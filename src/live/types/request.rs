#![expect(
    clippy::module_name_repetitions,
    reason = "Request types name the direction they travel in"
)]

use serde::Serialize;

use crate::Result;
use crate::ws::ConnectionManager;

/// Client to server control messages.
///
/// Serializes to the payload only; the message type travels in the envelope
/// `type` field (see [`ControlRequest::msg_type`]).
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ControlRequest {
    /// Start streaming a run's log lines
    SubscribeRun { project_id: String, run_id: String },
    /// Stop streaming a run's log lines
    UnsubscribeRun { run_id: String },
    /// Start streaming a project's task updates
    SubscribeProject { project_id: String },
    /// Stop streaming a project's task updates
    UnsubscribeProject { project_id: String },
}

impl ControlRequest {
    #[must_use]
    pub fn subscribe_run(project_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self::SubscribeRun {
            project_id: project_id.into(),
            run_id: run_id.into(),
        }
    }

    #[must_use]
    pub fn unsubscribe_run(run_id: impl Into<String>) -> Self {
        Self::UnsubscribeRun {
            run_id: run_id.into(),
        }
    }

    #[must_use]
    pub fn subscribe_project(project_id: impl Into<String>) -> Self {
        Self::SubscribeProject {
            project_id: project_id.into(),
        }
    }

    #[must_use]
    pub fn unsubscribe_project(project_id: impl Into<String>) -> Self {
        Self::UnsubscribeProject {
            project_id: project_id.into(),
        }
    }

    /// Envelope `type` tag for this request.
    #[must_use]
    pub const fn msg_type(&self) -> &'static str {
        match self {
            Self::SubscribeRun { .. } => "subscribe_run",
            Self::UnsubscribeRun { .. } => "unsubscribe_run",
            Self::SubscribeProject { .. } => "subscribe_project",
            Self::UnsubscribeProject { .. } => "unsubscribe_project",
        }
    }

    /// Send through `manager`. Dropped with a warning if the channel is closed.
    pub fn send(&self, manager: &ConnectionManager) -> Result<()> {
        #[cfg(feature = "tracing")]
        tracing::debug!(msg_type = self.msg_type(), request = ?self, "Sending control request");
        manager.send(self.msg_type(), self)
    }
}
