#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

use serde_json::Value;

use crate::ws::{ConnectionManager, Disposer};

/// Pass-through binding of one message type to one handler.
///
/// Registers on [`start`](Self::start) and deregisters on [`stop`](Self::stop),
/// on restart, or on drop. No correlation filtering is applied.
pub struct MessageSubscription {
    manager: ConnectionManager,
    active: Option<(String, Disposer)>,
}

impl MessageSubscription {
    #[must_use]
    pub fn new(manager: &ConnectionManager) -> Self {
        Self {
            manager: manager.clone(),
            active: None,
        }
    }

    /// Route envelopes of `msg_type` to `handler`, replacing any previous binding.
    pub fn start<F>(&mut self, msg_type: &str, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.stop();
        let disposer = self.manager.on_message(msg_type, handler);
        self.active = Some((msg_type.to_owned(), disposer));
    }

    pub fn stop(&mut self) {
        if let Some((_, disposer)) = self.active.take() {
            disposer.dispose();
        }
    }

    /// The bound message type, if started.
    #[must_use]
    pub fn msg_type(&self) -> Option<&str> {
        self.active.as_ref().map(|(msg_type, _)| msg_type.as_str())
    }
}

impl Drop for MessageSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}
