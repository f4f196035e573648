use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize as _;
use serde_json::Value;

use super::types::request::ControlRequest;
use super::types::response::{TASK_UPDATE, TaskUpdate};
use crate::Result;
use crate::error::Error;
use crate::ws::{ConnectionManager, ConnectionStatus, Disposer};

/// Live task-board updates of one project.
///
/// While started and connected the server is asked to stream the project
/// (`subscribe_project`); the request is re-sent on every reconnect. Handlers
/// added through [`on_task_update`](Self::on_task_update) only see updates
/// whose `project_id` matches.
pub struct TaskUpdateSubscription {
    manager: ConnectionManager,
    binding: Arc<Mutex<Binding>>,
    status_observer: Option<Disposer>,
}

#[derive(Debug, Default)]
struct Binding {
    project_id: Option<String>,
    /// Project the server is currently streaming to us
    subscribed: Option<String>,
}

impl TaskUpdateSubscription {
    #[must_use]
    pub fn new(manager: &ConnectionManager) -> Self {
        Self {
            manager: manager.clone(),
            binding: Arc::new(Mutex::new(Binding::default())),
            status_observer: None,
        }
    }

    /// Follow `project_id`. Restarting with the same project is a no-op.
    pub fn start(&mut self, project_id: &str) {
        if self.status_observer.is_some()
            && lock(&self.binding).project_id.as_deref() == Some(project_id)
        {
            return;
        }

        self.stop();
        lock(&self.binding).project_id = Some(project_id.to_owned());

        let manager = self.manager.downgrade();
        let binding = Arc::downgrade(&self.binding);
        self.status_observer = Some(self.manager.on_status_change(move |status| {
            if let (Some(binding), Some(manager)) = (binding.upgrade(), manager.upgrade()) {
                reconcile(&binding, &manager, status);
            }
        }));
    }

    /// Unsubscribe from the project and stop reacting to reconnects.
    ///
    /// Handlers returned by [`on_task_update`](Self::on_task_update) stay
    /// registered until their disposers are released.
    pub fn stop(&mut self) {
        if let Some(observer) = self.status_observer.take() {
            observer.dispose();
        }

        let subscribed = {
            let mut binding = lock(&self.binding);
            binding.project_id = None;
            binding.subscribed.take()
        };
        if let Some(project_id) = subscribed {
            unsubscribe(&self.manager, &project_id);
        }
    }

    #[must_use]
    pub fn project_id(&self) -> Option<String> {
        lock(&self.binding).project_id.clone()
    }

    /// Whether the server is currently asked to stream this project.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        lock(&self.binding).subscribed.is_some()
    }

    /// Invoke `handler` for every `task_update` of the current project.
    ///
    /// The project is captured now; restart the subscription and register
    /// again to follow another project. Fails when no project is selected.
    pub fn on_task_update<F>(&self, handler: F) -> Result<Disposer>
    where
        F: Fn(&TaskUpdate) + Send + Sync + 'static,
    {
        let project_id = self
            .project_id()
            .ok_or_else(|| Error::validation("no project selected for task updates"))?;

        Ok(self.manager.on_message(TASK_UPDATE, move |body: &Value| {
            if body.get("project_id").and_then(Value::as_str) != Some(project_id.as_str()) {
                return;
            }
            match TaskUpdate::deserialize(body) {
                Ok(update) => handler(&update),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(project_id = %project_id, error = %e, "Dropping malformed task update");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
        }))
    }
}

impl Drop for TaskUpdateSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(binding: &Mutex<Binding>) -> MutexGuard<'_, Binding> {
    binding.lock().unwrap_or_else(PoisonError::into_inner)
}

fn reconcile(binding: &Mutex<Binding>, manager: &ConnectionManager, status: ConnectionStatus) {
    let mut binding = lock(binding);
    let wanted = if status.is_connected() {
        binding.project_id.clone()
    } else {
        None
    };

    match (binding.subscribed.is_some(), wanted) {
        (false, Some(project_id)) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(project_id = %project_id, "Subscribing to task updates");
            if let Err(e) = ControlRequest::subscribe_project(&project_id).send(manager) {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Failed to subscribe to task updates");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
            binding.subscribed = Some(project_id);
        }
        (true, None) => {
            if let Some(project_id) = binding.subscribed.take() {
                unsubscribe(manager, &project_id);
            }
        }
        _ => {}
    }
}

fn unsubscribe(manager: &ConnectionManager, project_id: &str) {
    // A closed channel already dropped the server-side subscription.
    if !manager.is_open() {
        return;
    }
    #[cfg(feature = "tracing")]
    tracing::debug!(project_id, "Unsubscribing from task updates");
    if let Err(e) = ControlRequest::unsubscribe_project(project_id).send(manager) {
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %e, "Failed to unsubscribe from task updates");
        #[cfg(not(feature = "tracing"))]
        let _ = &e;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;
    use crate::ws::config::Config;

    fn manager() -> ConnectionManager {
        ConnectionManager::new("ws://localhost:8000/ws", None, Config::default()).unwrap()
    }

    #[test]
    fn handler_without_project_is_rejected() {
        let manager = manager();
        let subscription = TaskUpdateSubscription::new(&manager);

        let err = subscription.on_task_update(|_| {}).unwrap_err();

        assert_eq!(err.kind(), Kind::Validation);
        assert_eq!(manager.handler_count(TASK_UPDATE), 0);
    }

    #[test]
    fn reconcile_follows_connection_status() {
        let manager = manager();
        let mut subscription = TaskUpdateSubscription::new(&manager);
        subscription.start("p1");
        assert!(!subscription.is_subscribed());

        reconcile(&subscription.binding, &manager, ConnectionStatus::Connected);
        assert!(subscription.is_subscribed());

        reconcile(&subscription.binding, &manager, ConnectionStatus::Error);
        assert!(!subscription.is_subscribed());
    }

    #[test]
    fn restart_with_new_project_drops_old_subscription() {
        let manager = manager();
        let mut subscription = TaskUpdateSubscription::new(&manager);
        subscription.start("p1");
        reconcile(&subscription.binding, &manager, ConnectionStatus::Connected);

        subscription.start("p2");

        assert_eq!(subscription.project_id().as_deref(), Some("p2"));
        assert!(!subscription.is_subscribed());
    }
}
