use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize as _;
use serde_json::Value;

use super::types::request::ControlRequest;
use super::types::response::{LogEntry, RUN_LOG, RunLogEvent};
use crate::ws::{ConnectionManager, ConnectionStatus, Disposer};

/// Live log stream of one agent run.
///
/// While a run is selected and the manager is connected, the server is asked
/// to stream that run (`subscribe_run`) and matching `run_log` envelopes are
/// appended to [`logs`](Self::logs) in arrival order. Every transition back
/// into [`ConnectionStatus::Connected`] re-sends `subscribe_run`, so a
/// reconnect never leaves a silent subscription behind.
///
/// Selecting another run resets the accumulated logs; backfill of earlier
/// lines is left to the REST API.
pub struct RunLogSubscription {
    manager: ConnectionManager,
    shared: Arc<Shared>,
    status_observer: Option<Disposer>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct RunTarget {
    project_id: String,
    run_id: String,
}

struct Shared {
    binding: Mutex<Binding>,
    logs: Arc<Mutex<Vec<LogEntry>>>,
}

/// Target and live registration share one lock so a status change racing
/// `stop()` can never re-activate a stopped subscription.
#[derive(Default)]
struct Binding {
    target: Option<RunTarget>,
    active: Option<ActiveRun>,
}

struct ActiveRun {
    run_id: String,
    handler: Disposer,
}

impl RunLogSubscription {
    #[must_use]
    pub fn new(manager: &ConnectionManager) -> Self {
        Self {
            manager: manager.clone(),
            shared: Arc::new(Shared {
                binding: Mutex::new(Binding::default()),
                logs: Arc::new(Mutex::new(Vec::new())),
            }),
            status_observer: None,
        }
    }

    /// Follow `run_id` in `project_id`; `None` follows nothing.
    ///
    /// Restarting with the same parameters is a no-op. A different run id
    /// unsubscribes from the previous run and clears the accumulated logs.
    pub fn start(&mut self, project_id: &str, run_id: Option<&str>) {
        let next = run_id.map(|run_id| RunTarget {
            project_id: project_id.to_owned(),
            run_id: run_id.to_owned(),
        });
        let current = self.shared.lock_binding().target.clone();
        if self.status_observer.is_some() && current == next {
            return;
        }

        self.stop();

        let current_run = current.as_ref().map(|target| &target.run_id);
        if current_run != next.as_ref().map(|target| &target.run_id) {
            self.shared.lock_logs().clear();
        }
        self.shared.lock_binding().target = next;

        let manager = self.manager.downgrade();
        let shared = Arc::downgrade(&self.shared);
        self.status_observer = Some(self.manager.on_status_change(move |status| {
            if let (Some(shared), Some(manager)) = (shared.upgrade(), manager.upgrade()) {
                shared.reconcile(&manager, status);
            }
        }));
    }

    /// Unsubscribe from the current run and stop reacting to reconnects.
    pub fn stop(&mut self) {
        if let Some(observer) = self.status_observer.take() {
            observer.dispose();
        }

        let active = {
            let mut binding = self.shared.lock_binding();
            binding.target = None;
            binding.active.take()
        };
        if let Some(active) = active {
            active.deactivate(&self.manager);
        }
    }

    /// Log entries received for the current run, in arrival order.
    #[must_use]
    pub fn logs(&self) -> Vec<LogEntry> {
        self.shared.lock_logs().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock_logs().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The run being followed, if any.
    #[must_use]
    pub fn run_id(&self) -> Option<String> {
        self.shared
            .lock_binding()
            .target
            .as_ref()
            .map(|target| target.run_id.clone())
    }

    /// Whether the server is currently asked to stream this run.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.shared.lock_binding().active.is_some()
    }
}

impl Drop for RunLogSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lock_binding(&self) -> MutexGuard<'_, Binding> {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_logs(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reconcile(&self, manager: &ConnectionManager, status: ConnectionStatus) {
        let mut binding = self.lock_binding();
        let wanted = if status.is_connected() {
            binding.target.clone()
        } else {
            None
        };

        match (binding.active.is_some(), wanted) {
            (false, Some(target)) => {
                binding.active = Some(self.activate(manager, target));
            }
            (true, None) => {
                if let Some(active) = binding.active.take() {
                    active.deactivate(manager);
                }
            }
            _ => {}
        }
    }

    fn activate(&self, manager: &ConnectionManager, target: RunTarget) -> ActiveRun {
        let logs = Arc::clone(&self.logs);
        let run_id = target.run_id.clone();
        let handler = manager.on_message(RUN_LOG, move |body: &Value| {
            if body.get("run_id").and_then(Value::as_str) != Some(run_id.as_str()) {
                return;
            }
            match RunLogEvent::deserialize(body) {
                Ok(event) => logs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(event.log),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(run_id = %run_id, error = %e, "Dropping malformed run log");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(run_id = %target.run_id, "Subscribing to run logs");
        let request = ControlRequest::subscribe_run(&target.project_id, &target.run_id);
        if let Err(e) = request.send(manager) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Failed to subscribe to run logs");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }

        ActiveRun {
            run_id: target.run_id,
            handler,
        }
    }
}

impl ActiveRun {
    fn deactivate(self, manager: &ConnectionManager) {
        self.handler.dispose();

        // A closed channel already dropped the server-side subscription.
        if !manager.is_open() {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(run_id = %self.run_id, "Unsubscribing from run logs");
        if let Err(e) = ControlRequest::unsubscribe_run(&self.run_id).send(manager) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Failed to unsubscribe from run logs");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }
}
