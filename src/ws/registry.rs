use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use dashmap::DashMap;
use serde_json::Value;

/// Callback invoked with the body of a matching envelope.
pub type MessageHandler = Arc<dyn Fn(&Value) + Send + Sync + 'static>;

type HandlerId = u64;

/// Releases one registration when disposed or dropped.
///
/// Disposing is idempotent: a second call, or a call after the owning
/// registry is gone, does nothing.
#[must_use = "dropping a Disposer immediately removes its registration"]
pub struct Disposer {
    release: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

impl Disposer {
    pub(crate) fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    /// A disposer that owns no registration.
    pub fn noop() -> Self {
        Self {
            release: Mutex::new(None),
        }
    }

    /// Remove the registration. Safe to call any number of times.
    pub fn dispose(&self) {
        // A poisoned lock still guards a valid Option; take whatever is left.
        let release = self
            .release
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(release) = release {
            release();
        }
    }

    /// Whether the registration has already been released.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.release
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Maps a message type to the handlers registered for it, in insertion order.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: DashMap<String, Vec<(HandlerId, MessageHandler)>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub(crate) fn register<F>(self: &Arc<Self>, msg_type: &str, handler: F) -> Disposer
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: MessageHandler = Arc::new(handler);
        self.handlers
            .entry(msg_type.to_owned())
            .or_default()
            .push((id, handler));

        let registry: Weak<Self> = Arc::downgrade(self);
        let msg_type = msg_type.to_owned();
        Disposer::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&msg_type, id);
            }
        })
    }

    fn remove(&self, msg_type: &str, id: HandlerId) {
        let now_empty = self.handlers.get_mut(msg_type).is_some_and(|mut entry| {
            entry.retain(|(existing, _)| *existing != id);
            entry.is_empty()
        });
        if now_empty {
            self.handlers.remove_if(msg_type, |_, handlers| handlers.is_empty());
        }
    }

    /// Handlers for `msg_type`, cloned so none of the map is locked while they run.
    pub(crate) fn snapshot(&self, msg_type: &str) -> Vec<MessageHandler> {
        self.handlers
            .get(msg_type)
            .map(|entry| entry.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn len(&self, msg_type: &str) -> usize {
        self.handlers.get(msg_type).map_or(0, |entry| entry.len())
    }
}

/// Run each handler, isolating panics so one subscriber cannot starve the rest.
pub(crate) fn invoke_all(msg_type: &str, handlers: &[MessageHandler], value: &Value) {
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(value))).is_err() {
            #[cfg(feature = "tracing")]
            tracing::error!(msg_type, "Message handler panicked");
            #[cfg(not(feature = "tracing"))]
            let _ = msg_type;
        }
    }
}
