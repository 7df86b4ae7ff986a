// Model events and the observer lists that deliver them
//
// Listeners subscribe to event names ("change:value", "msg:custom", ...) and
// are invoked synchronously, in registration order, whenever the model emits
// a matching event. Several names can be given at once separated by spaces,
// the same way the kernel-side protocol names them.

use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Events emitted by a widget model
#[derive(Debug, Clone)]
pub enum ModelEvent {
    /// One attribute changed ("change:<attr>")
    Change { attr: String, value: Value },

    /// A batch of attribute changes finished ("change")
    Changed { attrs: Vec<String> },

    /// Custom message from the kernel ("msg:custom")
    Custom { content: Value, buffers: Vec<Bytes> },

    /// The kernel closed the comm ("comm:close")
    CommClose,

    /// The model was closed ("destroy")
    Destroy,
}

impl ModelEvent {
    /// Event name listeners subscribe to
    pub fn name(&self) -> Cow<'static, str> {
        match self {
            Self::Change { attr, .. } => Cow::Owned(format!("change:{}", attr)),
            Self::Changed { .. } => Cow::Borrowed("change"),
            Self::Custom { .. } => Cow::Borrowed("msg:custom"),
            Self::CommClose => Cow::Borrowed("comm:close"),
            Self::Destroy => Cow::Borrowed("destroy"),
        }
    }
}

/// Callback invoked with an emitted event
pub type Listener = Arc<dyn Fn(&ModelEvent) + Send + Sync>;

/// Handle returned by [`EventEmitter::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    event: String,
    callback: Listener,
}

/// Mapping from event name to ordered listener list
#[derive(Default)]
pub struct EventEmitter {
    listeners: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one or more space-separated event names
    pub fn on(&self, events: &str, callback: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for event in events.split_whitespace() {
            listeners.push(Registration {
                id,
                event: event.to_string(),
                callback: callback.clone(),
            });
        }
        id
    }

    /// Remove every registration made under `id`
    pub fn off(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|r| r.id != id);
    }

    /// Deliver an event to its listeners.
    ///
    /// The listener list is snapshotted first so callbacks may subscribe,
    /// unsubscribe or emit again without deadlocking.
    pub fn emit(&self, event: &ModelEvent) -> usize {
        let name = event.name();
        let matching: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.event == name)
            .map(|r| r.callback.clone())
            .collect();

        for callback in &matching {
            callback(event);
        }
        matching.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.event == event)
            .count()
    }
}

/// Helper to generate unique ids for comms and messages
pub fn generate_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let count = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}-{}", Utc::now().timestamp_millis(), count)
}
