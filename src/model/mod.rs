//! Widget model: the frontend mirror of a kernel widget
//!
//! A [`WidgetModel`] holds the synchronized attribute state of one widget and
//! keeps it in step with the kernel over a [`Comm`]:
//!
//! - local writes (`set`) are collected into a diff and sent on `save_changes`
//! - kernel updates are deserialized and applied through the state queue,
//!   under a state lock so they are not echoed back
//! - at most `max_pending_msgs` syncs are in flight; further syncs are
//!   coalesced into a buffer that is flushed when the kernel reports idle
//!
//! The comm lifecycle is `Unattached -> Live -> Closed`, and `Closed` is final.

mod queue;


pub use queue::{StateChangeResult, StateOp, StateQueue};

use crate::comm::Comm;
use crate::config::SyncConfig;
use crate::error::WidgetError;
use crate::events::{EventEmitter, Listener, ListenerId, ModelEvent};
use crate::manager::{WeakManager, WidgetManager};
use crate::message::{
    Callbacks, CommData, CommMessage, ExecutionState, IopubCallbacks, KernelMessage, State,
};
use crate::serializers::{ModelType, MODEL_REF_PREFIX};
use bytes::Bytes;
use futures::FutureExt;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// A rendered view of a model; the model only needs to tear it down
pub trait View: Send + Sync {
    fn remove(&self);
}

/// Where the model is in its comm lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommLifecycle {
    /// Constructed without a comm
    Unattached,
    /// Attached to an open comm
    Live,
    /// Closed locally or by the kernel
    Closed,
}

/// Which attributes a sync carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMethod {
    /// Full state, sent once at construction
    Create,
    /// Full state
    Update,
    /// Only attributes changed locally since the last sync
    Patch,
}

/// Options for a local `set`
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeOptions {
    /// Skip change notifications
    pub silent: bool,
}

/// Everything needed to construct a model
pub struct ModelOptions {
    pub manager: Option<WidgetManager>,
    pub model_id: String,
    pub comm: Option<Arc<dyn Comm>>,
    pub model_type: Arc<ModelType>,
    /// Initial attributes, layered over the type defaults
    pub state: State,
    pub config: SyncConfig,
}

struct Core {
    id: Option<String>,
    attributes: State,
    pending_msgs: usize,
    msg_buffer: Option<State>,
    msg_buffer_callbacks: Option<Callbacks>,
    state_lock: Option<State>,
    /// set_state batches applied but not yet committed
    lock_depth: usize,
    buffered_state_diff: State,
    views: HashMap<String, Arc<dyn View>>,
    comm: Option<Arc<dyn Comm>>,
    comm_live: bool,
    lifecycle: CommLifecycle,
}

struct Inner {
    model_type: Arc<ModelType>,
    manager: WeakManager,
    config: SyncConfig,
    core: Mutex<Core>,
    events: EventEmitter,
    queue: StateQueue,
}

/// Shared handle to a widget model
#[derive(Clone)]
pub struct WidgetModel {
    inner: Arc<Inner>,
}

impl WidgetModel {
    /// Create a model, attach its comm and send the initial state.
    ///
    /// The model's state queue runs on a spawned task, so this fails with
    /// [`WidgetError::NoRuntime`] outside a tokio runtime.
    pub fn new(options: ModelOptions) -> Result<Self, WidgetError> {
        let ModelOptions {
            manager,
            model_id,
            comm,
            model_type,
            state,
            config,
        } = options;

        let mut attributes = model_type.defaults.clone();
        attributes.extend(state);

        let lifecycle = if comm.is_some() {
            CommLifecycle::Live
        } else {
            CommLifecycle::Unattached
        };

        let queue = StateQueue::spawn(model_id.clone())?;
        let model = Self {
            inner: Arc::new(Inner {
                queue,
                model_type,
                manager: manager.as_ref().map(WidgetManager::downgrade).unwrap_or_default(),
                config,
                events: EventEmitter::new(),
                core: Mutex::new(Core {
                    id: Some(model_id),
                    attributes,
                    pending_msgs: 0,
                    msg_buffer: None,
                    msg_buffer_callbacks: None,
                    state_lock: None,
                    lock_depth: 0,
                    buffered_state_diff: State::new(),
                    views: HashMap::new(),
                    comm: comm.clone(),
                    comm_live: comm.is_some(),
                    lifecycle,
                }),
            }),
        };

        if let Some(comm) = comm {
            model.attach_comm(comm.as_ref());
            model.sync(SyncMethod::Create, None)?;
        }

        tracing::debug!(
            model = %model.label(),
            model_name = %model.inner.model_type.name,
            live = model.comm_live(),
            "Model constructed"
        );
        Ok(model)
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn label(&self) -> String {
        self.core().id.clone().unwrap_or_else(|| "<closed>".to_string())
    }

    /// Route comm traffic back into this model without keeping it alive
    fn attach_comm(&self, comm: &dyn Comm) {
        let weak = Arc::downgrade(&self.inner);
        comm.on_msg(Arc::new(move |msg: &CommMessage| {
            if let Some(model) = WidgetModel::upgrade(&weak) {
                if let Err(err) = model.handle_comm_msg(msg) {
                    tracing::error!(model = %model.label(), error = %err, "Failed to handle comm message");
                }
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        comm.on_close(Arc::new(move |msg: &CommMessage| {
            if let Some(model) = WidgetModel::upgrade(&weak) {
                model.handle_comm_closed(msg);
            }
        }));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────

    /// Model id; `None` once closed
    pub fn id(&self) -> Option<String> {
        self.core().id.clone()
    }

    pub fn pending_msgs(&self) -> usize {
        self.core().pending_msgs
    }

    pub fn msg_buffer(&self) -> Option<State> {
        self.core().msg_buffer.clone()
    }

    pub fn state_lock(&self) -> Option<State> {
        self.core().state_lock.clone()
    }

    pub fn comm(&self) -> Option<Arc<dyn Comm>> {
        self.core().comm.clone()
    }

    pub fn comm_live(&self) -> bool {
        self.core().comm_live
    }

    pub fn lifecycle(&self) -> CommLifecycle {
        self.core().lifecycle
    }

    pub fn model_type(&self) -> &Arc<ModelType> {
        &self.inner.model_type
    }

    pub fn widget_manager(&self) -> Option<WidgetManager> {
        self.inner.manager.upgrade()
    }

    pub fn ptr_eq(&self, other: &WidgetModel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Attribute state
    // ─────────────────────────────────────────────────────────────────────

    pub fn get(&self, attr: &str) -> Option<Value> {
        self.core().attributes.get(attr).cloned()
    }

    /// Local write; recorded for the next `save_changes`
    pub fn set(&self, attr: impl Into<String>, value: Value) {
        self.set_with(attr, value, ChangeOptions::default());
    }

    pub fn set_with(&self, attr: impl Into<String>, value: Value, options: ChangeOptions) {
        let attr = attr.into();
        let changed = {
            let mut core = self.core();
            if core.attributes.get(&attr) == Some(&value) {
                false
            } else {
                core.attributes.insert(attr.clone(), value.clone());
                core.buffered_state_diff.insert(attr.clone(), value.clone());
                true
            }
        };

        if changed && !options.silent {
            self.inner.events.emit(&ModelEvent::Change {
                attr: attr.clone(),
                value,
            });
            self.inner.events.emit(&ModelEvent::Changed { attrs: vec![attr] });
        }
    }

    /// Apply several attributes at once.
    ///
    /// Values are visible to `get` immediately; change notifications are
    /// delivered when the commit reaches the front of the state queue.
    pub fn set_state(&self, state: State) {
        let changes = self.apply_state(state);
        let model = self.clone();
        self.enqueue_state_op(
            async move {
                model.commit_state(changes);
                Ok(())
            }
            .boxed(),
        );
    }

    fn apply_state(&self, state: State) -> Vec<(String, Value)> {
        let mut core = self.core();
        core.lock_depth += 1;

        let mut changes = Vec::new();
        for (attr, value) in state {
            core.state_lock
                .get_or_insert_with(State::new)
                .insert(attr.clone(), value.clone());
            // incoming state supersedes unsaved local edits
            core.buffered_state_diff.remove(&attr);
            if core.attributes.get(&attr) != Some(&value) {
                core.attributes.insert(attr.clone(), value.clone());
                changes.push((attr, value));
            }
        }
        changes
    }

    fn commit_state(&self, changes: Vec<(String, Value)>) {
        let attrs: Vec<String> = changes.iter().map(|(attr, _)| attr.clone()).collect();
        for (attr, value) in changes {
            self.inner.events.emit(&ModelEvent::Change { attr, value });
        }
        if !attrs.is_empty() {
            self.inner.events.emit(&ModelEvent::Changed { attrs });
        }

        let mut core = self.core();
        core.lock_depth = core.lock_depth.saturating_sub(1);
        if core.lock_depth == 0 {
            core.state_lock = None;
        }
    }

    /// Snapshot of every attribute, optionally without values equal to the defaults
    pub fn get_state(&self, drop_defaults: bool) -> State {
        let core = self.core();
        snapshot(&core.attributes, &self.inner.model_type.defaults, drop_defaults)
    }

    /// Apply the type's serializers to `state`
    pub fn serialize(&self, state: &State) -> State {
        self.inner.model_type.serializers.serialize(state)
    }

    /// Resolves when every state operation queued so far has finished
    pub fn state_change(&self) -> impl Future<Output = StateChangeResult> + Send + 'static {
        self.inner.queue.state_change()
    }

    /// Queue an operation behind pending state changes
    pub(crate) fn enqueue_state_op(&self, op: StateOp) -> u64 {
        self.inner.queue.enqueue(op)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outbound messages
    // ─────────────────────────────────────────────────────────────────────

    /// Send a custom message to the kernel-side object
    pub fn send(
        &self,
        content: Value,
        callbacks: Option<Callbacks>,
        buffers: Vec<Bytes>,
    ) -> Result<String, WidgetError> {
        let comm = self.core().comm.clone();
        let comm = comm.ok_or_else(|| WidgetError::NoComm {
            model: self.label(),
        })?;
        comm.send(CommData::custom(content).to_value(), callbacks, buffers)
    }

    /// Collect the attributes for `method`, drop echoes of state being
    /// applied, and hand the rest to `send_sync_message`
    pub fn sync(&self, method: SyncMethod, callbacks: Option<Callbacks>) -> Result<(), WidgetError> {
        let attrs = {
            let mut core = self.core();
            if core.comm.is_none() {
                return Err(WidgetError::NoComm {
                    model: core.id.clone().unwrap_or_default(),
                });
            }

            let attrs = match method {
                SyncMethod::Patch => std::mem::take(&mut core.buffered_state_diff),
                SyncMethod::Create => {
                    core.buffered_state_diff.clear();
                    core.attributes.clone()
                }
                SyncMethod::Update => {
                    core.buffered_state_diff.clear();
                    snapshot(
                        &core.attributes,
                        &self.inner.model_type.defaults,
                        self.inner.config.drop_defaults,
                    )
                }
            };

            match &core.state_lock {
                Some(lock) => attrs
                    .into_iter()
                    .filter(|(attr, value)| lock.get(attr) != Some(value))
                    .collect(),
                None => attrs,
            }
        };

        // the create message goes out even when there is no state to carry
        if attrs.is_empty() && method != SyncMethod::Create {
            return Ok(());
        }
        self.send_sync_message(attrs, callbacks)
    }

    /// Send an `update` carrying `attrs`, or coalesce it into the buffer
    /// while the kernel still owes a reply for earlier syncs
    pub fn send_sync_message(
        &self,
        attrs: State,
        callbacks: Option<Callbacks>,
    ) -> Result<(), WidgetError> {
        let callbacks = callbacks.unwrap_or_else(|| self.callbacks());

        let comm = {
            let mut core = self.core();
            let Some(comm) = core.comm.clone() else {
                return Err(WidgetError::NoComm {
                    model: core.id.clone().unwrap_or_default(),
                });
            };

            if core.pending_msgs >= self.pending_window(&core) {
                core.msg_buffer.get_or_insert_with(State::new).extend(attrs);
                core.msg_buffer_callbacks = Some(callbacks);
                tracing::debug!(
                    model = ?core.id,
                    pending = core.pending_msgs,
                    "Kernel busy, buffering sync"
                );
                return Ok(());
            }

            core.pending_msgs += 1;
            comm
        };

        let data = CommData::update(self.serialize(&attrs)).to_value();
        match comm.send(data, Some(callbacks), Vec::new()) {
            Ok(msg_id) => {
                tracing::debug!(
                    model = %self.label(),
                    msg_id = %msg_id,
                    attrs = attrs.len(),
                    "Sent sync message"
                );
                Ok(())
            }
            Err(err) => {
                let mut core = self.core();
                core.pending_msgs = core.pending_msgs.saturating_sub(1);
                Err(err)
            }
        }
    }

    /// Syncs allowed in flight: the configured window, widened by the
    /// model's `msg_throttle` attribute
    fn pending_window(&self, core: &Core) -> usize {
        let throttle = core
            .attributes
            .get("msg_throttle")
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0);
        self.inner.config.max_pending_msgs.max(throttle)
    }

    /// Send attributes changed locally since the last sync
    pub fn save_changes(&self, callbacks: Option<Callbacks>) -> Result<(), WidgetError> {
        if !self.comm_live() {
            return Ok(());
        }
        self.sync(SyncMethod::Patch, callbacks)
    }

    /// Reply handlers to attach to outbound messages
    pub fn callbacks(&self) -> Callbacks {
        let weak = Arc::downgrade(&self.inner);
        Callbacks {
            iopub: IopubCallbacks {
                status: Some(Arc::new(move |msg: &KernelMessage| {
                    if let Some(model) = WidgetModel::upgrade(&weak) {
                        model.handle_status(msg);
                    }
                })),
            },
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound messages
    // ─────────────────────────────────────────────────────────────────────

    /// Kernel status for one of our messages. Idle means the kernel has
    /// processed it, which frees a slot and flushes any buffered sync.
    pub fn handle_status(&self, msg: &KernelMessage) {
        if msg.execution_state() != Some(ExecutionState::Idle) {
            return;
        }

        let flush = {
            let mut core = self.core();
            if core.comm.is_none() {
                return;
            }
            core.pending_msgs = core.pending_msgs.saturating_sub(1);
            match core.msg_buffer.take() {
                Some(buffer) => Some((buffer, core.msg_buffer_callbacks.take())),
                None => None,
            }
        };

        if let Some((buffer, callbacks)) = flush {
            tracing::debug!(model = %self.label(), attrs = buffer.len(), "Flushing buffered sync");
            if let Err(err) = self.send_sync_message(buffer, callbacks) {
                tracing::warn!(model = %self.label(), error = %err, "Failed to flush buffered sync");
            }
        }
    }

    /// Dispatch a message received on the comm
    pub fn handle_comm_msg(&self, msg: &CommMessage) -> Result<(), WidgetError> {
        match msg.data()? {
            CommData::Update { state, .. } => {
                let model = self.clone();
                let seq = self.enqueue_state_op(
                    async move {
                        // deserializers only run once earlier state work is done
                        let model_type = model.inner.model_type.clone();
                        let state = model_type.deserialize_state(state).await?;
                        let changes = model.apply_state(state);
                        model.commit_state(changes);
                        Ok(())
                    }
                    .boxed(),
                );
                tracing::trace!(
                    model = %self.label(),
                    seq,
                    queued = self.inner.queue.outstanding(),
                    "Queued kernel update"
                );
                Ok(())
            }
            CommData::Custom { content } => {
                self.inner.events.emit(&ModelEvent::Custom {
                    content,
                    buffers: msg.buffers.clone(),
                });
                Ok(())
            }
            CommData::Display => {
                let manager = self
                    .widget_manager()
                    .ok_or_else(|| WidgetError::ManagerGone(self.label()))?;
                manager.display_model(self, Some(msg))
            }
        }
    }

    /// The kernel closed the comm
    pub fn handle_comm_closed(&self, _msg: &CommMessage) {
        tracing::debug!(model = %self.label(), "Comm closed by kernel");
        self.inner.events.emit(&ModelEvent::CommClose);
        self.close_inner(true);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Tear the model down. Later calls do nothing.
    pub fn close(&self) {
        self.close_inner(false);
    }

    fn close_inner(&self, comm_closed: bool) {
        let (comm, id, views) = {
            let mut core = self.core();
            if core.lifecycle == CommLifecycle::Closed {
                return;
            }
            core.lifecycle = CommLifecycle::Closed;
            core.comm_live = false;
            core.msg_buffer = None;
            core.msg_buffer_callbacks = None;
            (
                core.comm.take(),
                core.id.take(),
                std::mem::take(&mut core.views),
            )
        };

        if let Some(comm) = comm.filter(|_| !comm_closed) {
            if let Err(err) = comm.close() {
                tracing::warn!(model = ?id, error = %err, "Failed to close comm");
            }
        }

        self.inner.events.emit(&ModelEvent::Destroy);

        for view in views.into_values() {
            view.remove();
        }

        if let (Some(id), Some(manager)) = (id.as_deref(), self.widget_manager()) {
            manager.forget(id);
        }
        tracing::debug!(model = ?id, remote = comm_closed, "Model closed");
    }

    pub fn attach_view(&self, view_id: impl Into<String>, view: Arc<dyn View>) {
        let rejected = {
            let mut core = self.core();
            if core.lifecycle == CommLifecycle::Closed {
                Some(view)
            } else {
                core.views.insert(view_id.into(), view);
                None
            }
        };
        // closed models keep no views
        if let Some(view) = rejected {
            view.remove();
        }
    }

    pub fn view_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.core().views.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ─────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────

    /// Subscribe to space-separated event names
    pub fn on(&self, events: &str, listener: Listener) -> ListenerId {
        self.inner.events.on(events, listener)
    }

    pub fn off(&self, id: ListenerId) {
        self.inner.events.off(id);
    }

    /// Call `listener` once per change batch touching any of `attrs`
    pub fn on_some_change<S: AsRef<str>>(&self, attrs: &[S], listener: Listener) -> ListenerId {
        let watched: Vec<String> = attrs.iter().map(|a| a.as_ref().to_string()).collect();
        self.on(
            "change",
            Arc::new(move |event: &ModelEvent| {
                if let ModelEvent::Changed { attrs } = event {
                    if attrs.iter().any(|attr| watched.contains(attr)) {
                        listener(event);
                    }
                }
            }),
        )
    }

    /// Reference string used to embed this model in other state
    pub fn to_json(&self) -> String {
        format!("{}{}", MODEL_REF_PREFIX, self.id().unwrap_or_default())
    }
}

fn snapshot(attributes: &State, defaults: &State, drop_defaults: bool) -> State {
    if !drop_defaults {
        return attributes.clone();
    }
    attributes
        .iter()
        .filter(|(attr, value)| defaults.get(*attr) != Some(*value))
        .map(|(attr, value)| (attr.clone(), value.clone()))
        .collect()
}

impl Serialize for WidgetModel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_json())
    }
}

impl fmt::Debug for WidgetModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        f.debug_struct("WidgetModel")
            .field("id", &core.id)
            .field("model_name", &self.inner.model_type.name)
            .field("lifecycle", &core.lifecycle)
            .field("pending_msgs", &core.pending_msgs)
            .finish()
    }
}
