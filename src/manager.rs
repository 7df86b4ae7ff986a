//! Widget manager: creates, tracks and displays models
//!
//! The manager owns the registry of model types and the table of live models.
//! Models hold only a weak reference back to it, so dropping the manager
//! never leaks models through cycles.

use crate::comm::{Comm, CommOpener};
use crate::config::SyncConfig;
use crate::error::WidgetError;
use crate::events::generate_id;
use crate::message::{CommMessage, State};
use crate::model::{ModelOptions, WidgetModel};
use crate::serializers::ModelType;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// What to build: a model class plus its id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model_module: String,
    pub model_name: String,
    /// Empty means "generate one"
    #[serde(default)]
    pub model_id: String,
    /// Kernel-side class, passed along when opening the comm
    #[serde(default)]
    pub widget_class: String,
}

impl ModelSpec {
    pub fn new(model_module: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            model_module: model_module.into(),
            model_name: model_name.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn with_widget_class(mut self, widget_class: impl Into<String>) -> Self {
        self.widget_class = widget_class.into();
        self
    }
}

/// Receives display requests sent by the kernel
pub trait DisplayHandler: Send + Sync {
    fn display(&self, model: &WidgetModel, msg: Option<&CommMessage>) -> Result<(), WidgetError>;
}

/// Display handler that only logs the request
pub struct LogDisplay;

impl DisplayHandler for LogDisplay {
    fn display(&self, model: &WidgetModel, _msg: Option<&CommMessage>) -> Result<(), WidgetError> {
        tracing::info!(model = %model.to_json(), "Display requested");
        Ok(())
    }
}

struct ManagerInner {
    config: SyncConfig,
    opener: Arc<dyn CommOpener>,
    display: Arc<dyn DisplayHandler>,
    types: Mutex<HashMap<(String, String), Arc<ModelType>>>,
    models: Mutex<HashMap<String, WidgetModel>>,
}

/// Shared handle to the manager
#[derive(Clone)]
pub struct WidgetManager {
    inner: Arc<ManagerInner>,
}

/// Non-owning manager reference held by models
#[derive(Clone, Default)]
pub struct WeakManager(Weak<ManagerInner>);

impl WeakManager {
    pub fn upgrade(&self) -> Option<WidgetManager> {
        self.0.upgrade().map(|inner| WidgetManager { inner })
    }
}

impl WidgetManager {
    /// New manager with the base widget type registered
    pub fn new(
        config: SyncConfig,
        opener: Arc<dyn CommOpener>,
        display: Arc<dyn DisplayHandler>,
    ) -> Self {
        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                opener,
                display,
                types: Mutex::new(HashMap::new()),
                models: Mutex::new(HashMap::new()),
            }),
        };
        manager.register_model_type(ModelType::widget());
        manager
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakManager {
        WeakManager(Arc::downgrade(&self.inner))
    }

    pub fn ptr_eq(&self, other: &WidgetManager) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn models(&self) -> MutexGuard<'_, HashMap<String, WidgetModel>> {
        self.inner.models.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn types(&self) -> MutexGuard<'_, HashMap<(String, String), Arc<ModelType>>> {
        self.inner.types.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) a model type
    pub fn register_model_type(&self, model_type: ModelType) -> Arc<ModelType> {
        let model_type = Arc::new(model_type);
        self.types().insert(model_type.key(), model_type.clone());
        model_type
    }

    pub fn model_type(&self, module: &str, name: &str) -> Option<Arc<ModelType>> {
        self.types()
            .get(&(module.to_string(), name.to_string()))
            .cloned()
    }

    fn resolve_type(&self, spec: &ModelSpec) -> Result<Arc<ModelType>, WidgetError> {
        self.model_type(&spec.model_module, &spec.model_name)
            .ok_or_else(|| WidgetError::UnknownModelType {
                module: spec.model_module.clone(),
                name: spec.model_name.clone(),
            })
    }

    pub fn get_model(&self, model_id: &str) -> Option<WidgetModel> {
        self.models().get(model_id).cloned()
    }

    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Create a frontend-initiated widget: open a comm for it and sync its
    /// initial state to the kernel
    pub async fn new_widget(&self, spec: ModelSpec) -> Result<WidgetModel, WidgetError> {
        let model_id = if spec.model_id.is_empty() {
            generate_id()
        } else {
            spec.model_id.clone()
        };

        let result = self.open_widget(&spec, &model_id);
        result.map_err(|err| construction_failed(model_id, err))
    }

    fn open_widget(&self, spec: &ModelSpec, model_id: &str) -> Result<WidgetModel, WidgetError> {
        let model_type = self.resolve_type(spec)?;
        if self.get_model(model_id).is_some() {
            return Err(WidgetError::DuplicateModel(model_id.to_string()));
        }

        let comm = self.inner.opener.open(
            &self.inner.config.comm_target,
            json!({ "widget_class": spec.widget_class }),
        )?;
        let result = self.construct(model_id.to_string(), model_type, Some(comm.clone()), State::new());
        if result.is_err() {
            release_comm(comm.as_ref());
        }
        result
    }

    /// Create a model from serialized state, optionally bound to an existing comm
    pub async fn new_model(
        &self,
        spec: ModelSpec,
        comm: Option<Arc<dyn Comm>>,
        state: State,
    ) -> Result<WidgetModel, WidgetError> {
        let result = self.build_model(spec, comm.clone(), state).await;
        if let (Err(_), Some(comm)) = (&result, &comm) {
            // the kernel has to learn the model was rejected
            release_comm(comm.as_ref());
        }
        result
    }

    async fn build_model(
        &self,
        spec: ModelSpec,
        comm: Option<Arc<dyn Comm>>,
        state: State,
    ) -> Result<WidgetModel, WidgetError> {
        let model_type = self.resolve_type(&spec)?;
        let model_id = if spec.model_id.is_empty() {
            generate_id()
        } else {
            spec.model_id
        };
        if self.get_model(&model_id).is_some() {
            return Err(WidgetError::DuplicateModel(model_id));
        }

        let state = model_type.deserialize_state(state).await?;
        self.construct(model_id, model_type, comm, state)
    }

    /// A comm opened by the kernel: build the model its state describes
    pub async fn handle_comm_open(
        &self,
        comm: Arc<dyn Comm>,
        data: Value,
    ) -> Result<WidgetModel, WidgetError> {
        let state = data
            .get("state")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let model_module = state
            .get("_model_module")
            .and_then(Value::as_str)
            .unwrap_or("jupyter-js-widgets");
        let model_name = state
            .get("_model_name")
            .and_then(Value::as_str)
            .unwrap_or("WidgetModel");

        let model_id = comm.comm_id().to_string();
        let spec = ModelSpec::new(model_module, model_name).with_id(model_id.clone());
        tracing::debug!(model = %model_id, model_name, "Kernel opened comm");

        self.new_model(spec, Some(comm), state)
            .await
            .map_err(|err| construction_failed(model_id, err))
    }

    fn construct(
        &self,
        model_id: String,
        model_type: Arc<ModelType>,
        comm: Option<Arc<dyn Comm>>,
        state: State,
    ) -> Result<WidgetModel, WidgetError> {
        let model = WidgetModel::new(ModelOptions {
            manager: Some(self.clone()),
            model_id: model_id.clone(),
            comm,
            model_type,
            state,
            config: self.inner.config.clone(),
        })?;

        // the registered model keeps the id; callers release our comm
        let mut models = self.models();
        if models.contains_key(&model_id) {
            return Err(WidgetError::DuplicateModel(model_id));
        }
        models.insert(model_id, model.clone());
        Ok(model)
    }

    /// Forward a display request from a model
    pub fn display_model(
        &self,
        model: &WidgetModel,
        msg: Option<&CommMessage>,
    ) -> Result<(), WidgetError> {
        self.inner.display.display(model, msg)
    }

    /// Drop a closed model from the table
    pub(crate) fn forget(&self, model_id: &str) {
        if self.models().remove(model_id).is_some() {
            tracing::debug!(model = %model_id, "Model unregistered");
        }
    }

    /// Close every live model
    pub fn close_all(&self) {
        let models: Vec<WidgetModel> = self.models().values().cloned().collect();
        for model in models {
            model.close();
        }
    }
}

/// Close a comm whose model could not be built
fn release_comm(comm: &dyn Comm) {
    if let Err(err) = comm.close() {
        tracing::warn!(comm_id = %comm.comm_id(), error = %err, "Failed to close rejected comm");
    }
}

fn construction_failed(model_id: String, err: WidgetError) -> WidgetError {
    let err = WidgetError::Construction {
        model_id,
        source: Box::new(err),
    };
    let stack = err.error_stack();
    tracing::error!("Could not create widget: {}", stack[0]);
    for (i, cause) in stack.iter().enumerate().skip(1) {
        tracing::error!("  Chain[{}]: {}", i - 1, cause);
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{CommFrame, MemoryTransport};
    use crate::serializers::AttributeSerializer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingOpener;

    impl CommOpener for FailingOpener {
        fn open(&self, _target: &str, _data: Value) -> Result<Arc<dyn Comm>, WidgetError> {
            Err(WidgetError::Transport("kernel unreachable".to_string()))
        }
    }

    #[derive(Default)]
    struct CountingDisplay(AtomicUsize);

    impl DisplayHandler for CountingDisplay {
        fn display(&self, _model: &WidgetModel, _msg: Option<&CommMessage>) -> Result<(), WidgetError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn widget_spec(id: &str) -> ModelSpec {
        ModelSpec::new("jupyter-js-widgets", "WidgetModel")
            .with_id(id)
            .with_widget_class("ipywidgets.Widget")
    }

    #[tokio::test]
    async fn test_new_widget_registers_and_opens_comm() {
        let (transport, mut rx) = MemoryTransport::new();
        let manager = WidgetManager::new(SyncConfig::default(), transport, Arc::new(LogDisplay));

        let model = manager.new_widget(widget_spec("abc12")).await.unwrap();
        assert_eq!(model.id().as_deref(), Some("abc12"));
        assert!(manager.get_model("abc12").unwrap().ptr_eq(&model));
        assert!(model.widget_manager().unwrap().ptr_eq(&manager));

        match rx.try_recv().unwrap() {
            CommFrame::Open {
                target_name, data, ..
            } => {
                assert_eq!(target_name, "jupyter.widget");
                assert_eq!(data["widget_class"], "ipywidgets.Widget");
            }
            other => panic!("Expected Open frame, got {:?}", other),
        }
        // initial sync follows the open
        assert!(matches!(rx.try_recv().unwrap(), CommFrame::Msg { .. }));
    }

    #[tokio::test]
    async fn test_generated_id_when_empty() {
        let (transport, _rx) = MemoryTransport::new();
        let manager = WidgetManager::new(SyncConfig::default(), transport, Arc::new(LogDisplay));
        let model = manager
            .new_widget(ModelSpec::new("jupyter-js-widgets", "WidgetModel"))
            .await
            .unwrap();
        assert!(!model.id().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_is_construction_error() {
        let (transport, _rx) = MemoryTransport::new();
        let manager = WidgetManager::new(SyncConfig::default(), transport, Arc::new(LogDisplay));

        let err = manager
            .new_widget(ModelSpec::new("nope", "Missing").with_id("x1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WidgetError::Construction { .. }));
        let stack = err.error_stack();
        assert_eq!(stack.len(), 2);
        assert!(stack[1].contains("nope.Missing"));
        assert!(manager.model_ids().is_empty());
    }

    #[tokio::test]
    async fn test_opener_failure_is_construction_error() {
        let manager = WidgetManager::new(
            SyncConfig::default(),
            Arc::new(FailingOpener),
            Arc::new(LogDisplay),
        );
        let err = manager.new_widget(widget_spec("abc12")).await.unwrap_err();
        match &err {
            WidgetError::Construction { model_id, source } => {
                assert_eq!(model_id, "abc12");
                assert!(matches!(**source, WidgetError::Transport(_)));
            }
            other => panic!("Expected Construction error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (transport, _rx) = MemoryTransport::new();
        let manager = WidgetManager::new(SyncConfig::default(), transport, Arc::new(LogDisplay));
        manager.new_widget(widget_spec("dup")).await.unwrap();

        let err = manager.new_widget(widget_spec("dup")).await.unwrap_err();
        let stack = err.error_stack();
        assert_eq!(stack[1], "model id `dup` is already registered");
    }

    #[tokio::test]
    async fn test_close_unregisters() {
        let (transport, _rx) = MemoryTransport::new();
        let manager = WidgetManager::new(SyncConfig::default(), transport, Arc::new(LogDisplay));
        let model = manager.new_widget(widget_spec("gone")).await.unwrap();

        model.close();
        assert!(manager.get_model("gone").is_none());
    }

    #[tokio::test]
    async fn test_handle_comm_open_builds_kernel_model() {
        let (transport, mut rx) = MemoryTransport::new();
        let manager = WidgetManager::new(SyncConfig::default(), transport.clone(), Arc::new(LogDisplay));
        manager.register_model_type(
            ModelType::new("demo", "SliderModel")
                .with_widget_defaults("SliderView")
                .with_serializer(
                    "value",
                    AttributeSerializer::new()
                        .with_deserialize(|v| Ok(json!(v.as_i64().unwrap_or_default() * 10))),
                ),
        );

        let comm = transport.open_from_kernel("k-1", "jupyter.widget");
        let model = manager
            .handle_comm_open(
                comm,
                json!({"state": {"_model_module": "demo", "_model_name": "SliderModel", "value": 4}}),
            )
            .await
            .unwrap();

        assert_eq!(model.id().as_deref(), Some("k-1"));
        assert_eq!(model.get("value"), Some(json!(40)));
        assert_eq!(model.get("_view_name"), Some(json!("SliderView")));
        assert_eq!(model.pending_msgs(), 1);
        assert_eq!(rx.try_recv().unwrap().comm_id(), "k-1");
    }

    #[tokio::test]
    async fn test_rejected_kernel_state_closes_comm() {
        let (transport, mut rx) = MemoryTransport::new();
        let manager = WidgetManager::new(SyncConfig::default(), transport.clone(), Arc::new(LogDisplay));
        manager.register_model_type(
            ModelType::new("demo", "SliderModel").with_serializer(
                "value",
                AttributeSerializer::new().with_deserialize(|v| match v.as_i64() {
                    Some(n) => Ok(json!(n)),
                    None => Err(format!("not a number: {}", v).into()),
                }),
            ),
        );

        let comm = transport.open_from_kernel("k-2", "jupyter.widget");
        let err = manager
            .handle_comm_open(
                comm.clone(),
                json!({"state": {"_model_module": "demo", "_model_name": "SliderModel", "value": "high"}}),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, WidgetError::Construction { .. }));
        assert!(manager.get_model("k-2").is_none());
        assert!(!comm.is_live());
        match rx.try_recv().unwrap() {
            CommFrame::Close { comm_id, .. } => assert_eq!(comm_id, "k-2"),
            other => panic!("Expected Close frame, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_kernel_comm_is_closed() {
        let (transport, mut rx) = MemoryTransport::new();
        let manager = WidgetManager::new(SyncConfig::default(), transport.clone(), Arc::new(LogDisplay));
        let existing = manager.new_widget(widget_spec("dup")).await.unwrap();
        while rx.try_recv().is_ok() {}

        let comm = transport.open_from_kernel("dup", "jupyter.widget");
        manager.handle_comm_open(comm, json!({"state": {}})).await.unwrap_err();

        match rx.try_recv().unwrap() {
            CommFrame::Close { comm_id, .. } => assert_eq!(comm_id, "dup"),
            other => panic!("Expected Close frame, got {:?}", other),
        }
        // the registered model is untouched
        assert!(manager.get_model("dup").unwrap().ptr_eq(&existing));
        assert!(existing.comm_live());
    }

    #[tokio::test]
    async fn test_display_routes_to_handler() {
        let (transport, _rx) = MemoryTransport::new();
        let display = Arc::new(CountingDisplay::default());
        let manager = WidgetManager::new(SyncConfig::default(), transport, display.clone());
        let model = manager.new_widget(widget_spec("d1")).await.unwrap();

        manager.display_model(&model, None).unwrap();
        assert_eq!(display.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_all() {
        let (transport, _rx) = MemoryTransport::new();
        let manager = WidgetManager::new(SyncConfig::default(), transport, Arc::new(LogDisplay));
        let a = manager.new_widget(widget_spec("a")).await.unwrap();
        let b = manager.new_widget(widget_spec("b")).await.unwrap();

        manager.close_all();
        assert!(a.id().is_none());
        assert!(b.id().is_none());
        assert!(manager.model_ids().is_empty());
    }
}
