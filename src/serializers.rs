//! Per-model-type serializer tables
//!
//! Every model type carries a [`SerializerTable`] mapping attribute names to
//! optional `serialize` / `deserialize` functions. Outbound state goes through
//! `serialize` synchronously. Inbound state goes through `deserialize`, which
//! may complete immediately or asynchronously. Attributes without an entry
//! pass through unchanged.

use crate::error::{BoxError, WidgetError};
use crate::message::State;
use futures::future::{self, BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Prefix used when a model is referenced from another model's state
pub const MODEL_REF_PREFIX: &str = "IPY_MODEL_";

pub type SerializeFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
pub type DeserializeFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;

/// Serialization hooks for a single attribute
#[derive(Clone, Default)]
pub struct AttributeSerializer {
    serialize: Option<SerializeFn>,
    deserialize: Option<DeserializeFn>,
}

impl AttributeSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_serialize<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.serialize = Some(Arc::new(f));
        self
    }

    /// Deserializer that completes immediately
    pub fn with_deserialize<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.deserialize = Some(Arc::new(move |value: Value| {
            // runs when polled, not when the future is built
            let f = f.clone();
            async move { f(value) }.boxed()
        }));
        self
    }

    /// Deserializer that resolves later
    pub fn with_async_deserialize<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        self.deserialize = Some(Arc::new(move |value: Value| f(value).boxed()));
        self
    }
}

impl fmt::Debug for AttributeSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeSerializer")
            .field("serialize", &self.serialize.is_some())
            .field("deserialize", &self.deserialize.is_some())
            .finish()
    }
}

/// Attribute name -> serialization hooks
#[derive(Debug, Clone, Default)]
pub struct SerializerTable {
    entries: HashMap<String, AttributeSerializer>,
}

impl SerializerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, attr: impl Into<String>, serializer: AttributeSerializer) {
        self.entries.insert(attr.into(), serializer);
    }

    pub fn get(&self, attr: &str) -> Option<&AttributeSerializer> {
        self.entries.get(attr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize every attribute in `state`
    pub fn serialize(&self, state: &State) -> State {
        state
            .iter()
            .map(|(attr, value)| {
                let out = match self.get(attr).and_then(|s| s.serialize.as_ref()) {
                    Some(serialize) => serialize(value),
                    None => value.clone(),
                };
                (attr.clone(), out)
            })
            .collect()
    }

    /// Deserialize every attribute in `raw` concurrently.
    ///
    /// Resolves once every attribute has resolved; the first failure rejects
    /// the whole state.
    pub fn deserialize_state(
        &self,
        raw: State,
    ) -> impl Future<Output = Result<State, WidgetError>> + Send + 'static {
        let pending: Vec<_> = raw
            .into_iter()
            .map(|(attr, value)| {
                let resolving = match self.get(&attr).and_then(|s| s.deserialize.as_ref()) {
                    Some(deserialize) => deserialize(value),
                    None => future::ready(Ok(value)).boxed(),
                };
                async move {
                    match resolving.await {
                        Ok(value) => Ok((attr, value)),
                        Err(source) => Err(WidgetError::Deserialize { attr, source }),
                    }
                }
            })
            .collect();

        async move {
            let resolved = future::try_join_all(pending).await?;
            Ok(resolved.into_iter().collect())
        }
    }
}

/// A model class: its identity, default attributes and serializers
#[derive(Debug, Clone)]
pub struct ModelType {
    pub module: String,
    pub name: String,
    pub serializers: SerializerTable,
    pub defaults: State,
}

impl ModelType {
    /// Bare type with no defaults or serializers
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            serializers: SerializerTable::new(),
            defaults: State::new(),
        }
    }

    /// The base widget model type
    pub fn widget() -> Self {
        Self::new("jupyter-js-widgets", "WidgetModel").with_widget_defaults("WidgetView")
    }

    /// Fill in the standard identity attributes for this type
    pub fn with_widget_defaults(mut self, view_name: &str) -> Self {
        let defaults = [
            ("_model_module", json!(self.module)),
            ("_model_name", json!(self.name)),
            ("_view_module", json!(self.module)),
            ("_view_name", json!(view_name)),
            ("msg_throttle", json!(1)),
        ];
        for (attr, value) in defaults {
            self.defaults.insert(attr.to_string(), value);
        }
        self
    }

    pub fn with_default(mut self, attr: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(attr.into(), value);
        self
    }

    pub fn with_serializer(mut self, attr: impl Into<String>, serializer: AttributeSerializer) -> Self {
        self.serializers.insert(attr, serializer);
        self
    }

    /// Registry key for this type
    pub fn key(&self) -> (String, String) {
        (self.module.clone(), self.name.clone())
    }

    pub fn deserialize_state(
        &self,
        raw: State,
    ) -> impl Future<Output = Result<State, WidgetError>> + Send + 'static {
        self.serializers.deserialize_state(raw)
    }
}

/// Extract the model id from an `IPY_MODEL_<id>` reference
pub fn model_reference(value: &str) -> Option<&str> {
    value
        .strip_prefix(MODEL_REF_PREFIX)
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn state(value: Value) -> State {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_deserialize_sync_and_async() {
        let model_type = ModelType::widget()
            .with_serializer(
                "a",
                AttributeSerializer::new()
                    .with_deserialize(|v| Ok(json!(v.as_f64().unwrap_or_default() * 3.0))),
            )
            .with_serializer(
                "b",
                AttributeSerializer::new().with_async_deserialize(|v: Value| async move {
                    tokio::task::yield_now().await;
                    Ok::<_, BoxError>(json!(v.as_f64().unwrap_or_default() / 2.0))
                }),
            );

        let out = model_type
            .deserialize_state(state(json!({"a": 2.0, "b": 2.0, "c": 2.0})))
            .await
            .unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out["a"], json!(6.0));
        assert_eq!(out["b"], json!(1.0));
        assert_eq!(out["c"], json!(2.0));
    }

    #[tokio::test]
    async fn test_deserialize_failure_names_attribute() {
        let table = {
            let mut t = SerializerTable::new();
            t.insert(
                "bad",
                AttributeSerializer::new().with_deserialize(|_| Err("boom".into())),
            );
            t
        };

        let err = table
            .deserialize_state(state(json!({"ok": 1, "bad": 2})))
            .await
            .unwrap_err();
        match err {
            WidgetError::Deserialize { attr, source } => {
                assert_eq!(attr, "bad");
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("Expected Deserialize error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sync_deserializer_waits_for_poll() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut table = SerializerTable::new();
        table.insert(
            "a",
            AttributeSerializer::new().with_deserialize(move |v| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(v)
            }),
        );

        let pending = table.deserialize_state(state(json!({"a": 1})));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(pending.await.unwrap()["a"], json!(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_serialize_passthrough_and_null() {
        let table = SerializerTable::new();
        let input = state(json!({"a": 5, "b": null, "c": "some-string"}));
        assert_eq!(table.serialize(&input), input);
    }

    #[test]
    fn test_serialize_projection() {
        let mut table = SerializerTable::new();
        table.insert(
            "need_custom_serializer",
            AttributeSerializer::new().with_serialize(|v| v["use_this"].clone()),
        );

        let input = state(json!({
            "a": 5,
            "need_custom_serializer": {"use_this": 6, "ignored": "should not get serialized"}
        }));
        assert_eq!(
            table.serialize(&input),
            state(json!({"a": 5, "need_custom_serializer": 6}))
        );
    }

    #[test]
    fn test_widget_defaults() {
        let t = ModelType::widget();
        assert_eq!(t.defaults["_model_name"], "WidgetModel");
        assert_eq!(t.defaults["_model_module"], "jupyter-js-widgets");
        assert_eq!(t.key(), ("jupyter-js-widgets".to_string(), "WidgetModel".to_string()));
    }

    #[test]
    fn test_model_reference() {
        assert_eq!(model_reference("IPY_MODEL_abc12"), Some("abc12"));
        assert_eq!(model_reference("IPY_MODEL_"), None);
        assert_eq!(model_reference("abc12"), None);
    }
}
