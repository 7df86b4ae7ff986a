//! Error types for the widget model, manager and comm layer

use thiserror::Error;

/// Boxed error returned by user-supplied deserializers
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while creating, syncing or tearing down widget models
#[derive(Debug, Error)]
pub enum WidgetError {
    /// A sync or custom send was attempted on a model without a comm
    #[error("syncing error: no comm channel defined for model `{model}`")]
    NoComm { model: String },

    /// The comm exists but has been closed
    #[error("comm `{comm_id}` is not live")]
    CommNotLive { comm_id: String },

    /// The underlying transport refused the message
    #[error("comm transport failure: {0}")]
    Transport(String),

    /// A registered deserializer rejected an attribute value
    #[error("failed to deserialize attribute `{attr}`")]
    Deserialize {
        attr: String,
        #[source]
        source: BoxError,
    },

    /// Inbound comm data did not match any known method
    #[error("malformed comm message")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("no model type registered for {module}.{name}")]
    UnknownModelType { module: String, name: String },

    #[error("model id `{0}` is already registered")]
    DuplicateModel(String),

    /// The manager owning a model was dropped before the model
    #[error("widget manager for model `{0}` has been dropped")]
    ManagerGone(String),

    #[error("display request failed: {0}")]
    Display(String),

    /// Models spawn their state queue, so they need a running tokio runtime
    #[error("no tokio runtime available for model `{0}`")]
    NoRuntime(String),

    /// Wraps whatever went wrong while building a model
    #[error("could not create widget `{model_id}`")]
    Construction {
        model_id: String,
        #[source]
        source: Box<WidgetError>,
    },
}

impl WidgetError {
    /// Messages of every error in the causal chain, outermost first
    pub fn error_stack(&self) -> Vec<String> {
        std::iter::successors(
            Some(self as &(dyn std::error::Error + 'static)),
            |err| err.source(),
        )
        .map(ToString::to_string)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_stack_walks_sources() {
        let err = WidgetError::Construction {
            model_id: "abc12".to_string(),
            source: Box::new(WidgetError::Deserialize {
                attr: "value".to_string(),
                source: "not a number".into(),
            }),
        };

        let stack = err.error_stack();
        assert_eq!(stack.len(), 3);
        assert_eq!(stack[0], "could not create widget `abc12`");
        assert_eq!(stack[1], "failed to deserialize attribute `value`");
        assert_eq!(stack[2], "not a number");
    }

    #[test]
    fn test_error_stack_single() {
        let err = WidgetError::DuplicateModel("x".to_string());
        assert_eq!(err.error_stack(), vec!["model id `x` is already registered"]);
    }
}
