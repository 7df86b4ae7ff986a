//! Comm and kernel message payloads
//!
//! Inbound comm messages arrive as `{content: {comm_id, data: {method, ...}}}`
//! with binary buffers carried out of band. The `method` field selects what
//! the model does with the message (see [`CommData`]).

use crate::error::WidgetError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

/// Attribute name -> value mapping synchronized with the kernel
pub type State = serde_json::Map<String, Value>;

/// A message delivered over a comm
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommMessage {
    #[serde(default)]
    pub content: CommContent,
    /// Binary buffers referenced by the payload
    #[serde(skip)]
    pub buffers: Vec<Bytes>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommContent {
    #[serde(default)]
    pub comm_id: String,
    #[serde(default)]
    pub data: Value,
}

impl CommMessage {
    pub fn new(comm_id: impl Into<String>, data: Value) -> Self {
        Self {
            content: CommContent {
                comm_id: comm_id.into(),
                data,
            },
            buffers: Vec::new(),
        }
    }

    pub fn with_buffers(mut self, buffers: Vec<Bytes>) -> Self {
        self.buffers = buffers;
        self
    }

    /// Parse a message from its JSON form
    pub fn from_value(value: Value) -> Result<Self, WidgetError> {
        Ok(serde_json::from_value(value)?)
    }

    /// The `method` field of the data payload, if any
    pub fn method(&self) -> Option<&str> {
        self.content.data.get("method").and_then(Value::as_str)
    }

    /// Decode the data payload
    pub fn data(&self) -> Result<CommData, WidgetError> {
        Ok(CommData::deserialize(&self.content.data)?)
    }
}

/// Decoded comm data, tagged by `method`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum CommData {
    /// State pushed by the kernel
    Update {
        #[serde(default)]
        state: State,
        #[serde(default)]
        buffer_paths: Vec<Value>,
    },
    /// Arbitrary payload for views and listeners
    Custom {
        #[serde(default)]
        content: Value,
    },
    /// Kernel asks the frontend to display the model
    Display,
}

impl CommData {
    /// Outbound sync payload for already-serialized state
    pub fn update(state: State) -> Self {
        Self::Update {
            state,
            buffer_paths: Vec::new(),
        }
    }

    pub fn custom(content: Value) -> Self {
        Self::Custom { content }
    }

    /// JSON form sent over the wire
    pub fn to_value(&self) -> Value {
        match self {
            Self::Update {
                state,
                buffer_paths,
            } => json!({ "method": "update", "state": state, "buffer_paths": buffer_paths }),
            Self::Custom { content } => json!({ "method": "custom", "content": content }),
            Self::Display => json!({ "method": "display" }),
        }
    }
}

/// Kernel execution state reported on the iopub channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Busy,
    Idle,
    Starting,
}

/// A reply routed back from the kernel for a message we sent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelMessage {
    #[serde(default)]
    pub msg_type: String,
    #[serde(default)]
    pub parent_msg_id: Option<String>,
    #[serde(default)]
    pub content: Value,
}

impl KernelMessage {
    /// Build an iopub status message
    pub fn status(parent_msg_id: Option<String>, state: ExecutionState) -> Self {
        Self {
            msg_type: "status".to_string(),
            parent_msg_id,
            content: json!({ "execution_state": state }),
        }
    }

    pub fn execution_state(&self) -> Option<ExecutionState> {
        self.content
            .get("execution_state")
            .and_then(|v| ExecutionState::deserialize(v).ok())
    }
}

/// Handler invoked with a kernel reply
pub type KernelHandler = Arc<dyn Fn(&KernelMessage) + Send + Sync>;

/// Reply handlers attached to an outbound message, keyed by channel
#[derive(Clone, Default)]
pub struct Callbacks {
    pub iopub: IopubCallbacks,
}

#[derive(Clone, Default)]
pub struct IopubCallbacks {
    pub status: Option<KernelHandler>,
}

impl Callbacks {
    /// Route a kernel reply to the matching handler.
    /// Returns false when no handler exists for its type.
    pub fn dispatch(&self, msg: &KernelMessage) -> bool {
        match msg.msg_type.as_str() {
            "status" => match &self.iopub.status {
                Some(handler) => {
                    handler(msg);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("iopub.status", &self.iopub.status.is_some())
            .finish()
    }
}
