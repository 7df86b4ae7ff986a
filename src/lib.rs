//! Frontend-side widget model synchronization
//!
//! A kernel and a frontend each hold a copy of every widget's attribute
//! state and keep the copies in step over a bidirectional comm channel.
//! This crate is the frontend half:
//!
//! - [`model::WidgetModel`] mirrors one widget: local writes, kernel updates,
//!   echo suppression, send throttling and the comm lifecycle
//! - [`manager::WidgetManager`] creates models (frontend- or kernel-initiated),
//!   tracks them by id and routes display requests
//! - [`serializers`] holds the per-type attribute serializers
//! - [`comm`] defines the channel traits plus an in-process transport
//!
//! Everything runs on tokio; a model's state queue is a spawned task, so
//! models must be created from within a runtime.

pub mod comm;
pub mod config;
pub mod demo;
pub mod error;
pub mod events;
pub mod logging;
pub mod manager;
pub mod message;
pub mod model;
pub mod recorder;
pub mod serializers;
pub mod util;

pub use comm::{Comm, CommFrame, CommOpener, MemoryComm, MemoryTransport};
pub use error::WidgetError;
pub use events::{ListenerId, ModelEvent};
pub use manager::{DisplayHandler, LogDisplay, ModelSpec, WidgetManager};
pub use message::{Callbacks, CommData, CommMessage, ExecutionState, KernelMessage, State};
pub use model::{ModelOptions, SyncMethod, WidgetModel};
pub use serializers::{AttributeSerializer, ModelType};
