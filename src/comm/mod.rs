//! Comm channel abstraction
//!
//! A comm is a bidirectional message channel between a frontend model and its
//! kernel-side counterpart. The model only relies on the [`Comm`] trait:
//! sending data, closing, and attaching handlers for inbound messages and
//! remote closure. [`CommOpener`] is how the manager asks a transport for a
//! new comm.

use crate::error::WidgetError;
use crate::message::{Callbacks, CommMessage};
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;

pub mod memory;

pub use memory::{CommFrame, MemoryComm, MemoryTransport};

/// Handler for inbound comm traffic
pub type CommHandler = Arc<dyn Fn(&CommMessage) + Send + Sync>;

/// A live message channel to the kernel
pub trait Comm: Send + Sync {
    fn comm_id(&self) -> &str;

    fn target_name(&self) -> &str;

    /// Whether the channel can still carry messages
    fn is_live(&self) -> bool;

    /// Send a data payload, returning the message id replies will reference
    fn send(
        &self,
        data: Value,
        callbacks: Option<Callbacks>,
        buffers: Vec<Bytes>,
    ) -> Result<String, WidgetError>;

    /// Close the channel from this side
    fn close(&self) -> Result<(), WidgetError>;

    /// Install the inbound message handler (replaces any previous one)
    fn on_msg(&self, handler: CommHandler);

    /// Install the remote-close handler (replaces any previous one)
    fn on_close(&self, handler: CommHandler);
}

/// Opens new comms on behalf of the manager
pub trait CommOpener: Send + Sync {
    fn open(&self, target_name: &str, data: Value) -> Result<Arc<dyn Comm>, WidgetError>;
}
