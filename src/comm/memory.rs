// In-process comm transport
//
// Frontend-side traffic is published as `CommFrame` values on an unbounded
// mpsc channel, which the kernel side (tests, the demo kernel, the recorder)
// consumes. The kernel side talks back through `MemoryComm::deliver`,
// `MemoryComm::close_from_kernel` and `MemoryComm::reply_status`.

use super::{Comm, CommHandler, CommOpener};
use crate::error::WidgetError;
use crate::events::generate_id;
use crate::message::{Callbacks, CommMessage, ExecutionState, KernelMessage};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Outbound traffic observed by the kernel side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")] // {"type": "msg", ...}
pub enum CommFrame {
    /// A comm was opened by the frontend
    Open {
        comm_id: String,
        target_name: String,
        timestamp: DateTime<Utc>,
        data: Value,
    },

    /// A data message on an open comm
    Msg {
        comm_id: String,
        msg_id: String,
        timestamp: DateTime<Utc>,
        data: Value,
        /// Binary buffers travel out of band and are not recorded
        #[serde(skip)]
        buffers: Vec<Bytes>,
    },

    /// The frontend closed the comm
    Close {
        comm_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl CommFrame {
    pub fn comm_id(&self) -> &str {
        match self {
            Self::Open { comm_id, .. } | Self::Msg { comm_id, .. } | Self::Close { comm_id, .. } => {
                comm_id
            }
        }
    }
}

#[derive(Default)]
struct Handlers {
    on_msg: Option<CommHandler>,
    on_close: Option<CommHandler>,
}

/// One end of an in-memory comm
pub struct MemoryComm {
    comm_id: String,
    target_name: String,
    live: AtomicBool,
    outbound: mpsc::UnboundedSender<CommFrame>,
    handlers: Mutex<Handlers>,
    /// Reply callbacks by outbound message id
    pending: Mutex<HashMap<String, Callbacks>>,
}

impl MemoryComm {
    pub fn new(
        comm_id: impl Into<String>,
        target_name: impl Into<String>,
        outbound: mpsc::UnboundedSender<CommFrame>,
    ) -> Self {
        Self {
            comm_id: comm_id.into(),
            target_name: target_name.into(),
            live: AtomicBool::new(true),
            outbound,
            handlers: Mutex::new(Handlers::default()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Stand-alone comm plus the receiver of everything it sends
    pub fn pair(
        comm_id: impl Into<String>,
        target_name: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CommFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(comm_id, target_name, tx)), rx)
    }

    /// Deliver a kernel message to the installed `on_msg` handler.
    /// Returns false if nothing is listening or the comm is closed.
    pub fn deliver(&self, data: Value, buffers: Vec<Bytes>) -> bool {
        if !self.is_live() {
            return false;
        }
        let handler = self.handlers.lock().unwrap_or_else(PoisonError::into_inner).on_msg.clone();
        match handler {
            Some(handler) => {
                let msg = CommMessage::new(self.comm_id.clone(), data).with_buffers(buffers);
                handler(&msg);
                true
            }
            None => false,
        }
    }

    /// Simulate the kernel closing the comm
    pub fn close_from_kernel(&self) -> bool {
        if !self.live.swap(false, Ordering::SeqCst) {
            return false;
        }
        let handler = self.handlers.lock().unwrap_or_else(PoisonError::into_inner).on_close.clone();
        if let Some(handler) = handler {
            handler(&CommMessage::new(self.comm_id.clone(), Value::Null));
        }
        true
    }

    /// Route an execution-state reply to the callbacks of message `msg_id`.
    ///
    /// Callbacks are dropped once the kernel reports idle, matching the
    /// lifetime of a single request.
    pub fn reply_status(&self, msg_id: &str, state: ExecutionState) -> bool {
        let callbacks = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if state == ExecutionState::Idle {
                pending.remove(msg_id)
            } else {
                pending.get(msg_id).cloned()
            }
        };

        match callbacks {
            Some(callbacks) => {
                callbacks.dispatch(&KernelMessage::status(Some(msg_id.to_string()), state))
            }
            None => false,
        }
    }

    /// Ids of sent messages still awaiting an idle status
    pub fn awaiting_reply(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

impl Comm for MemoryComm {
    fn comm_id(&self) -> &str {
        &self.comm_id
    }

    fn target_name(&self) -> &str {
        &self.target_name
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn send(
        &self,
        data: Value,
        callbacks: Option<Callbacks>,
        buffers: Vec<Bytes>,
    ) -> Result<String, WidgetError> {
        if !self.is_live() {
            return Err(WidgetError::CommNotLive {
                comm_id: self.comm_id.clone(),
            });
        }

        let msg_id = generate_id();
        if let Some(callbacks) = callbacks {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(msg_id.clone(), callbacks);
        }

        self.outbound
            .send(CommFrame::Msg {
                comm_id: self.comm_id.clone(),
                msg_id: msg_id.clone(),
                timestamp: Utc::now(),
                data,
                buffers,
            })
            .map_err(|_| WidgetError::Transport("kernel side hung up".to_string()))?;

        Ok(msg_id)
    }

    fn close(&self) -> Result<(), WidgetError> {
        if !self.live.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.outbound
            .send(CommFrame::Close {
                comm_id: self.comm_id.clone(),
                timestamp: Utc::now(),
            })
            .map_err(|_| WidgetError::Transport("kernel side hung up".to_string()))
    }

    fn on_msg(&self, handler: CommHandler) {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner).on_msg = Some(handler);
    }

    fn on_close(&self, handler: CommHandler) {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner).on_close = Some(handler);
    }
}

/// Opens [`MemoryComm`]s that all publish to one kernel-side receiver
pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<CommFrame>,
    comms: Mutex<HashMap<String, Arc<MemoryComm>>>,
}

impl MemoryTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CommFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            outbound: tx,
            comms: Mutex::new(HashMap::new()),
        });
        (transport, rx)
    }

    /// Kernel-side handle to an opened comm
    pub fn comm(&self, comm_id: &str) -> Option<Arc<MemoryComm>> {
        self.comms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(comm_id)
            .cloned()
    }

    /// Create a comm as if the kernel had opened it
    pub fn open_from_kernel(&self, comm_id: impl Into<String>, target_name: &str) -> Arc<MemoryComm> {
        let comm = Arc::new(MemoryComm::new(comm_id, target_name, self.outbound.clone()));
        self.comms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(comm.comm_id().to_string(), comm.clone());
        comm
    }
}

impl CommOpener for MemoryTransport {
    fn open(&self, target_name: &str, data: Value) -> Result<Arc<dyn Comm>, WidgetError> {
        let comm_id = generate_id();
        let comm = Arc::new(MemoryComm::new(comm_id.clone(), target_name, self.outbound.clone()));

        self.outbound
            .send(CommFrame::Open {
                comm_id: comm_id.clone(),
                target_name: target_name.to_string(),
                timestamp: Utc::now(),
                data,
            })
            .map_err(|_| WidgetError::Transport("kernel side hung up".to_string()))?;

        tracing::debug!(comm_id = %comm_id, target = target_name, "Opened memory comm");
        self.comms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(comm_id, comm.clone());
        Ok(comm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IopubCallbacks;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_send_publishes_frame() {
        let (comm, mut rx) = MemoryComm::pair("c1", "jupyter.widget");
        let msg_id = comm.send(json!({"method": "custom"}), None, vec![]).unwrap();

        match rx.try_recv().unwrap() {
            CommFrame::Msg {
                comm_id,
                msg_id: sent_id,
                data,
                ..
            } => {
                assert_eq!(comm_id, "c1");
                assert_eq!(sent_id, msg_id);
                assert_eq!(data["method"], "custom");
            }
            other => panic!("Expected Msg frame, got {:?}", other),
        }
    }

    #[test]
    fn test_send_after_close_fails() {
        let (comm, mut rx) = MemoryComm::pair("c1", "jupyter.widget");
        comm.close().unwrap();
        assert!(!comm.is_live());
        assert!(matches!(rx.try_recv().unwrap(), CommFrame::Close { .. }));

        let err = comm.send(json!({}), None, vec![]).unwrap_err();
        assert!(matches!(err, WidgetError::CommNotLive { .. }));
        // closing twice is quiet
        comm.close().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reply_status_routes_to_callbacks() {
        let (comm, _rx) = MemoryComm::pair("c1", "jupyter.widget");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let callbacks = Callbacks {
            iopub: IopubCallbacks {
                status: Some(Arc::new(move |_: &KernelMessage| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            },
        };

        let msg_id = comm.send(json!({}), Some(callbacks), vec![]).unwrap();
        assert_eq!(comm.awaiting_reply(), vec![msg_id.clone()]);

        assert!(comm.reply_status(&msg_id, ExecutionState::Busy));
        assert!(comm.reply_status(&msg_id, ExecutionState::Idle));
        // callbacks are released after idle
        assert!(!comm.reply_status(&msg_id, ExecutionState::Idle));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(comm.awaiting_reply().is_empty());
    }

    #[test]
    fn test_kernel_close_invokes_handler_once() {
        let (comm, _rx) = MemoryComm::pair("c1", "jupyter.widget");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        comm.on_close(Arc::new(move |_: &CommMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(comm.close_from_kernel());
        assert!(!comm.close_from_kernel());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!comm.deliver(json!({"method": "display"}), vec![]));
    }

    #[test]
    fn test_transport_open_registers_comm() {
        let (transport, mut rx) = MemoryTransport::new();
        let comm = transport
            .open("jupyter.widget", json!({"widget_class": "ipywidgets.Widget"}))
            .unwrap();

        match rx.try_recv().unwrap() {
            CommFrame::Open { comm_id, data, .. } => {
                assert_eq!(comm_id, comm.comm_id());
                assert_eq!(data["widget_class"], "ipywidgets.Widget");
            }
            other => panic!("Expected Open frame, got {:?}", other),
        }
        assert!(transport.comm(comm.comm_id()).is_some());
    }
}
