// Demo mode: a scripted session between the widget manager and a simulated kernel
//
// The frontend half is the real WidgetManager driving real models. The kernel
// half is a task that consumes the comm frames the frontend emits, prints and
// optionally records them, and answers every message with busy/idle statuses
// the way a kernel does once it has processed a request.
//
// Things worth watching in the output:
// - rapid local edits coalescing into one sync while the kernel is busy
// - kernel updates not being echoed back
// - a kernel-opened comm producing a frontend model
//
// Run with: widget-sync demo --delay-ms 500

use crate::comm::{CommFrame, MemoryTransport};
use crate::config::Config;
use crate::events::ModelEvent;
use crate::manager::{LogDisplay, ModelSpec, WidgetManager};
use crate::message::ExecutionState;
use crate::recorder::{generate_session_id, Recorder};
use crate::serializers::{AttributeSerializer, ModelType};
use crate::util::ellipsize;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

/// Module the demo model types are registered under
pub const DEMO_MODULE: &str = "demo-widgets";
pub const SLIDER_MODEL: &str = "IntSliderModel";

/// Frames longer than this are cut when printed
const PREVIEW_BYTES: usize = 160;

/// How the demo session runs
#[derive(Debug, Clone)]
pub struct DemoOptions {
    /// Pause between scripted steps
    pub delay: Duration,
    /// Record frames as JSON Lines into this directory
    pub record_dir: Option<PathBuf>,
    /// Print every frame the kernel receives
    pub echo: bool,
}

impl DemoOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            delay: Duration::from_millis(config.demo.delay_ms),
            record_dir: config.demo.record_dir.clone(),
            echo: true,
        }
    }
}

/// Frames the kernel side saw, by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounts {
    pub open: usize,
    pub msg: usize,
    pub close: usize,
}

impl FrameCounts {
    pub fn total(&self) -> usize {
        self.open + self.msg + self.close
    }
}

/// What happened during a demo run
#[derive(Debug)]
pub struct DemoSummary {
    pub frames: FrameCounts,
    /// Recording file, if recording was enabled
    pub recording: Option<PathBuf>,
    /// Slider value just before the session closed
    pub final_value: Option<Value>,
}

/// Integer slider: kernels may send floats for the value, which are rounded
pub fn slider_type() -> ModelType {
    ModelType::new(DEMO_MODULE, SLIDER_MODEL)
        .with_widget_defaults("IntSliderView")
        .with_default("value", json!(0))
        .with_default("min", json!(0))
        .with_default("max", json!(100))
        .with_default("description", json!(""))
        .with_serializer(
            "value",
            AttributeSerializer::new().with_deserialize(|value: Value| match value.as_f64() {
                Some(n) => Ok(json!(n.round() as i64)),
                None => Err(format!("expected a number, got {}", value).into()),
            }),
        )
}

/// Run the scripted session to completion
pub async fn run_demo(config: &Config, options: DemoOptions) -> Result<DemoSummary> {
    let (transport, frames) = MemoryTransport::new();
    let manager = WidgetManager::new(config.sync.clone(), transport.clone(), Arc::new(LogDisplay));
    manager.register_model_type(slider_type());

    // Recorder runs as its own task fed by the kernel loop
    let (record_tx, recorder_task, recording) = match &options.record_dir {
        Some(dir) => {
            let recorder = Recorder::new(dir, generate_session_id())?;
            let path = recorder.log_file_path();
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(tokio::spawn(recorder.run(rx))), Some(path))
        }
        None => (None, None, None),
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let kernel = tokio::spawn(run_kernel(
        transport.clone(),
        frames,
        record_tx,
        shutdown_rx,
        options.echo,
    ));

    let outcome = run_script(&manager, &transport, options.delay).await;

    // Stop the kernel even if the script failed part way
    let _ = shutdown_tx.send(());
    let frames = kernel.await.context("Kernel task panicked")?;
    if let Some(task) = recorder_task {
        task.await.context("Recorder task panicked")??;
    }

    let final_value = outcome?;
    tracing::info!(
        open = frames.open,
        msg = frames.msg,
        close = frames.close,
        "Demo session finished"
    );

    Ok(DemoSummary {
        frames,
        recording,
        final_value,
    })
}

async fn pause(delay: Duration) {
    // let the kernel task run even with a zero delay
    tokio::task::yield_now().await;
    sleep(delay).await;
}

async fn run_script(
    manager: &WidgetManager,
    transport: &MemoryTransport,
    delay: Duration,
) -> Result<Option<Value>> {
    // === Frontend creates a slider: comm open plus the initial sync ===
    let slider = manager
        .new_widget(
            ModelSpec::new(DEMO_MODULE, SLIDER_MODEL).with_widget_class("ipywidgets.IntSlider"),
        )
        .await?;
    let label = slider.to_json();

    let watched = label.clone();
    slider.on(
        "change:value",
        Arc::new(move |event: &ModelEvent| {
            if let ModelEvent::Change { value, .. } = event {
                tracing::info!(model = %watched, value = %value, "Slider value changed");
            }
        }),
    );
    let watched = label.clone();
    slider.on(
        "msg:custom",
        Arc::new(move |event: &ModelEvent| {
            if let ModelEvent::Custom { content, .. } = event {
                tracing::info!(model = %watched, content = %content, "Custom message from kernel");
            }
        }),
    );
    let watched = label.clone();
    slider.on(
        "comm:close destroy",
        Arc::new(move |event: &ModelEvent| {
            tracing::info!(model = %watched, event = %event.name(), "Slider lifecycle");
        }),
    );
    pause(delay).await;

    // === User drags the slider faster than the kernel answers ===
    for value in [10, 20, 30] {
        slider.set("value", json!(value));
        slider.save_changes(None)?;
    }
    tracing::info!(
        model = %label,
        pending = slider.pending_msgs(),
        buffered = ?slider.msg_buffer(),
        "Local edits queued"
    );
    pause(delay).await;

    // === Kernel pushes state, a custom event and a display request ===
    let comm_id = slider
        .comm()
        .map(|comm| comm.comm_id().to_string())
        .context("Slider has no comm")?;
    let comm = transport
        .comm(&comm_id)
        .context("Transport lost the slider comm")?;

    comm.deliver(json!({"method": "update", "state": {"value": 42.4}}), Vec::new());
    slider
        .state_change()
        .await
        .context("Kernel update was not applied")?;

    comm.deliver(
        json!({"method": "custom", "content": {"event": "tick", "count": 1}}),
        Vec::new(),
    );
    comm.deliver(json!({"method": "display"}), Vec::new());
    slider.send(json!({"event": "click"}), None, Vec::new())?;
    pause(delay).await;

    // === Kernel opens a widget of its own ===
    let kernel_comm = transport.open_from_kernel("kernel-slider", &manager.config().comm_target);
    let mirrored = manager
        .handle_comm_open(
            kernel_comm,
            json!({
                "state": {
                    "_model_module": DEMO_MODULE,
                    "_model_name": SLIDER_MODEL,
                    "value": 7.6,
                    "description": "from kernel"
                }
            }),
        )
        .await?;
    tracing::info!(
        model = %mirrored.to_json(),
        value = ?mirrored.get("value"),
        "Kernel-created widget"
    );
    pause(delay).await;

    let final_value = slider.get("value");

    // === Kernel closes the first comm, the frontend closes the rest ===
    comm.close_from_kernel();
    manager.close_all();
    pause(delay).await;

    Ok(final_value)
}

/// Kernel side: consume frames, reply to messages, until shut down
async fn run_kernel(
    transport: Arc<MemoryTransport>,
    mut frames: mpsc::UnboundedReceiver<CommFrame>,
    record: Option<mpsc::UnboundedSender<CommFrame>>,
    mut shutdown_rx: oneshot::Receiver<()>,
    echo: bool,
) -> FrameCounts {
    let mut counts = FrameCounts::default();

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => kernel_receive(&transport, frame, record.as_ref(), echo, &mut counts),
                None => break,
            },
            _ = &mut shutdown_rx => {
                // answer what is already queued, including syncs those answers flush
                while let Ok(frame) = frames.try_recv() {
                    kernel_receive(&transport, frame, record.as_ref(), echo, &mut counts);
                }
                tracing::debug!("Demo kernel received shutdown signal");
                break;
            }
        }
    }

    counts
}

fn kernel_receive(
    transport: &MemoryTransport,
    frame: CommFrame,
    record: Option<&mpsc::UnboundedSender<CommFrame>>,
    echo: bool,
    counts: &mut FrameCounts,
) {
    if echo {
        println!("frontend -> kernel  {}", preview(&frame));
    }
    if let Some(tx) = record {
        let _ = tx.send(frame.clone());
    }

    match &frame {
        CommFrame::Open { .. } => counts.open += 1,
        CommFrame::Close { .. } => counts.close += 1,
        CommFrame::Msg {
            comm_id, msg_id, ..
        } => {
            counts.msg += 1;
            if let Some(comm) = transport.comm(comm_id) {
                comm.reply_status(msg_id, ExecutionState::Busy);
                comm.reply_status(msg_id, ExecutionState::Idle);
            }
        }
    }
}

/// One-line JSON rendering of a frame, cut to a readable length
fn preview(frame: &CommFrame) -> String {
    let json = serde_json::to_string(frame).unwrap_or_default();
    ellipsize(&json, PREVIEW_BYTES).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::State;

    fn quiet(record_dir: Option<PathBuf>) -> DemoOptions {
        DemoOptions {
            delay: Duration::ZERO,
            record_dir,
            echo: false,
        }
    }

    #[tokio::test]
    async fn test_slider_value_deserializer_rounds() {
        let mut raw = State::new();
        raw.insert("value".to_string(), json!(7.6));
        let state = slider_type().deserialize_state(raw).await.unwrap();
        assert_eq!(state["value"], json!(8));

        let mut raw = State::new();
        raw.insert("value".to_string(), json!("seven"));
        assert!(slider_type().deserialize_state(raw).await.is_err());
    }

    #[tokio::test]
    async fn test_demo_session_runs_to_completion() {
        let summary = run_demo(&Config::default(), quiet(None)).await.unwrap();

        assert_eq!(summary.final_value, Some(json!(42)));
        // only the frontend-created widget opens a comm
        assert_eq!(summary.frames.open, 1);
        // only the locally closed widget sends a close
        assert_eq!(summary.frames.close, 1);
        // two creates, the slider edits and the custom click
        assert!(summary.frames.msg >= 4, "saw {:?}", summary.frames);
        assert!(summary.recording.is_none());
    }

    #[tokio::test]
    async fn test_demo_records_every_frame() {
        let dir = std::env::temp_dir().join(format!("widget-sync-demo-{}", generate_session_id()));
        let summary = run_demo(&Config::default(), quiet(Some(dir.clone())))
            .await
            .unwrap();
        let path = summary.recording.unwrap();
        let recorded = std::fs::read_to_string(&path).unwrap();
        assert_eq!(recorded.lines().count(), summary.frames.total());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_preview_truncates_long_frames() {
        let frame = CommFrame::Open {
            comm_id: "c1".to_string(),
            target_name: "jupyter.widget".to_string(),
            timestamp: chrono::Utc::now(),
            data: json!({"padding": "x".repeat(400)}),
        };
        let shown = preview(&frame);
        assert!(shown.ends_with("..."));
        assert_eq!(shown.len(), PREVIEW_BYTES + 3);
    }
}
