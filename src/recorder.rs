// Recorder - writes comm frames to disk in JSON Lines format
//
// One JSON object per line keeps recordings easy to stream, grep and feed to
// jq. Each session gets its own file: widget-sync-YYYYMMDD-HHMMSS-XXXX.jsonl
// Example: jq 'select(.type == "msg") | .data.method' logs/frames/widget-sync-*.jsonl

use crate::comm::CommFrame;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Appends comm frames to a per-session JSONL file
pub struct Recorder {
    log_dir: PathBuf,
    session_id: String,
}

impl Recorder {
    /// Create a recorder, making sure the directory exists
    pub fn new(log_dir: impl Into<PathBuf>, session_id: impl Into<String>) -> Result<Self> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir).context("Failed to create recording directory")?;

        Ok(Self {
            log_dir,
            session_id: session_id.into(),
        })
    }

    /// Path of this session's recording
    pub fn log_file_path(&self) -> PathBuf {
        self.log_dir
            .join(format!("widget-sync-{}.jsonl", self.session_id))
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Append one frame
    pub fn record(&self, frame: &CommFrame) -> Result<()> {
        let log_path = self.log_file_path();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .context("Failed to open recording file")?;

        let json = serde_json::to_string(frame).context("Failed to serialize frame")?;
        writeln!(file, "{}", json).context("Failed to write to recording file")?;

        // Flush immediately so recordings survive a crash
        file.flush().context("Failed to flush recording file")?;
        Ok(())
    }

    /// Record frames until the channel closes
    pub async fn run(self, mut frames: mpsc::UnboundedReceiver<CommFrame>) -> Result<()> {
        tracing::info!("Recorder started, session file: {:?}", self.log_file_path());

        while let Some(frame) = frames.recv().await {
            if let Err(e) = self.record(&frame) {
                tracing::error!("Failed to record frame: {:?}", e);
                // Keep going; one bad write should not end the session
            }
        }

        tracing::info!("Recorder shutting down");
        Ok(())
    }
}

/// Session id for recording file names
/// Format: YYYYMMDD-HHMMSS-XXXX (timestamp + 4 random hex chars)
pub fn generate_session_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    let random = RandomState::new().build_hasher().finish();
    format!("{}-{:04x}", timestamp, random & 0xFFFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("widget-sync-{}-{}", name, generate_session_id()))
    }

    #[test]
    fn test_session_id_format() {
        let id = generate_session_id();
        // YYYYMMDD-HHMMSS-XXXX
        assert_eq!(id.len(), 20);
        assert_eq!(id.matches('-').count(), 2);
    }

    #[tokio::test]
    async fn test_records_frames_as_json_lines() {
        let dir = scratch_dir("rec");
        let recorder = Recorder::new(&dir, "s1").unwrap();
        let path = recorder.log_file_path();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(CommFrame::Open {
            comm_id: "c1".to_string(),
            target_name: "jupyter.widget".to_string(),
            timestamp: Utc::now(),
            data: json!({}),
        })
        .unwrap();
        tx.send(CommFrame::Close {
            comm_id: "c1".to_string(),
            timestamp: Utc::now(),
        })
        .unwrap();
        drop(tx);

        recorder.run(rx).await.unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "open");
        assert_eq!(lines[1]["type"], "close");

        let _ = fs::remove_dir_all(&dir);
    }
}
