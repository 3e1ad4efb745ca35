//! Per-run log files.
//!
//! Each session writes two artifacts under the state log directory: a raw
//! transcript of everything the child printed (`*_output.log`) and a JSON
//! lines file of every bridge event published for the run
//! (`*_events.jsonl`). Each JSONL line is a self-contained object with a
//! timestamp, making logs easy to grep, stream, and post-process.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use serde_json::Value;

use crate::events::BridgeEvent;

/// Writer for one run's transcript and event log.
pub struct RunLog {
    transcript: Mutex<BufWriter<File>>,
    events: Mutex<BufWriter<File>>,
    transcript_path: PathBuf,
    events_path: PathBuf,
}

impl RunLog {
    /// Create both log files under `dir`, stamped with the start time so
    /// repeated runs of the same id never collide.
    pub fn create(dir: &Path, run_id: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory: {}", dir.display()))?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let transcript_path = dir.join(format!("{run_id}_{stamp}_output.log"));
        let events_path = dir.join(format!("{run_id}_{stamp}_events.jsonl"));
        Ok(Self {
            transcript: Mutex::new(BufWriter::new(open_append(&transcript_path)?)),
            events: Mutex::new(BufWriter::new(open_append(&events_path)?)),
            transcript_path,
            events_path,
        })
    }

    pub fn transcript_path(&self) -> &Path {
        &self.transcript_path
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Append raw child output verbatim.
    pub fn append_output(&self, chunk: &str) -> Result<()> {
        let mut writer = self.transcript.lock().unwrap_or_else(|e| e.into_inner());
        writer
            .write_all(chunk.as_bytes())
            .context("failed to write transcript")?;
        writer.flush().context("failed to flush transcript")?;
        Ok(())
    }

    /// Append one event as a JSON line.
    pub fn record(&self, event: &BridgeEvent) -> Result<()> {
        let mut line = event.wire_value();
        if let Some(object) = line.as_object_mut() {
            object.insert(
                "timestamp".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }
        let json = serde_json::to_string(&line).context("failed to serialize log entry")?;
        let mut writer = self.events.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file: {}", path.display()))
}
