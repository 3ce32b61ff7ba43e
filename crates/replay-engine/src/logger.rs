//! Iteration transcript sink.
//!
//! One logger per campaign, writing into
//! `<script-stem>_logs/<YYYY-MM-DD,HHMMSS>/` next to the script file. Each
//! logged iteration becomes one file named after its seed index, holding the
//! reason it was logged plus the exact bytes sent and received up to the last
//! message the run reached. Quiet campaigns construct no logger at all, so no
//! directory ever appears.
//!
//! The inbound-byte bookkeeping of the previous run is kept alongside the
//! current run's, so a "log the previous iteration" request still has the
//! right data after the logger was reset for the new run.

use anyhow::{Context, Result};
use chrono::Local;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::script::MessageCollection;

pub struct TranscriptLogger {
    dir: PathBuf,
    received: BTreeMap<usize, Vec<u8>>,
    highest_index: Option<usize>,
    prev_received: BTreeMap<usize, Vec<u8>>,
    prev_highest_index: Option<usize>,
}

impl TranscriptLogger {
    /// Create the timestamped log directory next to the script file.
    pub fn create(script_path: &Path) -> Result<Self> {
        let stem = script_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "fuzz".into());
        let parent = script_path.parent().unwrap_or_else(|| Path::new("."));
        let dir = parent
            .join(format!("{stem}_logs"))
            .join(Local::now().format("%Y-%m-%d,%H%M%S").to_string());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        tracing::info!("logging to {}", dir.display());
        Ok(Self {
            dir,
            received: BTreeMap::new(),
            highest_index: None,
            prev_received: BTreeMap::new(),
            prev_highest_index: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Roll the current run's bookkeeping into the "previous" slot and start
    /// fresh. Called at the top of every run, before anything can fail.
    pub fn start_new_run(&mut self) {
        self.prev_received = std::mem::take(&mut self.received);
        self.prev_highest_index = self.highest_index.take();
    }

    pub fn record_inbound(&mut self, message_index: usize, bytes: &[u8]) {
        self.received.insert(message_index, bytes.to_vec());
    }

    pub fn record_highest_index(&mut self, message_index: usize) {
        self.highest_index = Some(
            self.highest_index
                .map_or(message_index, |h| h.max(message_index)),
        );
    }

    /// Write the transcript of the current run.
    pub fn emit(&self, iteration: i64, collection: &MessageCollection, reason: &str) {
        if let Err(e) = self.write_transcript(
            iteration,
            collection,
            reason,
            &self.received,
            self.highest_index,
        ) {
            tracing::warn!("failed to write transcript for iteration {iteration}: {e}");
        }
    }

    /// Write a transcript using the previous run's inbound bookkeeping.
    pub fn emit_previous(&self, iteration: i64, collection: &MessageCollection, reason: &str) {
        if let Err(e) = self.write_transcript(
            iteration,
            collection,
            reason,
            &self.prev_received,
            self.prev_highest_index,
        ) {
            tracing::warn!("failed to write transcript for iteration {iteration}: {e}");
        }
    }

    fn write_transcript(
        &self,
        iteration: i64,
        collection: &MessageCollection,
        reason: &str,
        received: &BTreeMap<usize, Vec<u8>>,
        highest_index: Option<usize>,
    ) -> std::io::Result<()> {
        let path = self.dir.join(iteration.to_string());
        let mut out = BufWriter::new(File::create(path)?);

        writeln!(out, "Case {iteration}: {reason}")?;
        writeln!(out, "Logged at {}", Local::now().format("%Y-%m-%d %H:%M:%S"))?;

        let Some(highest) = highest_index else {
            writeln!(out, "No messages were processed.")?;
            return out.flush();
        };
        for (i, message) in collection.messages.iter().enumerate() {
            if i > highest {
                break;
            }
            let direction = if message.is_outbound() { "outbound" } else { "inbound" };
            let fuzzed = if message.is_fuzzed() { " (fuzzed)" } else { "" };
            writeln!(out)?;
            writeln!(out, "Message {i} {direction}{fuzzed}")?;
            writeln!(out, "  scripted: {}", escape_bytes(&message.assembled()))?;
            if !message.is_outbound() {
                match received.get(&i) {
                    Some(data) => writeln!(out, "  received: {}", escape_bytes(data))?,
                    None => writeln!(out, "  received: <nothing>")?,
                }
            }
        }
        out.flush()
    }
}

/// Printable ASCII stays as-is; everything else becomes `\xNN`.
fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            0x20..=0x7e if b != b'\\' => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out
}
