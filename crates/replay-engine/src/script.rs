//! Conversation script: the ordered messages replayed against the target.
//!
//! A script file describes one client↔server conversation. Each message is
//! outbound (we send it) or inbound (we expect the target to send it), and is
//! split into one or more parts that can be independently fuzzed and
//! independently rewritten by callbacks.
//!
//! Part payloads keep two copies: the load-time `original` (shared, never
//! written again) and the `altered` working bytes that mutation and callbacks
//! operate on. [`Subcomponent::reset`] always restores the load-time
//! original, so a cloned [`MessageCollection`] plus per-message resets gives
//! every iteration a clean slate.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// One independently fuzzable byte range of an outbound message.
#[derive(Debug, Clone)]
pub struct Subcomponent {
    original: Arc<[u8]>,
    altered: Vec<u8>,
    pub fuzz: bool,
}

impl Subcomponent {
    pub fn new(bytes: Vec<u8>, fuzz: bool) -> Self {
        let original: Arc<[u8]> = bytes.into();
        Self { altered: original.to_vec(), original, fuzz }
    }

    /// Restore the working bytes to the load-time original. Idempotent.
    pub fn reset(&mut self) {
        self.altered = self.original.to_vec();
    }

    pub fn original(&self) -> &Arc<[u8]> {
        &self.original
    }

    pub fn altered(&self) -> &[u8] {
        &self.altered
    }

    pub fn set_altered(&mut self, bytes: Vec<u8>) {
        self.altered = bytes;
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub direction: Direction,
    /// Never empty; a single-part message is treated as whole-message for
    /// callback dispatch.
    pub parts: Vec<Subcomponent>,
    /// Bytes actually read off the wire for an inbound message, set during a
    /// run.
    pub received: Option<Vec<u8>>,
}

impl Message {
    pub fn new(direction: Direction, parts: Vec<Subcomponent>) -> Self {
        Self { direction, parts, received: None }
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::Outbound
    }

    /// A message is fuzzed when any of its parts is.
    pub fn is_fuzzed(&self) -> bool {
        self.parts.iter().any(|p| p.fuzz)
    }

    /// Whether callbacks see this message part-by-part.
    pub fn has_parts(&self) -> bool {
        self.parts.len() > 1
    }

    /// Concatenation of all parts' current working bytes.
    pub fn assembled(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.parts.iter().map(|p| p.altered.len()).sum());
        for part in &self.parts {
            out.extend_from_slice(&part.altered);
        }
        out
    }

    /// Revert fuzzing and callback edits on every part.
    pub fn reset(&mut self) {
        for part in &mut self.parts {
            part.reset();
        }
    }
}

/// Ordered conversation. `Clone` is the per-iteration deep copy: part
/// originals stay shared, working bytes are owned by the clone.
#[derive(Debug, Clone)]
pub struct MessageCollection {
    pub messages: Vec<Message>,
}

/// Everything the script file configures for one conversation.
#[derive(Debug, Clone)]
pub struct FuzzScript {
    pub transport: Transport,
    /// Destination port. Ignored for UNIX-path targets.
    pub port: u16,
    pub source_ip: Option<String>,
    pub source_port: Option<u16>,
    pub receive_timeout: Duration,
    /// Consecutive crash detections tolerated at one seed before moving on.
    pub failure_threshold: u32,
    /// Back-off between retries of a crashing seed.
    pub failure_timeout: Duration,
    /// Perform one unfuzzed run before fuzzing starts.
    pub dry_run: bool,
    /// Directory contributing the external monitor; `"default"` means the
    /// script file's own directory.
    pub processor_dir: String,
    /// Interface name for the raw-l2 transport.
    pub interface: Option<String>,
    pub messages: MessageCollection,
    /// Where the script was loaded from; anchors the log directory and the
    /// processor directory.
    pub path: PathBuf,
}

impl FuzzScript {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script file: {}", path.display()))?;
        let raw: RawScript = toml::from_str(&text)
            .with_context(|| format!("failed to parse script file: {}", path.display()))?;
        raw.build(path)
            .with_context(|| format!("invalid script file: {}", path.display()))
    }

    /// Resolve the processor directory relative to the script file.
    pub fn processor_dir_path(&self) -> PathBuf {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        if self.processor_dir == "default" {
            parent.to_path_buf()
        } else {
            parent.join(&self.processor_dir)
        }
    }
}

// ─── File format ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScript {
    transport: String,
    #[serde(default)]
    port: u16,
    source_ip: Option<String>,
    source_port: Option<u16>,
    #[serde(default = "defaults::receive_timeout")]
    receive_timeout: f64,
    #[serde(default = "defaults::failure_threshold")]
    failure_threshold: u32,
    #[serde(default = "defaults::failure_timeout")]
    failure_timeout: f64,
    #[serde(default = "defaults::dry_run")]
    dry_run: bool,
    #[serde(default = "defaults::processor_dir")]
    processor_dir: String,
    interface: Option<String>,
    #[serde(default, rename = "message")]
    messages: Vec<RawMessage>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMessage {
    direction: String,
    #[serde(default, rename = "part")]
    parts: Vec<RawPart>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPart {
    text: Option<String>,
    hex: Option<String>,
    #[serde(default)]
    fuzz: bool,
}

mod defaults {
    pub fn receive_timeout() -> f64 {
        3.0
    }
    pub fn failure_threshold() -> u32 {
        3
    }
    pub fn failure_timeout() -> f64 {
        5.0
    }
    pub fn dry_run() -> bool {
        true
    }
    pub fn processor_dir() -> String {
        "default".into()
    }
}

impl RawScript {
    fn build(self, path: &Path) -> Result<FuzzScript> {
        let transport = Transport::parse(&self.transport).map_err(anyhow::Error::msg)?;
        if self.failure_threshold == 0 {
            bail!("failure_threshold must be at least 1");
        }
        if self.receive_timeout <= 0.0 {
            bail!("receive_timeout must be positive");
        }
        if self.messages.is_empty() {
            bail!("script has no messages");
        }
        if transport == Transport::RawL2 && self.interface.is_none() {
            bail!("raw-l2 transport requires an interface");
        }

        let mut messages = Vec::with_capacity(self.messages.len());
        for (i, raw) in self.messages.into_iter().enumerate() {
            let direction = match raw.direction.as_str() {
                "outbound" => Direction::Outbound,
                "inbound" => Direction::Inbound,
                other => bail!("message {i}: unknown direction '{other}'"),
            };
            if raw.parts.is_empty() {
                bail!("message {i} has no parts");
            }
            let mut parts = Vec::with_capacity(raw.parts.len());
            for (j, part) in raw.parts.into_iter().enumerate() {
                let bytes = match (part.text, part.hex) {
                    (Some(text), None) => text.into_bytes(),
                    (None, Some(encoded)) => hex::decode(encoded.trim())
                        .with_context(|| format!("message {i} part {j}: bad hex payload"))?,
                    _ => bail!("message {i} part {j}: exactly one of text/hex is required"),
                };
                parts.push(Subcomponent::new(bytes, part.fuzz));
            }
            messages.push(Message::new(direction, parts));
        }

        Ok(FuzzScript {
            transport,
            port: self.port,
            source_ip: self.source_ip,
            source_port: self.source_port,
            receive_timeout: Duration::from_secs_f64(self.receive_timeout),
            failure_threshold: self.failure_threshold,
            failure_timeout: Duration::from_secs_f64(self.failure_timeout),
            dry_run: self.dry_run,
            processor_dir: self.processor_dir,
            interface: self.interface,
            messages: MessageCollection { messages },
            path: path.to_path_buf(),
        })
    }
}
