//! Crash-edge plumbing and the external target monitor.
//!
//! The monitor is an optional executable named `monitor` in the processor
//! directory, spawned once per campaign as `monitor <host> <port>`. Every
//! non-empty line it prints on stdout is one crash observation: a reader
//! thread sets the shared crash edge and forwards the line as detail for the
//! transcript. The controller consumes the edge only at iteration
//! boundaries, so a crash report never races a run in progress.
//!
//! User cancellation is deliberately a separate channel: SIGINT only ever
//! sets the process-wide interrupt flag, checked between iterations.

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One-bit "crash observed since last consumed" signal between the monitor
/// thread and the iteration controller.
#[derive(Clone, Default)]
pub struct CrashEdge(Arc<AtomicBool>);

impl CrashEdge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consume the edge: returns whether it was set, and clears it.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Keeps the monitor child alive for the campaign; kills it on drop.
pub struct MonitorHandle {
    child: Child,
    /// Crash detail lines reported by the monitor, drained by the controller
    /// when it consumes the edge.
    pub reports: Receiver<String>,
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawn `<processor_dir>/monitor` if present and executable. Returns `None`
/// when the directory supplies no monitor — monitoring is then a no-op.
pub fn spawn_monitor(
    processor_dir: &Path,
    host: &str,
    port: u16,
    edge: CrashEdge,
) -> Result<Option<MonitorHandle>> {
    let program = processor_dir.join("monitor");
    if !is_executable(&program) {
        return Ok(None);
    }

    let mut child = Command::new(&program)
        .arg(host)
        .arg(port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to launch monitor {}", program.display()))?;
    let stdout = child
        .stdout
        .take()
        .context("monitor stdout was not piped")?;
    tracing::info!("monitor started: {}", program.display());

    let (tx, rx): (Sender<String>, Receiver<String>) = crossbeam_channel::bounded(16);
    std::thread::Builder::new()
        .name("monitor-watch".into())
        .spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(_) => break,
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                tracing::warn!("monitor reported: {line}");
                edge.set();
                let _ = tx.try_send(line.to_string());
            }
            tracing::warn!("monitor process ended");
        })?;

    Ok(Some(MonitorHandle { child, reports: rx }))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

// ─── User cancellation ───────────────────────────────────────────────────────

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT handler. Cancellation is honored between iterations.
pub fn install_interrupt_handler() {
    unsafe { libc::signal(libc::SIGINT, handle_sigint as *const () as libc::sighandler_t) };
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}
