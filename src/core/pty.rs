//! Pseudo-terminal backend
//!
//! This module wraps `portable-pty` (Unix pty / Windows ConPTY) behind the
//! [`PtyBackend`] trait. The session controller only sees the split handles in
//! [`PtyHandles`]: a control half for resize and signals, a blocking reader,
//! a writer and a child handle whose `wait` blocks until the process exits.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

/// Signal sent by `signal()` when the caller does not name one
pub const DEFAULT_SIGNAL: &str = "SIGTERM";
/// Signal used when a terminate request is ignored
pub const FORCE_SIGNAL: &str = "SIGKILL";

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open pseudo terminal: {0:#}")]
    Open(anyhow::Error),

    #[error("Failed to spawn {program}: {cause:#}")]
    Spawn { program: String, cause: anyhow::Error },

    #[error("Failed to resize pseudo terminal: {0:#}")]
    Resize(anyhow::Error),

    #[error("Failed to deliver {signal} to pid {pid}: {reason}")]
    Signal {
        signal: String,
        pid: u32,
        reason: String,
    },

    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    #[error("Process id unavailable")]
    NoPid,

    #[error("PTY I/O failed: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Everything needed to start one shell process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Complete child environment; nothing is inherited
    pub env: BTreeMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// How a child process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: i32,
    pub signal: Option<String>,
}

impl ExitInfo {
    pub fn code(exit_code: i32) -> Self {
        Self {
            exit_code,
            signal: None,
        }
    }
}

/// Resize/signal half of a running PTY
pub trait PtyControl: Send {
    fn resize(&mut self, cols: u16, rows: u16) -> Result<()>;

    /// Deliver a signal by name (`"SIGTERM"`, `"TERM"`, `"sigint"` ...)
    fn signal(&mut self, signal: &str) -> Result<()>;

    fn pid(&self) -> Option<u32>;
}

/// Wait half of a running PTY
pub trait PtyChild: Send {
    /// Blocks until the process exits
    fn wait(&mut self) -> ExitInfo;
}

/// Split handles of a freshly spawned process
pub struct PtyHandles {
    pub control: Box<dyn PtyControl>,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub child: Box<dyn PtyChild>,
}

/// Something that can start shells inside a pseudo terminal
pub trait PtyBackend: Send + Sync + 'static {
    fn spawn(&self, spec: &SpawnSpec) -> Result<PtyHandles>;
}

/// The OS pseudo terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyBackend;

impl PtyBackend for NativePtyBackend {
    fn spawn(&self, spec: &SpawnSpec) -> Result<PtyHandles> {
        let pair = native_pty_system()
            .openpty(pty_size(spec.cols, spec.rows))
            .map_err(PtyError::Open)?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        cmd.env_clear();
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|cause| PtyError::Spawn {
                program: spec.program.clone(),
                cause,
            })?;
        // The reader only sees EOF once every slave handle is closed
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(PtyError::Open)?;
        let writer = pair.master.take_writer().map_err(PtyError::Open)?;
        let pid = child.process_id();
        let killer = child.clone_killer();

        Ok(PtyHandles {
            control: Box::new(NativeControl {
                master: pair.master,
                killer,
                pid,
            }),
            reader,
            writer,
            child: Box::new(NativeChild { child }),
        })
    }
}

struct NativeControl {
    master: Box<dyn MasterPty + Send>,
    #[cfg_attr(unix, allow(dead_code))]
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
}

impl PtyControl for NativeControl {
    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(pty_size(cols, rows))
            .map_err(PtyError::Resize)
    }

    #[cfg(unix)]
    fn signal(&mut self, signal: &str) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let name = normalize_signal(signal);
        let sig: Signal = name
            .parse()
            .map_err(|_| PtyError::UnknownSignal(signal.to_string()))?;
        let pid = self.pid.ok_or(PtyError::NoPid)?;
        let raw = i32::try_from(pid).map_err(|_| PtyError::NoPid)?;
        kill(Pid::from_raw(raw), sig).map_err(|e| PtyError::Signal {
            signal: name,
            pid,
            reason: e.to_string(),
        })
    }

    #[cfg(not(unix))]
    fn signal(&mut self, signal: &str) -> Result<()> {
        // ConPTY children have no POSIX signals; every request terminates
        tracing::debug!("Terminating pid {:?} for {}", self.pid, signal);
        self.killer.kill().map_err(PtyError::Io)
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

struct NativeChild {
    child: Box<dyn Child + Send + Sync>,
}

impl PtyChild for NativeChild {
    fn wait(&mut self) -> ExitInfo {
        match self.child.wait() {
            Ok(status) => ExitInfo::code(i32::try_from(status.exit_code()).unwrap_or(i32::MAX)),
            Err(e) => {
                tracing::warn!("Failed to wait for child: {}", e);
                ExitInfo::code(-1)
            }
        }
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows: rows.max(1),
        cols: cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// `"term"` / `"TERM"` / `"SIGTERM"` all become `"SIGTERM"`
pub fn normalize_signal(signal: &str) -> String {
    let upper = signal.trim().to_ascii_uppercase();
    if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    }
}
