//! Core per-session components.
//!
//! Everything here is owned by a single [`session::Session`] and never
//! shared across panes:
//!
//! - **pty**: pseudo-terminal backend seam (`portable-pty` in production)
//! - **shell**: default and fallback shell resolution
//! - **env**: child environment and launch arguments
//! - **filter**: escape filter for the persisted output copy
//! - **scrollback**: byte-capped in-memory scrollback
//! - **batcher**: output coalescing for subscribers
//! - **input**: queued, chunked writes into the PTY
//! - **session**: the session entity and its launch state machine
//!
//! # Architecture
//!
//! ```text
//! PTY reader ──> Session::handle_output
//!                 ├── EscapeFilter ──> Scrollback + HistoryWriter
//!                 └── DataBatcher  ──> PaneEvent::Data subscribers
//! caller write ──> InputWriter ──> PTY writer
//! ```

pub mod batcher;
pub mod env;
pub mod filter;
pub mod input;
pub mod pty;
pub mod scrollback;
pub mod session;
pub mod shell;

#[cfg(test)]
pub mod fake_pty;
