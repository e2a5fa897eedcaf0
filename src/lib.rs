//! panehost - PTY session host for a multi-pane developer workspace
//!
//! panehost owns the shell processes behind a workspace's terminal panes.
//! It spawns them in pseudo terminals, streams their raw output to
//! subscribers in batches, persists a filtered copy as replayable scrollback,
//! recovers that scrollback after a crash or restart, and tears processes
//! down with bounded escalation.
//!
//! # Quick Start
//!
//! ```no_run
//! use panehost::{Config, CreateRequest, PaneEvent, SessionManager};
//!
//! # async fn demo() -> panehost::Result<()> {
//! let manager = SessionManager::new(Config::load());
//! let attach = manager
//!     .create_or_attach(CreateRequest::new("pane-1", "tab-1", "ws-1"))
//!     .await?;
//! print!("{}", attach.scrollback);
//!
//! let mut events = attach.events;
//! manager.write("pane-1", b"echo hi\n").await?;
//! while let Ok(PaneEvent::Data(bytes)) = events.recv().await {
//!     print!("{}", String::from_utf8_lossy(&bytes));
//! }
//! manager.cleanup().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod history;
pub mod mux;

pub use crate::config::Config;
pub use crate::core::session::{LaunchPhase, PaneEvent, PaneId, SessionInfo, SessionStatus};
pub use crate::error::{Result, SessionError};
pub use crate::mux::{AttachResult, CreateRequest, KillOutcome, KillSummary, SessionManager};
