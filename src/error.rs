//! Session Controller errors

use thiserror::Error;

use crate::core::pty::PtyError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session not alive: {0}")]
    NotAlive(String),

    #[error("Failed to launch shell {shell}: {source}")]
    ShellLaunch {
        shell: String,
        #[source]
        source: PtyError,
    },

    #[error("Failed to deliver {signal} to {pane_id}: {source}")]
    SignalDelivery {
        pane_id: String,
        signal: String,
        #[source]
        source: PtyError,
    },

    #[error("Process for {0} survived terminate and kill; state force-cleared")]
    ForcedTeardown(String),

    #[error("History I/O failed for {pane_id}: {source}")]
    HistoryIo {
        pane_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Input queue full for {0}")]
    InputQueueFull(String),

    #[error("Session manager has shut down")]
    ManagerClosed,
}

pub type Result<T> = std::result::Result<T, SessionError>;
