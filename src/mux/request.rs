//! Request and response types of the session manager

use std::path::PathBuf;

use tokio::sync::broadcast;

use crate::core::session::{PaneEvent, PaneId};

/// Parameters of `create_or_attach`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateRequest {
    pub pane_id: PaneId,
    pub tab_id: String,
    pub workspace_id: String,
    pub cwd: Option<PathBuf>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub workspace_name: Option<String>,
    pub root_path: Option<PathBuf>,
    /// Run once after the first output of a fresh session
    pub initial_commands: Vec<String>,
}

impl CreateRequest {
    pub fn new(pane_id: &str, tab_id: &str, workspace_id: &str) -> Self {
        Self {
            pane_id: pane_id.to_string(),
            tab_id: tab_id.to_string(),
            workspace_id: workspace_id.to_string(),
            ..Self::default()
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = Some(cols);
        self.rows = Some(rows);
        self
    }

    pub fn workspace_name(mut self, name: &str) -> Self {
        self.workspace_name = Some(name.to_string());
        self
    }

    pub fn root_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_path = Some(path.into());
        self
    }

    pub fn initial_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.initial_commands = commands.into_iter().map(Into::into).collect();
        self
    }
}

/// Result of `create_or_attach`
#[derive(Debug)]
pub struct AttachResult {
    /// A process was spawned for this call
    pub is_new: bool,
    /// Filtered scrollback to replay before live data
    pub scrollback: String,
    /// Scrollback came from a previous session (memory or disk)
    pub was_recovered: bool,
    /// Live events, subscribed before any batch after this reply
    pub events: broadcast::Receiver<PaneEvent>,
}

/// How a kill ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// No such session
    NotFound,
    /// Session was already dead and has been removed
    Removed,
    /// Exited after the terminate signal
    Terminated,
    /// Exited after the forceful kill signal
    Killed,
    /// Survived both signals; state was cleared anyway
    ForceCleared,
}

impl KillOutcome {
    pub fn is_success(self) -> bool {
        !matches!(self, KillOutcome::ForceCleared)
    }
}

/// Result of `kill_by_workspace_id`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KillSummary {
    pub killed: usize,
    pub failed: usize,
}
