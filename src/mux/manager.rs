//! Session manager
//!
//! Cloneable handle to the controller task. Query-style operations await a
//! reply; `resize`, `signal`, `detach` and `clear_scrollback` are best-effort
//! and only log. Kill escalation runs here, in the caller's task, so a wedged
//! process never stalls the controller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;

use crate::config::{Config, TimingConfig};
use crate::core::pty::{NativePtyBackend, PtyBackend, DEFAULT_SIGNAL, FORCE_SIGNAL};
use crate::core::session::{PaneEvent, SessionInfo, SessionStatus};
use crate::error::{Result, SessionError};
use crate::mux::controller::{self, Command, KillStart};
use crate::mux::request::{AttachResult, CreateRequest, KillOutcome, KillSummary};

#[derive(Clone)]
pub struct SessionManager {
    tx: mpsc::Sender<Command>,
    timing: TimingConfig,
}

impl SessionManager {
    /// Manager backed by the OS pseudo terminal; must be called inside a
    /// tokio runtime
    pub fn new(config: Config) -> Self {
        Self::with_backend(config, Arc::new(NativePtyBackend))
    }

    pub fn with_backend(config: Config, backend: Arc<dyn PtyBackend>) -> Self {
        let timing = config.timing;
        Self {
            tx: controller::spawn(config, backend),
            timing,
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| SessionError::ManagerClosed)?;
        rx.await.map_err(|_| SessionError::ManagerClosed)
    }

    async fn notify(&self, command: Command) {
        if self.tx.send(command).await.is_err() {
            tracing::debug!("Session manager closed; dropping command");
        }
    }

    /// Attach to the pane's live session, or start one
    pub async fn create_or_attach(&self, request: CreateRequest) -> Result<AttachResult> {
        self.request(|reply| Command::CreateOrAttach { request, reply })
            .await?
    }

    pub async fn write(&self, pane_id: &str, data: &[u8]) -> Result<()> {
        self.request(|reply| Command::Write {
            pane_id: pane_id.to_string(),
            data: data.to_vec(),
            reply,
        })
        .await?
    }

    pub async fn resize(&self, pane_id: &str, cols: u16, rows: u16) {
        self.notify(Command::Resize {
            pane_id: pane_id.to_string(),
            cols,
            rows,
        })
        .await;
    }

    /// Deliver `signal` (default `SIGTERM`)
    pub async fn signal(&self, pane_id: &str, signal: Option<&str>) {
        self.notify(Command::Signal {
            pane_id: pane_id.to_string(),
            signal: signal.unwrap_or(DEFAULT_SIGNAL).to_string(),
        })
        .await;
    }

    /// Terminate a session, escalating to a forceful kill and finally to
    /// clearing its state if the process will not die
    pub async fn kill(&self, pane_id: &str, delete_history: bool) -> Result<KillOutcome> {
        let start = self
            .request(|reply| Command::Kill {
                pane_id: pane_id.to_string(),
                delete_history,
                reply,
            })
            .await?;
        let mut status = match start {
            KillStart::NotFound => return Ok(KillOutcome::NotFound),
            KillStart::Removed => return Ok(KillOutcome::Removed),
            KillStart::Signaled(status) => status,
        };

        if wait_for_exit(&mut status, self.timing.terminate_timeout()).await {
            return Ok(KillOutcome::Terminated);
        }
        tracing::warn!(
            "[{}] Still running after {}; sending {}",
            pane_id,
            DEFAULT_SIGNAL,
            FORCE_SIGNAL
        );
        self.signal(pane_id, Some(FORCE_SIGNAL)).await;

        if wait_for_exit(&mut status, self.timing.force_kill_timeout()).await {
            return Ok(KillOutcome::Killed);
        }
        tracing::error!("{}", SessionError::ForcedTeardown(pane_id.to_string()));
        self.request(|reply| Command::ForceClear {
            pane_id: pane_id.to_string(),
            reply,
        })
        .await?;
        Ok(KillOutcome::ForceCleared)
    }

    /// Update `last_active`; the process keeps running
    pub async fn detach(&self, pane_id: &str) {
        self.notify(Command::Detach {
            pane_id: pane_id.to_string(),
        })
        .await;
    }

    pub async fn clear_scrollback(&self, pane_id: &str) {
        self.notify(Command::ClearScrollback {
            pane_id: pane_id.to_string(),
        })
        .await;
    }

    /// Delete a pane's persisted history. A live session keeps running and
    /// its history is deleted when it exits.
    pub async fn delete_history(&self, workspace_id: &str, pane_id: &str) -> Result<()> {
        self.request(|reply| Command::DeleteHistory {
            workspace_id: workspace_id.to_string(),
            pane_id: pane_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn get_session(&self, pane_id: &str) -> Result<Option<SessionInfo>> {
        self.request(|reply| Command::GetSession {
            pane_id: pane_id.to_string(),
            reply,
        })
        .await
    }

    /// Every registry entry, including recently dead sessions
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        self.request(|reply| Command::ListSessions { reply }).await
    }

    /// Extra receiver for a pane's events
    pub async fn subscribe(&self, pane_id: &str) -> Result<Option<broadcast::Receiver<PaneEvent>>> {
        self.request(|reply| Command::Subscribe {
            pane_id: pane_id.to_string(),
            reply,
        })
        .await
    }

    /// Kill every live session of a workspace and delete their history
    pub async fn kill_by_workspace_id(&self, workspace_id: &str) -> Result<KillSummary> {
        let panes = self.workspace_sessions(workspace_id).await?;
        let mut kills = JoinSet::new();
        for pane_id in panes {
            let manager = self.clone();
            kills.spawn(async move {
                let outcome = manager.kill(&pane_id, true).await;
                (pane_id, outcome)
            });
        }

        let mut summary = KillSummary::default();
        while let Some(joined) = kills.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) if outcome.is_success() => summary.killed += 1,
                Ok((_, Ok(_))) => summary.failed += 1,
                Ok((pane_id, Err(e))) => {
                    tracing::warn!("[{}] Kill failed: {}", pane_id, e);
                    summary.failed += 1;
                }
                Err(e) => {
                    tracing::warn!("Kill task failed: {}", e);
                    summary.failed += 1;
                }
            }
        }
        tracing::info!(
            "Workspace {}: killed {}, failed {}",
            workspace_id,
            summary.killed,
            summary.failed
        );
        Ok(summary)
    }

    /// Number of live sessions in a workspace
    pub async fn get_session_count_by_workspace_id(&self, workspace_id: &str) -> Result<usize> {
        Ok(self.workspace_sessions(workspace_id).await?.len())
    }

    async fn workspace_sessions(&self, workspace_id: &str) -> Result<Vec<String>> {
        self.request(|reply| Command::WorkspaceSessions {
            workspace_id: workspace_id.to_string(),
            reply,
        })
        .await
    }

    /// Shutdown hook: kill everything within `cleanup_timeout`, then stop the
    /// controller. Later calls on any handle return `ManagerClosed`.
    pub async fn cleanup(&self) {
        let limit = self.timing.cleanup_timeout();
        let panes: Vec<String> = match self.list_sessions().await {
            Ok(sessions) => sessions
                .into_iter()
                .filter(|s| s.is_alive)
                .map(|s| s.pane_id)
                .collect(),
            Err(_) => return,
        };

        let mut kills = JoinSet::new();
        for pane_id in panes {
            let manager = self.clone();
            kills.spawn(async move { manager.kill(&pane_id, false).await });
        }
        let all = async { while kills.join_next().await.is_some() {} };
        if tokio::time::timeout(limit, all).await.is_err() {
            tracing::warn!("Cleanup timed out after {:?}; force-clearing", limit);
        }
        drop(kills);

        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok()
            && tokio::time::timeout(limit, rx).await.is_err()
        {
            tracing::warn!("Controller shutdown timed out after {:?}", limit);
        }
    }
}

/// True once the session reports an exit (or is gone) within `limit`
async fn wait_for_exit(status: &mut watch::Receiver<SessionStatus>, limit: Duration) -> bool {
    let exited = async {
        let _ = status
            .wait_for(|s| matches!(s, SessionStatus::Exited { .. }))
            .await;
    };
    tokio::time::timeout(limit, exited).await.is_ok()
}
