//! Session controller
//!
//! A single task owns the session registry. Every public operation, every
//! PTY event and every timer arrives here as a [`Command`] on one channel, so
//! registry state is never shared or locked.
//!
//! Anything that can block stays off this task: history reads and cwd checks
//! run in a preparation task, `PtyBackend::spawn` runs on the blocking pool
//! and reports back with `Spawned`, and each process gets a reader thread
//! and a waiter thread. All of them tag their events with the spawn's
//! generation; events from a replaced process are ignored.

use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::Config;
use crate::core::env::{EnvBuilder, SessionIdentity};
use crate::core::input::{InputError, InputWriter};
use crate::core::pty::{
    ExitInfo, PtyBackend, PtyChild, PtyError, PtyHandles, SpawnSpec, DEFAULT_SIGNAL,
    FORCE_SIGNAL,
};
use crate::core::scrollback::Scrollback;
use crate::core::session::{
    PaneEvent, PaneId, Process, Session, SessionInfo, SessionInit, SessionStatus,
};
use crate::core::shell::ShellResolver;
use crate::error::{Result, SessionError};
use crate::history::{HistoryKey, HistoryReader, HistoryWriter, SessionMeta};
use crate::mux::request::{AttachResult, CreateRequest};

const COMMAND_CAPACITY: usize = 1024;
const READ_BUFFER_SIZE: usize = 8192;

pub(crate) type Reply<T> = oneshot::Sender<T>;

pub(crate) enum Command {
    CreateOrAttach {
        request: CreateRequest,
        reply: Reply<Result<AttachResult>>,
    },
    /// Recovery and cwd for a pending creation are resolved
    Prepared {
        request: CreateRequest,
        prepared: Prepared,
    },
    /// A spawn on the blocking pool finished
    Spawned {
        pane_id: PaneId,
        generation: u64,
        shell: String,
        size: (u16, u16),
        result: std::result::Result<PtyHandles, PtyError>,
    },
    Write {
        pane_id: PaneId,
        data: Vec<u8>,
        reply: Reply<Result<()>>,
    },
    Resize {
        pane_id: PaneId,
        cols: u16,
        rows: u16,
    },
    Signal {
        pane_id: PaneId,
        signal: String,
    },
    Kill {
        pane_id: PaneId,
        delete_history: bool,
        reply: Reply<KillStart>,
    },
    Detach {
        pane_id: PaneId,
    },
    ClearScrollback {
        pane_id: PaneId,
    },
    GetSession {
        pane_id: PaneId,
        reply: Reply<Option<SessionInfo>>,
    },
    ListSessions {
        reply: Reply<Vec<SessionInfo>>,
    },
    Subscribe {
        pane_id: PaneId,
        reply: Reply<Option<broadcast::Receiver<PaneEvent>>>,
    },
    DeleteHistory {
        workspace_id: String,
        pane_id: PaneId,
        reply: Reply<Result<()>>,
    },
    /// Alive panes of a workspace
    WorkspaceSessions {
        workspace_id: String,
        reply: Reply<Vec<PaneId>>,
    },
    /// Drop a session whose process would not die
    ForceClear {
        pane_id: PaneId,
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },

    Output {
        pane_id: PaneId,
        generation: u64,
        data: Vec<u8>,
    },
    ReaderClosed {
        pane_id: PaneId,
        generation: u64,
    },
    Exited {
        pane_id: PaneId,
        generation: u64,
        exit: ExitInfo,
    },
    /// Reader did not reach EOF in time after the exit
    DrainTimeout {
        pane_id: PaneId,
        generation: u64,
    },
    /// Grace window of a dead session is over
    Expire {
        pane_id: PaneId,
        generation: u64,
    },
}

/// First step of a kill, answered by the controller
pub(crate) enum KillStart {
    NotFound,
    /// Already dead; removed right away
    Removed,
    /// Terminate signal sent; watch for the exit
    Signaled(watch::Receiver<SessionStatus>),
}

/// Everything a new session needs that had to be read off-task
pub(crate) struct Prepared {
    seed: Vec<u8>,
    cwd: PathBuf,
    cols: Option<u16>,
    rows: Option<u16>,
}

/// Where a new session's scrollback comes from
enum Recovery {
    /// A recently dead session still in the registry
    Memory {
        seed: Vec<u8>,
        cwd: PathBuf,
        cols: u16,
        rows: u16,
    },
    Disk(HistoryReader),
}

/// Start the controller task and return its command channel
pub(crate) fn spawn(config: Config, backend: Arc<dyn PtyBackend>) -> mpsc::Sender<Command> {
    let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
    let controller = Controller::new(config, backend, tx.downgrade());
    tokio::spawn(controller.run(rx));
    tx
}

struct Controller {
    config: Config,
    backend: Arc<dyn PtyBackend>,
    env: EnvBuilder,
    shells: ShellResolver,
    history_root: PathBuf,
    sessions: HashMap<PaneId, Session>,
    /// Callers waiting on an in-flight creation
    pending: HashMap<PaneId, Vec<Reply<Result<AttachResult>>>>,
    /// History writers of removed sessions, possibly still flushing
    retired: HashMap<PaneId, HistoryWriter>,
    next_generation: u64,
    tx: mpsc::WeakSender<Command>,
}

impl Controller {
    fn new(config: Config, backend: Arc<dyn PtyBackend>, tx: mpsc::WeakSender<Command>) -> Self {
        Self {
            env: EnvBuilder::from_config(&config),
            shells: ShellResolver::from_config(&config),
            history_root: config.history_root(),
            config,
            backend,
            sessions: HashMap::new(),
            pending: HashMap::new(),
            retired: HashMap::new(),
            next_generation: 0,
            tx,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        tracing::debug!("Session controller started (history in {:?})", self.history_root);
        while let Some(command) = rx.recv().await {
            if let Command::Shutdown { reply } = command {
                self.shutdown().await;
                let _ = reply.send(());
                break;
            }
            self.handle(command);
        }
        tracing::debug!("Session controller stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::CreateOrAttach { request, reply } => self.create_or_attach(request, reply),
            Command::Prepared { request, prepared } => self.finish_create(request, prepared),
            Command::Spawned {
                pane_id,
                generation,
                shell,
                size,
                result,
            } => self.spawned(&pane_id, generation, shell, size, result),
            Command::Write {
                pane_id,
                data,
                reply,
            } => {
                let _ = reply.send(self.write(&pane_id, &data));
            }
            Command::Resize {
                pane_id,
                cols,
                rows,
            } => self.resize(&pane_id, cols, rows),
            Command::Signal { pane_id, signal } => self.signal(&pane_id, &signal),
            Command::Kill {
                pane_id,
                delete_history,
                reply,
            } => {
                let _ = reply.send(self.kill(&pane_id, delete_history));
            }
            Command::Detach { pane_id } => match self.sessions.get_mut(&pane_id) {
                Some(session) => {
                    session.touch();
                    tracing::debug!("[{}] Detached", pane_id);
                }
                None => tracing::debug!("[{}] Detach for unknown session", pane_id),
            },
            Command::ClearScrollback { pane_id } => match self.sessions.get_mut(&pane_id) {
                Some(session) => session.clear_scrollback(),
                None => tracing::warn!("[{}] Clear scrollback for unknown session", pane_id),
            },
            Command::GetSession { pane_id, reply } => {
                let _ = reply.send(self.sessions.get(&pane_id).map(Session::info));
            }
            Command::ListSessions { reply } => {
                let _ = reply.send(self.sessions.values().map(Session::info).collect());
            }
            Command::Subscribe { pane_id, reply } => {
                let _ = reply.send(self.sessions.get(&pane_id).map(Session::subscribe));
            }
            Command::DeleteHistory {
                workspace_id,
                pane_id,
                reply,
            } => self.delete_history(&workspace_id, &pane_id, reply),
            Command::WorkspaceSessions {
                workspace_id,
                reply,
            } => {
                let panes = self
                    .sessions
                    .values()
                    .filter(|s| s.is_alive() && s.identity.workspace_id == workspace_id)
                    .map(|s| s.pane_id().to_string())
                    .collect();
                let _ = reply.send(panes);
            }
            Command::ForceClear { pane_id, reply } => {
                self.force_clear(&pane_id);
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                // handled in run()
                let _ = reply.send(());
            }
            Command::Output {
                pane_id,
                generation,
                data,
            } => {
                if let Some(session) = self.live(&pane_id, generation) {
                    session.handle_output(&data);
                }
            }
            Command::ReaderClosed {
                pane_id,
                generation,
            } => {
                let drained = self
                    .live(&pane_id, generation)
                    .is_some_and(|s| s.record_reader_closed());
                if drained {
                    self.finalize_exit(&pane_id);
                }
            }
            Command::Exited {
                pane_id,
                generation,
                exit,
            } => {
                tracing::debug!("[{}] Process exited with {:?}", pane_id, exit);
                let Some(session) = self.live(&pane_id, generation) else {
                    return;
                };
                if session.record_exit(exit) {
                    self.finalize_exit(&pane_id);
                } else {
                    let delay = self.config.timing.exit_drain();
                    self.schedule(delay, Command::DrainTimeout {
                        pane_id,
                        generation,
                    });
                }
            }
            Command::DrainTimeout {
                pane_id,
                generation,
            } => {
                if self.live(&pane_id, generation).is_some() {
                    tracing::debug!("[{}] Output did not drain; finalizing exit", pane_id);
                    self.finalize_exit(&pane_id);
                }
            }
            Command::Expire {
                pane_id,
                generation,
            } => {
                let expired = self
                    .sessions
                    .get(&pane_id)
                    .is_some_and(|s| !s.is_alive() && s.generation() == generation);
                if expired {
                    if let Some(session) = self.sessions.remove(&pane_id) {
                        tracing::debug!("[{}] Grace window over; removed", pane_id);
                        self.retire(session);
                    }
                }
            }
        }
    }

    /// Alive session whose current process has this generation
    fn live(&mut self, pane_id: &str, generation: u64) -> Option<&mut Session> {
        self.sessions
            .get_mut(pane_id)
            .filter(|s| s.is_alive() && s.generation() == generation)
    }

    fn create_or_attach(&mut self, request: CreateRequest, reply: Reply<Result<AttachResult>>) {
        let pane_id = request.pane_id.clone();

        if let Some(waiters) = self.pending.get_mut(&pane_id) {
            tracing::debug!("[{}] Joining in-flight creation", pane_id);
            waiters.push(reply);
            return;
        }

        if let Some(session) = self.sessions.get_mut(&pane_id).filter(|s| s.is_alive()) {
            session.touch();
            if let (Some(cols), Some(rows)) = (request.cols, request.rows) {
                if (cols, rows) != (session.cols, session.rows) {
                    if let Err(e) = session.resize(cols, rows) {
                        tracing::warn!("[{}] Resize on attach failed: {}", pane_id, e);
                    }
                }
            }
            let _ = reply.send(Ok(AttachResult {
                is_new: false,
                scrollback: session.scrollback().to_string_lossy(),
                was_recovered: session.was_recovered,
                events: session.subscribe(),
            }));
            return;
        }

        let Some(tx) = self.tx.upgrade() else {
            let _ = reply.send(Err(SessionError::ManagerClosed));
            return;
        };
        self.pending.insert(pane_id.clone(), vec![reply]);

        // A recently dead session is fresher than anything on disk
        let (recovery, previous) = match self.sessions.remove(&pane_id) {
            Some(mut dead) => (
                Recovery::Memory {
                    seed: dead.scrollback().as_bytes().to_vec(),
                    cwd: dead.cwd.clone(),
                    cols: dead.cols,
                    rows: dead.rows,
                },
                dead.take_history(),
            ),
            None => (
                Recovery::Disk(HistoryReader::new(
                    &self.history_root,
                    &HistoryKey::new(&request.workspace_id, &pane_id),
                    self.config.scrollback.max_bytes,
                )),
                self.retired.remove(&pane_id),
            ),
        };
        tokio::spawn(async move {
            let prepared = prepare(&request, recovery, previous).await;
            let _ = tx.send(Command::Prepared { request, prepared }).await;
        });
    }

    fn finish_create(&mut self, request: CreateRequest, prepared: Prepared) {
        let pane_id = request.pane_id.clone();
        if let Err(e) = self.start_session(request, prepared) {
            tracing::error!("[{}] Failed to create session: {}", pane_id, e);
            self.reject_pending(&pane_id, e);
        }
    }

    /// Creation finished: every waiter attaches to the new session
    fn answer_pending(&mut self, pane_id: &str) {
        let waiters = self.pending.remove(pane_id).unwrap_or_default();
        let Some(session) = self.sessions.get(pane_id) else {
            return;
        };
        let scrollback = session.scrollback().to_string_lossy();
        for reply in waiters {
            let _ = reply.send(Ok(AttachResult {
                is_new: true,
                scrollback: scrollback.clone(),
                was_recovered: session.was_recovered,
                events: session.subscribe(),
            }));
        }
    }

    fn reject_pending(&mut self, pane_id: &str, error: SessionError) {
        let waiters = self.pending.remove(pane_id).unwrap_or_default();
        // SessionError is not Clone; later waiters get a copy of the message
        let shell = match &error {
            SessionError::ShellLaunch { shell, .. } => shell.clone(),
            _ => String::new(),
        };
        let message = error.to_string();
        let mut first = Some(error);
        for reply in waiters {
            let error = first.take().unwrap_or_else(|| SessionError::ShellLaunch {
                shell: shell.clone(),
                source: PtyError::Open(anyhow::anyhow!("{}", message)),
            });
            let _ = reply.send(Err(error));
        }
    }

    /// Register the session and start spawning its primary shell
    fn start_session(&mut self, request: CreateRequest, prepared: Prepared) -> Result<()> {
        let cols = prepared
            .cols
            .unwrap_or(self.config.terminal.default_cols)
            .max(1);
        let rows = prepared
            .rows
            .unwrap_or(self.config.terminal.default_rows)
            .max(1);
        let primary = self.shells.default_shell();
        let fallback = Some(self.shells.fallback_shell()).filter(|f| *f != primary);

        let pane_id = request.pane_id.clone();
        let was_recovered = !prepared.seed.is_empty();
        let scrollback = Scrollback::with_seed(self.config.scrollback.max_bytes, &prepared.seed);
        let history = HistoryWriter::init(
            &self.history_root,
            &HistoryKey::new(&request.workspace_id, &pane_id),
            SessionMeta::new(prepared.cwd.clone(), cols, rows, &primary),
            scrollback.as_bytes().to_vec(),
            None,
        );

        let session = Session::new(SessionInit {
            identity: SessionIdentity {
                pane_id: pane_id.clone(),
                tab_id: request.tab_id,
                workspace_id: request.workspace_id,
                workspace_name: request.workspace_name,
                root_path: request.root_path,
            },
            cwd: prepared.cwd,
            cols,
            rows,
            scrollback,
            was_recovered,
            fallback_shell: fallback,
            initial_commands: request.initial_commands,
            history,
            batch_interval: self.config.timing.batch_interval(),
        });

        if was_recovered {
            tracing::info!("[{}] Session restored with recovered scrollback", pane_id);
        }
        self.sessions.insert(pane_id.clone(), session);
        if let Err(e) = self.launch(&pane_id, &primary) {
            if let Some(session) = self.sessions.remove(&pane_id) {
                self.abandon(session);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Drop a session that never got a process, keeping its history
    fn abandon(&mut self, mut session: Session) {
        session.mark_dead(ExitInfo::code(-1));
        self.retire(session);
    }

    /// Spawn `shell` for a registered session on the blocking pool
    fn launch(&mut self, pane_id: &str, shell: &str) -> Result<()> {
        let tx = self.tx.upgrade().ok_or(SessionError::ManagerClosed)?;
        let session = self
            .sessions
            .get_mut(pane_id)
            .ok_or_else(|| SessionError::NotFound(pane_id.to_string()))?;

        self.next_generation += 1;
        let generation = self.next_generation;
        session.begin_launch(generation);

        let launch = self.env.build(shell, &session.identity, std::env::vars_os());
        let spec = SpawnSpec {
            program: launch.program,
            args: launch.args,
            cwd: session.cwd.clone(),
            env: launch.env,
            cols: session.cols,
            rows: session.rows,
        };
        tracing::debug!("[{}] Spawning {} {:?}", pane_id, shell, spec.args);

        let backend = Arc::clone(&self.backend);
        let pane_id = pane_id.to_string();
        let shell = shell.to_string();
        tokio::task::spawn_blocking(move || {
            let result = backend.spawn(&spec);
            let spawned = Command::Spawned {
                pane_id,
                generation,
                shell,
                size: (spec.cols, spec.rows),
                result,
            };
            if let Err(mpsc::error::SendError(Command::Spawned {
                result: Ok(handles),
                ..
            })) = tx.blocking_send(spawned)
            {
                discard(handles);
            }
        });
        Ok(())
    }

    fn spawned(
        &mut self,
        pane_id: &str,
        generation: u64,
        shell: String,
        size: (u16, u16),
        result: std::result::Result<PtyHandles, PtyError>,
    ) {
        let current = self
            .sessions
            .get(pane_id)
            .is_some_and(|s| s.is_alive() && s.generation() == generation);
        if !current {
            if let Ok(handles) = result {
                tracing::debug!("[{}] Session gone before {} started; killing it", pane_id, shell);
                discard(handles);
            }
            return;
        }

        let installed = result
            .map_err(|source| SessionError::ShellLaunch {
                shell: shell.clone(),
                source,
            })
            .and_then(|handles| self.install(pane_id, generation, &shell, size, handles));
        match installed {
            Ok(()) => self.answer_pending(pane_id),
            Err(e) => self.launch_failed(pane_id, e),
        }
    }

    /// Wire a spawned process into its session
    fn install(
        &mut self,
        pane_id: &str,
        generation: u64,
        shell: &str,
        size: (u16, u16),
        handles: PtyHandles,
    ) -> Result<()> {
        let Some(tx) = self.tx.upgrade() else {
            discard(handles);
            return Err(SessionError::ManagerClosed);
        };
        let PtyHandles {
            mut control,
            reader,
            writer,
            child,
        } = handles;
        let launch_error = |source: PtyError| SessionError::ShellLaunch {
            shell: shell.to_string(),
            source,
        };

        let started = spawn_reader(pane_id, generation, reader, tx.clone())
            .and_then(|()| spawn_waiter(pane_id, generation, child, tx))
            .and_then(|()| InputWriter::spawn(pane_id, writer, self.config.input));
        let input = match started {
            Ok(input) => input,
            Err(e) => {
                let _ = control.signal(FORCE_SIGNAL);
                return Err(launch_error(PtyError::Io(e)));
            }
        };

        let session = self
            .sessions
            .get_mut(pane_id)
            .ok_or_else(|| SessionError::NotFound(pane_id.to_string()))?;
        tracing::info!("[{}] Spawned {} (pid {:?})", pane_id, shell, control.pid());
        session.attach_process(Process {
            generation,
            shell: shell.to_string(),
            control,
            input,
        });

        // Resized or killed while the spawn was in flight
        if (session.cols, session.rows) != size {
            let (cols, rows) = (session.cols, session.rows);
            if let Err(e) = session.resize(cols, rows) {
                tracing::warn!("[{}] {}", pane_id, e);
            }
        }
        if session.kill_requested {
            if let Err(e) = session.signal(DEFAULT_SIGNAL) {
                tracing::warn!("[{}] {} after spawn failed: {}", pane_id, DEFAULT_SIGNAL, e);
            }
        }
        Ok(())
    }

    /// A spawn failed: try the fallback shell once, else give up on the session
    fn launch_failed(&mut self, pane_id: &str, mut error: SessionError) {
        let fallback = self
            .sessions
            .get_mut(pane_id)
            .and_then(|s| s.consume_fallback());
        if let Some(fallback) = fallback {
            tracing::warn!("[{}] {}; trying fallback shell {}", pane_id, error, fallback);
            match self.launch(pane_id, &fallback) {
                Ok(()) => return,
                Err(e) => error = e,
            }
        }

        tracing::error!("[{}] Failed to launch shell: {}", pane_id, error);
        if let Some(session) = self.sessions.remove(pane_id) {
            self.abandon(session);
        }
        self.reject_pending(pane_id, error);
    }

    /// Exit and reader EOF have both been seen (or the drain timed out)
    fn finalize_exit(&mut self, pane_id: &str) {
        let Some(mut session) = self.sessions.remove(pane_id) else {
            return;
        };
        let Some(exit) = session.take_pending_exit() else {
            self.sessions.insert(pane_id.to_string(), session);
            return;
        };
        session.flush_on_exit();

        if let Some(fallback) = session.take_retry(&exit, self.config.timing.crash_threshold()) {
            tracing::warn!(
                "[{}] {} exited with {} right after launch; retrying with {}",
                pane_id,
                session.shell,
                exit.exit_code,
                fallback
            );
            self.sessions.insert(pane_id.to_string(), session);
            if let Err(e) = self.launch(pane_id, &fallback) {
                self.launch_failed(pane_id, e);
            }
            return;
        }

        tracing::info!(
            "[{}] Session exited with code {}{}",
            pane_id,
            exit.exit_code,
            exit.signal
                .as_deref()
                .map(|s| format!(" ({})", s))
                .unwrap_or_default()
        );
        session.mark_dead(exit);

        if session.delete_history_on_exit {
            self.retire(session);
        } else {
            let generation = session.generation();
            self.sessions.insert(pane_id.to_string(), session);
            self.schedule(self.config.timing.exit_grace(), Command::Expire {
                pane_id: pane_id.to_string(),
                generation,
            });
        }
    }

    fn write(&mut self, pane_id: &str, data: &[u8]) -> Result<()> {
        let session = self
            .sessions
            .get_mut(pane_id)
            .ok_or_else(|| SessionError::NotFound(pane_id.to_string()))?;
        if !session.is_alive() {
            return Err(SessionError::NotAlive(pane_id.to_string()));
        }
        session.write_input(data).map_err(|e| match e {
            InputError::QueueFull => SessionError::InputQueueFull(pane_id.to_string()),
            InputError::Closed => SessionError::NotAlive(pane_id.to_string()),
        })?;
        session.touch();
        Ok(())
    }

    fn resize(&mut self, pane_id: &str, cols: u16, rows: u16) {
        let Some(session) = self.sessions.get_mut(pane_id).filter(|s| s.is_alive()) else {
            tracing::warn!("[{}] Resize for missing or dead session", pane_id);
            return;
        };
        if let Err(e) = session.resize(cols.max(1), rows.max(1)) {
            tracing::warn!("[{}] {}", pane_id, e);
        }
    }

    fn signal(&mut self, pane_id: &str, signal: &str) {
        let Some(session) = self.sessions.get_mut(pane_id).filter(|s| s.is_alive()) else {
            tracing::warn!("[{}] Signal {} for missing or dead session", pane_id, signal);
            return;
        };
        if let Err(source) = session.signal(signal) {
            let e = SessionError::SignalDelivery {
                pane_id: pane_id.to_string(),
                signal: signal.to_string(),
                source,
            };
            tracing::warn!("{}", e);
        }
    }

    fn kill(&mut self, pane_id: &str, delete_history: bool) -> KillStart {
        let Some(session) = self.sessions.get_mut(pane_id) else {
            return KillStart::NotFound;
        };

        if !session.is_alive() {
            if delete_history {
                session.delete_history();
            }
            if let Some(session) = self.sessions.remove(pane_id) {
                self.retire(session);
            }
            return KillStart::Removed;
        }

        session.kill_requested = true;
        session.delete_history_on_exit |= delete_history;
        let status = session.watch_status();
        self.signal(pane_id, DEFAULT_SIGNAL);
        KillStart::Signaled(status)
    }

    fn force_clear(&mut self, pane_id: &str) {
        let Some(mut session) = self.sessions.remove(pane_id) else {
            return;
        };
        if session.is_alive() {
            session.flush_on_exit();
            session.mark_dead(ExitInfo {
                exit_code: -1,
                signal: Some(FORCE_SIGNAL.to_string()),
            });
        }
        self.retire(session);
    }

    fn delete_history(&mut self, workspace_id: &str, pane_id: &str, reply: Reply<Result<()>>) {
        if let Some(session) = self
            .sessions
            .get_mut(pane_id)
            .filter(|s| s.identity.workspace_id == workspace_id)
        {
            if session.is_alive() {
                tracing::debug!("[{}] History will be deleted on exit", pane_id);
                session.delete_history_on_exit = true;
            } else {
                session.delete_history();
                if let Some(session) = self.sessions.remove(pane_id) {
                    self.retire(session);
                }
            }
            let _ = reply.send(Ok(()));
            return;
        }
        if self.pending.contains_key(pane_id) {
            tracing::warn!("[{}] Creation in flight; history kept", pane_id);
            let _ = reply.send(Ok(()));
            return;
        }

        let previous = self.retired.remove(pane_id);
        let reader = HistoryReader::new(
            &self.history_root,
            &HistoryKey::new(workspace_id, pane_id),
            0,
        );
        let pane_id = pane_id.to_string();
        tokio::spawn(async move {
            if let Some(previous) = previous {
                previous.finished().await;
            }
            let result = reader
                .cleanup()
                .await
                .map_err(|source| SessionError::HistoryIo { pane_id, source });
            let _ = reply.send(result);
        });
    }

    /// Drop a session, keeping its history writer until it has flushed
    fn retire(&mut self, mut session: Session) {
        let pane_id = session.pane_id().to_string();
        if let Some(mut history) = session.take_history() {
            history.retire();
            self.retired.retain(|_, writer| !writer.is_finished());
            self.retired.insert(pane_id, history);
        }
    }

    fn schedule(&self, delay: Duration, command: Command) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(command).await;
        });
    }

    async fn shutdown(&mut self) {
        tracing::info!("Shutting down {} session(s)", self.sessions.len());
        for (_, waiters) in self.pending.drain() {
            for reply in waiters {
                let _ = reply.send(Err(SessionError::ManagerClosed));
            }
        }

        let mut writers = Vec::new();
        for (pane_id, mut session) in self.sessions.drain() {
            if session.is_alive() {
                if let Err(e) = session.signal(FORCE_SIGNAL) {
                    tracing::debug!("[{}] {} at shutdown failed: {}", pane_id, FORCE_SIGNAL, e);
                }
                session.flush_on_exit();
                session.mark_dead(ExitInfo {
                    exit_code: -1,
                    signal: Some(FORCE_SIGNAL.to_string()),
                });
            }
            writers.extend(session.take_history());
        }
        writers.extend(self.retired.drain().map(|(_, writer)| writer));

        for writer in writers {
            writer.finished().await;
        }
    }
}

/// Wait for the pane's previous history writer, then collect the seed and
/// geometry hints and settle on a working directory
async fn prepare(
    request: &CreateRequest,
    recovery: Recovery,
    previous: Option<HistoryWriter>,
) -> Prepared {
    if let Some(previous) = previous {
        previous.finished().await;
    }

    let (seed, cwd_hint, size_hint) = match recovery {
        Recovery::Memory {
            seed,
            cwd,
            cols,
            rows,
        } => (seed, Some(cwd), Some((cols, rows))),
        Recovery::Disk(reader) => match reader.read().await {
            Ok(recovered) => {
                if recovered.was_ungraceful() {
                    tracing::info!(
                        "[{}] Previous session did not shut down cleanly; recovering its output",
                        request.pane_id
                    );
                }
                match recovered.meta {
                    Some(meta) => (
                        recovered.scrollback,
                        Some(meta.cwd),
                        Some((meta.cols, meta.rows)),
                    ),
                    None => (recovered.scrollback, None, None),
                }
            }
            Err(source) => {
                let e = SessionError::HistoryIo {
                    pane_id: request.pane_id.clone(),
                    source,
                };
                tracing::warn!("{}; starting with empty scrollback", e);
                (Vec::new(), None, None)
            }
        },
    };

    let candidates = [request.cwd.clone(), cwd_hint, request.root_path.clone()];
    Prepared {
        seed,
        cwd: resolve_cwd(candidates.into_iter().flatten()).await,
        cols: request.cols.or(size_hint.map(|(cols, _)| cols)),
        rows: request.rows.or(size_hint.map(|(_, rows)| rows)),
    }
}

/// First existing directory among `candidates`, else home, else the temp dir
async fn resolve_cwd(candidates: impl IntoIterator<Item = PathBuf>) -> PathBuf {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from);
    for dir in candidates.into_iter().chain(home) {
        if is_dir(&dir).await {
            return dir;
        }
    }
    std::env::temp_dir()
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_dir())
}

/// Kill a process nobody will own and reap it in the background
fn discard(handles: PtyHandles) {
    let PtyHandles {
        mut control,
        mut child,
        ..
    } = handles;
    if let Err(e) = control.signal(FORCE_SIGNAL) {
        tracing::debug!("Failed to kill orphaned process: {}", e);
    }
    let _ = thread::Builder::new()
        .name("pty-reap".to_string())
        .spawn(move || {
            let _ = child.wait();
        });
}

fn spawn_reader(
    pane_id: &str,
    generation: u64,
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Command>,
) -> std::io::Result<()> {
    let pane_id = pane_id.to_string();
    thread::Builder::new()
        .name(format!("pty-reader-{}", pane_id))
        .spawn(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let output = Command::Output {
                            pane_id: pane_id.clone(),
                            generation,
                            data: buf[..n].to_vec(),
                        };
                        if tx.blocking_send(output).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO once the child side is gone
                        tracing::debug!("[{}] PTY read ended: {}", pane_id, e);
                        break;
                    }
                }
            }
            let _ = tx.blocking_send(Command::ReaderClosed {
                pane_id,
                generation,
            });
        })?;
    Ok(())
}

fn spawn_waiter(
    pane_id: &str,
    generation: u64,
    mut child: Box<dyn PtyChild>,
    tx: mpsc::Sender<Command>,
) -> std::io::Result<()> {
    let pane_id = pane_id.to_string();
    thread::Builder::new()
        .name(format!("pty-wait-{}", pane_id))
        .spawn(move || {
            let exit = child.wait();
            let _ = tx.blocking_send(Command::Exited {
                pane_id,
                generation,
                exit,
            });
        })?;
    Ok(())
}
