//! Session management
//!
//! One [`Session`] per pane: the running process, its filtered scrollback,
//! the per-session output pipeline and the launch state machine. Sessions
//! are owned and mutated only by the controller task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{broadcast, watch};

use super::batcher::DataBatcher;
use super::env::SessionIdentity;
use super::filter::EscapeFilter;
use super::input::{InputError, InputWriter};
use super::pty::{ExitInfo, PtyControl, PtyError};
use super::scrollback::Scrollback;
use crate::history::HistoryWriter;

/// Pane identifier, unique per live session
pub type PaneId = String;

/// Buffered events per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 1024;

/// Writes held while a process is being spawned
const MAX_EARLY_INPUT: usize = 256;

/// Launch state machine
///
/// `Launching -> Running` on first output, `-> CrashRetry` when the first
/// process dies early and the fallback shell is started, `-> Dead` on a final
/// exit. The fallback shell is an `Option` taken on retry, so a session can
/// retry at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPhase {
    Launching,
    Running,
    CrashRetry,
    Dead,
}

/// Events delivered to pane subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaneEvent {
    /// Raw, unfiltered output batch
    Data(Vec<u8>),
    /// Final exit of the session's process
    Exit {
        exit_code: i32,
        signal: Option<String>,
    },
}

/// Liveness published for kill escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Alive,
    Exited { exit_code: i32 },
}

/// Snapshot of a session for callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub pane_id: PaneId,
    pub tab_id: String,
    pub workspace_id: String,
    pub is_alive: bool,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub shell: String,
    pub used_fallback: bool,
    pub was_recovered: bool,
    pub pid: Option<u32>,
    pub last_active: SystemTime,
}

/// Static parts a session is created from
pub struct SessionInit {
    pub identity: SessionIdentity,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub scrollback: Scrollback,
    pub was_recovered: bool,
    pub fallback_shell: Option<String>,
    pub initial_commands: Vec<String>,
    pub history: HistoryWriter,
    pub batch_interval: Duration,
}

/// Process handles of one spawn
pub struct Process {
    pub generation: u64,
    pub shell: String,
    pub control: Box<dyn PtyControl>,
    pub input: InputWriter,
}

pub struct Session {
    pub identity: SessionIdentity,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    /// Shell of the current (or last) process
    pub shell: String,
    pub start_time: Instant,
    pub last_active: SystemTime,
    pub used_fallback: bool,
    pub was_recovered: bool,
    pub delete_history_on_exit: bool,
    /// Set by an explicit kill; an exit after this is never a crash
    pub kill_requested: bool,
    phase: LaunchPhase,
    fallback: Option<String>,
    generation: u64,
    pid: Option<u32>,
    control: Option<Box<dyn PtyControl>>,
    input: Option<InputWriter>,
    scrollback: Scrollback,
    filter: EscapeFilter,
    batcher: DataBatcher,
    history: Option<HistoryWriter>,
    events: broadcast::Sender<PaneEvent>,
    status: watch::Sender<SessionStatus>,
    /// Joined initial commands, sent on first output
    pending_initial: Option<String>,
    /// Exit seen, waiting for the reader to drain
    pending_exit: Option<ExitInfo>,
    reader_done: bool,
    /// Input that arrived before the process was up
    early_input: Vec<Vec<u8>>,
}

impl Session {
    /// Create a session that has not started a process yet
    pub fn new(init: SessionInit) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status, _) = watch::channel(SessionStatus::Alive);

        let sink_events = events.clone();
        let batcher = DataBatcher::new(
            init.batch_interval,
            Arc::new(move |batch| {
                // No subscribers is fine
                let _ = sink_events.send(PaneEvent::Data(batch));
            }),
        );

        let commands: Vec<_> = init
            .initial_commands
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect();
        let pending_initial = if init.was_recovered || commands.is_empty() {
            None
        } else {
            Some(format!("{}\n", commands.join(" && ")))
        };

        Self {
            identity: init.identity,
            cwd: init.cwd,
            cols: init.cols,
            rows: init.rows,
            shell: String::new(),
            start_time: Instant::now(),
            last_active: SystemTime::now(),
            used_fallback: false,
            was_recovered: init.was_recovered,
            delete_history_on_exit: false,
            kill_requested: false,
            phase: LaunchPhase::Launching,
            fallback: init.fallback_shell,
            generation: 0,
            pid: None,
            control: None,
            input: None,
            scrollback: init.scrollback,
            filter: EscapeFilter::new(),
            batcher,
            history: Some(init.history),
            events,
            status,
            pending_initial,
            pending_exit: None,
            reader_done: false,
            early_input: Vec::new(),
        }
    }

    pub fn pane_id(&self) -> &str {
        &self.identity.pane_id
    }

    pub fn phase(&self) -> LaunchPhase {
        self.phase
    }

    pub fn is_alive(&self) -> bool {
        self.phase != LaunchPhase::Dead
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn touch(&mut self) {
        self.last_active = SystemTime::now();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PaneEvent> {
        self.events.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn scrollback(&self) -> &Scrollback {
        &self.scrollback
    }

    /// A spawn is in flight; events from older processes are ignored from
    /// here on
    pub fn begin_launch(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Spawned but the process is not installed yet
    pub fn is_launching(&self) -> bool {
        self.input.is_none()
            && matches!(self.phase, LaunchPhase::Launching | LaunchPhase::CrashRetry)
    }

    /// Install a freshly spawned process
    pub fn attach_process(&mut self, process: Process) {
        self.generation = process.generation;
        self.shell = process.shell;
        self.pid = process.control.pid();
        self.control = Some(process.control);
        self.input = Some(process.input);
        self.start_time = Instant::now();
        self.pending_exit = None;
        self.reader_done = false;
        if self.phase == LaunchPhase::Dead {
            self.phase = LaunchPhase::Launching;
        }
        let _ = self.status.send(SessionStatus::Alive);

        for data in std::mem::take(&mut self.early_input) {
            if let Err(e) = self.write_input(&data) {
                tracing::warn!("[{}] Dropped early input: {}", self.pane_id(), e);
            }
        }
    }

    /// Filter -> scrollback + history, raw -> batcher
    pub fn handle_output(&mut self, data: &[u8]) {
        let out = self.filter.filter(data);
        if out.clear_scrollback {
            self.clear_persisted();
        }
        self.persist(&out.data);
        self.batcher.write(data);

        if matches!(self.phase, LaunchPhase::Launching | LaunchPhase::CrashRetry) {
            self.phase = LaunchPhase::Running;
        }
        if let Some(commands) = self.pending_initial.take() {
            tracing::debug!("[{}] Running initial commands", self.pane_id());
            if let Err(e) = self.write_input(commands.as_bytes()) {
                tracing::warn!("[{}] Failed to send initial commands: {}", self.pane_id(), e);
            }
        }
    }

    fn persist(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.scrollback.push(data);
        if let Some(history) = &self.history {
            history.write(data);
        }
    }

    fn clear_persisted(&mut self) {
        self.scrollback.clear();
        if let Some(history) = &self.history {
            history.truncate();
        }
    }

    /// Explicit clear: also forgets any held-back escape bytes
    pub fn clear_scrollback(&mut self) {
        self.filter.reset();
        self.clear_persisted();
    }

    pub fn write_input(&mut self, data: &[u8]) -> Result<(), InputError> {
        if let Some(input) = &self.input {
            return input.write(data);
        }
        if !self.is_launching() {
            return Err(InputError::Closed);
        }
        if self.early_input.len() >= MAX_EARLY_INPUT {
            return Err(InputError::QueueFull);
        }
        self.early_input.push(data.to_vec());
        Ok(())
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.cols = cols;
        self.rows = rows;
        if let Some(history) = &self.history {
            history.resize(cols, rows);
        }
        match &mut self.control {
            Some(control) => control.resize(cols, rows),
            None => Ok(()),
        }
    }

    pub fn signal(&mut self, signal: &str) -> Result<(), PtyError> {
        match &mut self.control {
            Some(control) => control.signal(signal),
            None => Err(PtyError::NoPid),
        }
    }

    /// Record the child's exit; true once output has drained too
    pub fn record_exit(&mut self, exit: ExitInfo) -> bool {
        self.pending_exit = Some(exit);
        self.reader_done
    }

    /// Record reader EOF; true if the exit was already seen
    pub fn record_reader_closed(&mut self) -> bool {
        self.reader_done = true;
        self.pending_exit.is_some()
    }

    pub fn take_pending_exit(&mut self) -> Option<ExitInfo> {
        self.pending_exit.take()
    }

    /// Push trailing filter bytes to history and the last batch to subscribers
    pub fn flush_on_exit(&mut self) {
        let tail = self.filter.flush();
        self.persist(&tail);
        self.batcher.flush();
    }

    /// Fallback shell to retry with, if this exit counts as a launch failure.
    ///
    /// Consumes the retry budget.
    pub fn take_retry(&mut self, exit: &ExitInfo, crash_threshold: Duration) -> Option<String> {
        let crashed = !self.kill_requested
            && exit.exit_code != 0
            && self.start_time.elapsed() < crash_threshold;
        if !crashed {
            return None;
        }
        let fallback = self.fallback.take()?;
        self.release_process();
        self.phase = LaunchPhase::CrashRetry;
        self.used_fallback = true;
        Some(fallback)
    }

    /// Give up the retry budget (the fallback was used directly)
    pub fn consume_fallback(&mut self) -> Option<String> {
        let fallback = self.fallback.take()?;
        self.used_fallback = true;
        Some(fallback)
    }

    fn release_process(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.dispose();
        }
        self.control = None;
        self.pid = None;
    }

    /// Final exit: finalize history, notify subscribers
    pub fn mark_dead(&mut self, exit: ExitInfo) {
        if self.phase == LaunchPhase::Dead {
            return;
        }
        self.phase = LaunchPhase::Dead;
        self.release_process();
        self.early_input.clear();
        self.batcher.dispose();
        self.pending_initial = None;

        if let Some(history) = &mut self.history {
            if self.delete_history_on_exit {
                history.close_and_delete();
            } else {
                history.close(Some(exit.exit_code));
            }
        }

        let _ = self.status.send(SessionStatus::Exited {
            exit_code: exit.exit_code,
        });
        let _ = self.events.send(PaneEvent::Exit {
            exit_code: exit.exit_code,
            signal: exit.signal,
        });
    }

    /// Delete the history artifact of an already dead session
    pub fn delete_history(&mut self) {
        self.delete_history_on_exit = true;
        if let Some(history) = &mut self.history {
            history.close_and_delete();
        }
    }

    pub fn take_history(&mut self) -> Option<HistoryWriter> {
        self.history.take()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            pane_id: self.identity.pane_id.clone(),
            tab_id: self.identity.tab_id.clone(),
            workspace_id: self.identity.workspace_id.clone(),
            is_alive: self.is_alive(),
            cwd: self.cwd.clone(),
            cols: self.cols,
            rows: self.rows,
            shell: self.shell.clone(),
            used_fallback: self.used_fallback,
            was_recovered: self.was_recovered,
            pid: self.pid,
            last_active: self.last_active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fake_pty::{FakeBackend, FakeBehavior};
    use crate::core::pty::{PtyBackend, SpawnSpec};
    use crate::config::InputConfig;
    use crate::history::{HistoryKey, SessionMeta};
    use std::collections::BTreeMap;

    fn identity() -> SessionIdentity {
        SessionIdentity {
            pane_id: "p1".into(),
            tab_id: "t1".into(),
            workspace_id: "w1".into(),
            ..SessionIdentity::default()
        }
    }

    fn session(root: &std::path::Path, recovered: bool, commands: &[&str]) -> Session {
        let history = HistoryWriter::init(
            root,
            &HistoryKey::new("w1", "p1"),
            SessionMeta::new(root.to_path_buf(), 80, 24, "/bin/sh"),
            Vec::new(),
            None,
        );
        Session::new(SessionInit {
            identity: identity(),
            cwd: root.to_path_buf(),
            cols: 80,
            rows: 24,
            scrollback: Scrollback::new(1024),
            was_recovered: recovered,
            fallback_shell: Some("/bin/fallback".into()),
            initial_commands: commands.iter().map(|c| c.to_string()).collect(),
            history,
            batch_interval: Duration::from_millis(5),
        })
    }

    fn process(generation: u64, program: &str) -> Process {
        let handles = FakeBackend::new()
            .with_program("/bin/crash", FakeBehavior::ExitImmediately(1))
            .spawn(&SpawnSpec {
                program: program.to_string(),
                args: Vec::new(),
                cwd: std::env::temp_dir(),
                env: BTreeMap::new(),
                cols: 80,
                rows: 24,
            })
            .unwrap();
        Process {
            generation,
            shell: program.to_string(),
            control: handles.control,
            input: InputWriter::spawn("p1", handles.writer, InputConfig::default()).unwrap(),
        }
    }

    #[tokio::test]
    async fn output_is_filtered_for_scrollback_but_raw_for_subscribers() {
        let root = tempfile::tempdir().unwrap();
        let mut session = session(root.path(), false, &[]);
        session.attach_process(process(1, "/bin/sh"));
        let mut events = session.subscribe();

        session.handle_output(b"ok\x1b[12;1R");
        assert_eq!(session.phase(), LaunchPhase::Running);
        assert_eq!(session.scrollback().as_bytes(), b"ok");

        session.flush_on_exit();
        assert_eq!(
            events.recv().await.unwrap(),
            PaneEvent::Data(b"ok\x1b[12;1R".to_vec())
        );
    }

    #[tokio::test]
    async fn input_waits_for_the_process_while_launching() {
        let root = tempfile::tempdir().unwrap();
        let mut session = session(root.path(), false, &[]);
        session.begin_launch(1);
        assert!(session.is_launching());

        for _ in 0..MAX_EARLY_INPUT {
            session.write_input(b"x").unwrap();
        }
        assert_eq!(session.write_input(b"x"), Err(InputError::QueueFull));

        session.attach_process(process(1, "/bin/sh"));
        assert!(!session.is_launching());
        assert!(session.early_input.is_empty());
        session.write_input(b"after").unwrap();

        session.mark_dead(ExitInfo::code(0));
        assert_eq!(session.write_input(b"late"), Err(InputError::Closed));
    }

    #[tokio::test]
    async fn clear_sequence_empties_scrollback() {
        let root = tempfile::tempdir().unwrap();
        let mut session = session(root.path(), false, &[]);
        session.handle_output(b"old\x1b[3Jnew");
        assert_eq!(session.scrollback().as_bytes(), b"new");
        session.clear_scrollback();
        assert!(session.scrollback().is_empty());
    }

    #[tokio::test]
    async fn retry_budget_is_single_use() {
        let root = tempfile::tempdir().unwrap();
        let mut session = session(root.path(), false, &[]);
        session.attach_process(process(1, "/bin/crash"));

        let crash = ExitInfo::code(127);
        let threshold = Duration::from_secs(10);
        assert_eq!(
            session.take_retry(&crash, threshold).as_deref(),
            Some("/bin/fallback")
        );
        assert_eq!(session.phase(), LaunchPhase::CrashRetry);
        assert!(session.used_fallback);

        session.attach_process(process(2, "/bin/fallback"));
        assert_eq!(session.take_retry(&crash, threshold), None);
    }

    #[tokio::test]
    async fn clean_or_late_or_killed_exits_are_not_crashes() {
        let root = tempfile::tempdir().unwrap();
        let mut session = session(root.path(), false, &[]);
        session.attach_process(process(1, "/bin/sh"));

        assert_eq!(session.take_retry(&ExitInfo::code(0), Duration::from_secs(10)), None);
        assert_eq!(session.take_retry(&ExitInfo::code(1), Duration::ZERO), None);
        session.kill_requested = true;
        assert_eq!(session.take_retry(&ExitInfo::code(143), Duration::from_secs(10)), None);
    }

    #[tokio::test]
    async fn mark_dead_emits_exit_once() {
        let root = tempfile::tempdir().unwrap();
        let mut session = session(root.path(), false, &[]);
        session.attach_process(process(1, "/bin/sh"));
        let mut events = session.subscribe();
        let status = session.watch_status();

        session.mark_dead(ExitInfo::code(3));
        session.mark_dead(ExitInfo::code(4));

        assert!(!session.is_alive());
        assert_eq!(*status.borrow(), SessionStatus::Exited { exit_code: 3 });
        assert_eq!(
            events.recv().await.unwrap(),
            PaneEvent::Exit {
                exit_code: 3,
                signal: None
            }
        );
        assert!(events.try_recv().is_err());
        assert_eq!(session.write_input(b"x"), Err(InputError::Closed));
    }

    #[tokio::test]
    async fn initial_commands_skip_recovered_sessions() {
        let root = tempfile::tempdir().unwrap();
        let fresh = session(root.path(), false, &["cd src", " ", "ls"]);
        assert_eq!(fresh.pending_initial.as_deref(), Some("cd src && ls\n"));

        let recovered = session(root.path(), true, &["ls"]);
        assert_eq!(recovered.pending_initial, None);
    }

    #[tokio::test]
    async fn exit_waits_for_reader_drain() {
        let root = tempfile::tempdir().unwrap();
        let mut session = session(root.path(), false, &[]);
        assert!(!session.record_exit(ExitInfo::code(0)));
        assert!(session.record_reader_closed());
        assert_eq!(session.take_pending_exit(), Some(ExitInfo::code(0)));
    }
}
