//! Scripted PTY backend for controller tests
//!
//! Behaviors are chosen per pane (via `PANEHOST_PANE_ID` in the spawn
//! environment) or per program, falling back to an echo shell.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::pty::{
    normalize_signal, ExitInfo, PtyBackend, PtyChild, PtyControl, PtyError, PtyHandles, Result,
    SpawnSpec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeBehavior {
    /// Prints `$ `, echoes input, runs `echo ...` and `exit N`; dies on TERM/KILL/HUP
    Echo,
    /// Prints an error and exits with the given code right away
    ExitImmediately(i32),
    /// Ignores every signal and never exits
    Unresponsive,
}

#[derive(Default)]
pub struct FakeBackend {
    by_pane: HashMap<String, FakeBehavior>,
    by_program: HashMap<String, FakeBehavior>,
    spawns: Mutex<Vec<SpawnSpec>>,
    signals: Arc<Mutex<Vec<(String, String)>>>,
    spawn_delay: Duration,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pane(mut self, pane_id: &str, behavior: FakeBehavior) -> Self {
        self.by_pane.insert(pane_id.to_string(), behavior);
        self
    }

    pub fn with_program(mut self, program: &str, behavior: FakeBehavior) -> Self {
        self.by_program.insert(program.to_string(), behavior);
        self
    }

    /// Every spawn blocks this long before returning
    pub fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = delay;
        self
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().unwrap().len()
    }

    pub fn spawns(&self) -> Vec<SpawnSpec> {
        self.spawns.lock().unwrap().clone()
    }

    /// `(pane_id, signal)` pairs in delivery order
    pub fn signals(&self) -> Vec<(String, String)> {
        self.signals.lock().unwrap().clone()
    }

    fn behavior_for(&self, spec: &SpawnSpec, pane_id: &str) -> FakeBehavior {
        self.by_pane
            .get(pane_id)
            .or_else(|| self.by_program.get(&spec.program))
            .copied()
            .unwrap_or(FakeBehavior::Echo)
    }
}

impl PtyBackend for FakeBackend {
    fn spawn(&self, spec: &SpawnSpec) -> Result<PtyHandles> {
        let pane_id = spec.env.get("PANEHOST_PANE_ID").cloned().unwrap_or_default();
        let behavior = self.behavior_for(spec, &pane_id);
        self.spawns.lock().unwrap().push(spec.clone());
        if !self.spawn_delay.is_zero() {
            std::thread::sleep(self.spawn_delay);
        }

        let (out_tx, out_rx) = channel();
        let process = Arc::new(FakeProcess {
            output: Mutex::new(Some(out_tx)),
            exit: Mutex::new(None),
            exited: Condvar::new(),
        });

        match behavior {
            FakeBehavior::Echo | FakeBehavior::Unresponsive => process.emit(b"$ "),
            FakeBehavior::ExitImmediately(code) => {
                process.emit(format!("{}: failed to start\r\n", spec.program).as_bytes());
                process.finish(ExitInfo::code(code));
            }
        }

        Ok(PtyHandles {
            control: Box::new(FakeControl {
                pane_id,
                behavior,
                process: Arc::clone(&process),
                signals: Arc::clone(&self.signals),
            }),
            reader: Box::new(FakeReader {
                rx: out_rx,
                buf: Vec::new(),
            }),
            writer: Box::new(FakeWriter {
                process: Arc::clone(&process),
                line: Vec::new(),
            }),
            child: Box::new(FakeChild { process }),
        })
    }
}

struct FakeProcess {
    /// Dropped on exit so the reader sees EOF
    output: Mutex<Option<Sender<Vec<u8>>>>,
    exit: Mutex<Option<ExitInfo>>,
    exited: Condvar,
}

impl FakeProcess {
    fn emit(&self, data: &[u8]) {
        if let Some(tx) = self.output.lock().unwrap().as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }

    fn finish(&self, info: ExitInfo) {
        self.output.lock().unwrap().take();
        let mut exit = self.exit.lock().unwrap();
        if exit.is_none() {
            *exit = Some(info);
        }
        self.exited.notify_all();
    }

    fn is_running(&self) -> bool {
        self.exit.lock().unwrap().is_none()
    }
}

struct FakeControl {
    pane_id: String,
    behavior: FakeBehavior,
    process: Arc<FakeProcess>,
    signals: Arc<Mutex<Vec<(String, String)>>>,
}

impl PtyControl for FakeControl {
    fn resize(&mut self, _cols: u16, _rows: u16) -> Result<()> {
        Ok(())
    }

    fn signal(&mut self, signal: &str) -> Result<()> {
        let name = normalize_signal(signal);
        let number = match name.as_str() {
            "SIGHUP" => 1,
            "SIGINT" => 2,
            "SIGKILL" => 9,
            "SIGTERM" => 15,
            _ => return Err(PtyError::UnknownSignal(signal.to_string())),
        };
        self.signals
            .lock()
            .unwrap()
            .push((self.pane_id.clone(), name.clone()));

        if self.behavior == FakeBehavior::Echo && number != 2 && self.process.is_running() {
            self.process.finish(ExitInfo {
                exit_code: 128 + number,
                signal: Some(name),
            });
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(4242)
    }
}

struct FakeReader {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
}

impl Read for FakeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.buf.is_empty() {
            match self.rx.recv() {
                Ok(data) => self.buf = data,
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.drain(..n);
        Ok(n)
    }
}

struct FakeWriter {
    process: Arc<FakeProcess>,
    line: Vec<u8>,
}

impl FakeWriter {
    fn run_line(&mut self) {
        let line = String::from_utf8_lossy(&self.line).trim().to_string();
        self.line.clear();

        if let Some(rest) = line.strip_prefix("echo ") {
            self.process.emit(format!("{}\r\n", rest).as_bytes());
        } else if let Some(code) = line.strip_prefix("exit") {
            let code = code.trim().parse().unwrap_or(0);
            self.process.finish(ExitInfo::code(code));
            return;
        }
        self.process.emit(b"$ ");
    }
}

impl Write for FakeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.process.is_running() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "process exited"));
        }
        for &byte in buf {
            if byte == b'\n' || byte == b'\r' {
                self.process.emit(b"\r\n");
                self.run_line();
            } else {
                self.process.emit(&[byte]);
                self.line.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct FakeChild {
    process: Arc<FakeProcess>,
}

impl PtyChild for FakeChild {
    fn wait(&mut self) -> ExitInfo {
        let mut exit = self.process.exit.lock().unwrap();
        loop {
            if let Some(info) = exit.clone() {
                return info;
            }
            exit = self.process.exited.wait(exit).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(program: &str) -> SpawnSpec {
        SpawnSpec {
            program: program.to_string(),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
            env: BTreeMap::new(),
            cols: 80,
            rows: 24,
        }
    }

    fn read_all(reader: &mut Box<dyn Read + Send>) -> String {
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn echo_shell_runs_commands() {
        let backend = FakeBackend::new();
        let mut handles = backend.spawn(&spec("/bin/sh")).unwrap();
        handles.writer.write_all(b"echo hi\nexit 0\n").unwrap();

        let output = read_all(&mut handles.reader);
        assert!(output.starts_with("$ echo hi\r\nhi\r\n$ "));
        assert_eq!(handles.child.wait(), ExitInfo::code(0));
        assert_eq!(backend.spawn_count(), 1);
    }

    #[test]
    fn crashing_shell_exits_with_code() {
        let backend = FakeBackend::new().with_program("/bin/broken", FakeBehavior::ExitImmediately(127));
        let mut handles = backend.spawn(&spec("/bin/broken")).unwrap();
        assert!(read_all(&mut handles.reader).contains("failed to start"));
        assert_eq!(handles.child.wait().exit_code, 127);
    }

    #[test]
    fn echo_shell_dies_on_term() {
        let backend = FakeBackend::new();
        let mut handles = backend.spawn(&spec("/bin/sh")).unwrap();
        handles.control.signal("TERM").unwrap();
        let exit = handles.child.wait();
        assert_eq!(exit.exit_code, 143);
        assert_eq!(exit.signal.as_deref(), Some("SIGTERM"));
        assert!(matches!(
            handles.control.signal("SIGWHAT"),
            Err(PtyError::UnknownSignal(_))
        ));
    }
}
