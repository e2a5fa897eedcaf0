//! Scrollback history for panehost
//!
//! Each pane's filtered output is persisted under
//! `<history_dir>/<workspace>/<pane>/`:
//!
//! - `meta.toml`: cwd, geometry, shell and start/end timestamps. A missing
//!   `ended_at` means the session did not shut down cleanly.
//! - `scrollback.bin`: append-only log of filtered bytes.
//!
//! Writes are queued to a per-session task so the output path never waits on
//! the disk. Failures are logged there and never reach the session.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::scrollback::align_to_char_boundary;

const META_FILE: &str = "meta.toml";
const LOG_FILE: &str = "scrollback.bin";

/// Identifies one history artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistoryKey {
    pub workspace_id: String,
    pub pane_id: String,
}

impl HistoryKey {
    pub fn new(workspace_id: &str, pane_id: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            pane_id: pane_id.to_string(),
        }
    }

    /// Artifact directory under `root`
    pub fn dir(&self, root: &Path) -> PathBuf {
        root.join(sanitize_component(&self.workspace_id))
            .join(sanitize_component(&self.pane_id))
    }
}

/// Percent-encode everything outside `[A-Za-z0-9._-]` so distinct ids map to
/// distinct directories that stay under the history root
fn sanitize_component(id: &str) -> String {
    match id {
        "" => return "%".to_string(),
        "." => return "%2E".to_string(),
        ".." => return "%2E%2E".to_string(),
        _ => {}
    }
    let mut encoded = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

/// Session metadata persisted next to the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub shell: String,
    /// Unix seconds
    pub started_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl SessionMeta {
    pub fn new(cwd: PathBuf, cols: u16, rows: u16, shell: &str) -> Self {
        Self {
            cwd,
            cols,
            rows,
            shell: shell.to_string(),
            started_at: unix_now(),
            ended_at: None,
            exit_code: None,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug)]
enum HistoryOp {
    Append(Vec<u8>),
    Truncate,
    Resize { cols: u16, rows: u16 },
    Close(Option<i32>),
    CloseAndDelete,
}

/// Queued writer for one history artifact
#[derive(Debug)]
pub struct HistoryWriter {
    pane_id: String,
    tx: Option<mpsc::UnboundedSender<HistoryOp>>,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl HistoryWriter {
    /// Create (or reset) the artifact and seed it with recovered scrollback.
    ///
    /// When `previous` is given its queue is drained first, so a close or
    /// delete still in flight cannot land after the new artifact is created.
    pub fn init(
        root: &Path,
        key: &HistoryKey,
        meta: SessionMeta,
        seed: Vec<u8>,
        previous: Option<HistoryWriter>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let dir = key.dir(root);
        let pane_id = key.pane_id.clone();
        let task = tokio::spawn(run_writer(pane_id.clone(), dir, meta, seed, previous, rx));
        Self {
            pane_id,
            tx: Some(tx),
            task: Some(task),
            closed: false,
        }
    }

    pub fn write(&self, data: &[u8]) {
        if !data.is_empty() {
            self.send(HistoryOp::Append(data.to_vec()));
        }
    }

    /// Drop everything logged so far
    pub fn truncate(&self) {
        self.send(HistoryOp::Truncate);
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        self.send(HistoryOp::Resize { cols, rows });
    }

    /// Finalize metadata; only a delete is accepted afterwards
    pub fn close(&mut self, exit_code: Option<i32>) {
        self.send(HistoryOp::Close(exit_code));
        self.closed = true;
    }

    /// Remove the artifact once queued writes are done (also after `close`)
    pub fn close_and_delete(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(HistoryOp::CloseAndDelete);
        }
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop accepting operations and let the task finish in the background
    pub fn retire(&mut self) {
        self.tx = None;
        self.closed = true;
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait until every queued operation has hit the disk
    pub async fn finished(mut self) {
        self.tx = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("[{}] History writer task failed: {}", self.pane_id, e);
            }
        }
    }

    fn send(&self, op: HistoryOp) {
        if self.closed {
            return;
        }
        if let Some(tx) = &self.tx {
            // The task outlives every sender
            let _ = tx.send(op);
        }
    }
}

struct Artifact {
    dir: PathBuf,
    meta: SessionMeta,
    log: File,
}

impl Artifact {
    async fn create(dir: PathBuf, meta: SessionMeta, seed: &[u8]) -> io::Result<Self> {
        fs::create_dir_all(&dir).await?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))
            .await?;
        log.set_len(0).await?;
        let mut artifact = Self { dir, meta, log };
        if !seed.is_empty() {
            artifact.append(seed).await?;
        }
        artifact.write_meta().await?;
        Ok(artifact)
    }

    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.log.write_all(data).await?;
        self.log.flush().await
    }

    async fn truncate(&mut self) -> io::Result<()> {
        self.log.flush().await?;
        self.log.set_len(0).await
    }

    async fn write_meta(&self) -> io::Result<()> {
        let content = toml::to_string(&self.meta)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.dir.join(format!("{}.tmp", META_FILE));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, self.dir.join(META_FILE)).await
    }

    async fn apply(&mut self, op: HistoryOp) -> io::Result<()> {
        match op {
            HistoryOp::Append(data) => self.append(&data).await,
            HistoryOp::Truncate => self.truncate().await,
            HistoryOp::Resize { cols, rows } => {
                self.meta.cols = cols;
                self.meta.rows = rows;
                self.write_meta().await
            }
            HistoryOp::Close(exit_code) => self.close(exit_code).await,
            HistoryOp::CloseAndDelete => Ok(()),
        }
    }

    async fn close(&mut self, exit_code: Option<i32>) -> io::Result<()> {
        self.log.flush().await?;
        self.log.sync_data().await?;
        self.meta.ended_at = Some(unix_now());
        self.meta.exit_code = exit_code;
        self.write_meta().await
    }
}

async fn run_writer(
    pane_id: String,
    dir: PathBuf,
    meta: SessionMeta,
    seed: Vec<u8>,
    previous: Option<HistoryWriter>,
    mut rx: mpsc::UnboundedReceiver<HistoryOp>,
) {
    if let Some(previous) = previous {
        previous.finished().await;
    }

    let mut artifact = match Artifact::create(dir.clone(), meta, &seed).await {
        Ok(artifact) => Some(artifact),
        Err(e) => {
            tracing::warn!("[{}] Failed to create history in {:?}: {}", pane_id, dir, e);
            None
        }
    };

    while let Some(op) = rx.recv().await {
        let result = match op {
            HistoryOp::CloseAndDelete => {
                artifact = None;
                remove_dir(&dir).await
            }
            HistoryOp::Close(exit_code) => match artifact.take() {
                Some(mut a) => a.close(exit_code).await,
                None => continue,
            },
            op => match artifact.as_mut() {
                Some(a) => a.apply(op).await,
                None => continue,
            },
        };
        if let Err(e) = result {
            tracing::warn!("[{}] History write failed: {}", pane_id, e);
        }
    }

    if let Some(mut artifact) = artifact {
        if let Err(e) = artifact.log.flush().await {
            tracing::warn!("[{}] History flush failed: {}", pane_id, e);
        }
    }
    tracing::debug!("[{}] History writer stopped", pane_id);
}

async fn remove_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Scrollback recovered from disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredHistory {
    pub scrollback: Vec<u8>,
    pub meta: Option<SessionMeta>,
}

impl RecoveredHistory {
    /// Ended without a recorded exit
    pub fn was_ungraceful(&self) -> bool {
        self.meta.as_ref().is_some_and(|m| m.ended_at.is_none())
    }
}

pub struct HistoryReader {
    dir: PathBuf,
    max_bytes: usize,
}

impl HistoryReader {
    pub fn new(root: &Path, key: &HistoryKey, max_bytes: usize) -> Self {
        Self {
            dir: key.dir(root),
            max_bytes,
        }
    }

    /// Tail of the log (at most `max_bytes`) plus metadata, empty if absent
    pub async fn read(&self) -> io::Result<RecoveredHistory> {
        let scrollback = match File::open(self.dir.join(LOG_FILE)).await {
            Ok(file) => self.read_tail(file).await?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };

        let meta = match fs::read_to_string(self.dir.join(META_FILE)).await {
            Ok(content) => match toml::from_str(&content) {
                Ok(meta) => Some(meta),
                Err(e) => {
                    tracing::warn!("Ignoring unreadable history metadata in {:?}: {}", self.dir, e);
                    None
                }
            },
            Err(_) => None,
        };

        Ok(RecoveredHistory { scrollback, meta })
    }

    async fn read_tail(&self, mut file: File) -> io::Result<Vec<u8>> {
        let len = file.metadata().await?.len();
        let max = self.max_bytes as u64;
        let trimmed = len > max;
        if trimmed {
            file.seek(SeekFrom::Start(len - max)).await?;
        }
        let mut buf = Vec::with_capacity(len.min(max) as usize);
        file.read_to_end(&mut buf).await?;
        if trimmed {
            let start = align_to_char_boundary(&buf, 0);
            buf.drain(..start);
        }
        Ok(buf)
    }

    /// Delete the artifact; a missing one is not an error
    pub async fn cleanup(&self) -> io::Result<()> {
        remove_dir(&self.dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> SessionMeta {
        SessionMeta::new(PathBuf::from("/tmp"), 80, 24, "/bin/sh")
    }

    #[test]
    fn ids_are_sanitized() {
        let key = HistoryKey::new("../ws", "pane/1 x");
        let dir = key.dir(Path::new("/root"));
        assert_eq!(dir, Path::new("/root").join("..%2Fws").join("pane%2F1%20x"));
        assert_eq!(sanitize_component(".."), "%2E%2E");
        assert_eq!(sanitize_component("."), "%2E");
        assert_eq!(sanitize_component(""), "%");
        assert_eq!(sanitize_component("ü"), "%C3%BC");
    }

    #[test]
    fn distinct_ids_never_share_a_directory() {
        let ids = ["a/b", "a_b", "a b", "a%2Fb", "a%b", "", "%", ".", "%2E", "..", "_.."];
        let dirs: std::collections::HashSet<_> = ids.iter().map(|id| sanitize_component(id)).collect();
        assert_eq!(dirs.len(), ids.len());
    }

    #[tokio::test]
    async fn writes_are_recoverable_after_close() {
        let root = tempfile::tempdir().unwrap();
        let key = HistoryKey::new("ws", "p1");
        let mut writer = HistoryWriter::init(root.path(), &key, meta(), Vec::new(), None);
        writer.write(b"echo hi\r\n");
        writer.write(b"hi\r\n");
        writer.resize(120, 40);
        writer.close(Some(0));
        writer.finished().await;

        let recovered = HistoryReader::new(root.path(), &key, 1024).read().await.unwrap();
        assert_eq!(recovered.scrollback, b"echo hi\r\nhi\r\n".to_vec());
        let meta = recovered.meta.unwrap();
        assert_eq!((meta.cols, meta.rows), (120, 40));
        assert_eq!(meta.exit_code, Some(0));
        assert!(meta.ended_at.is_some());
    }

    #[tokio::test]
    async fn dropped_writer_leaves_partial_history() {
        let root = tempfile::tempdir().unwrap();
        let key = HistoryKey::new("ws", "p1");
        let writer = HistoryWriter::init(root.path(), &key, meta(), b"seed:".to_vec(), None);
        writer.write(b"partial");
        writer.finished().await;

        let recovered = HistoryReader::new(root.path(), &key, 1024).read().await.unwrap();
        assert_eq!(recovered.scrollback, b"seed:partial".to_vec());
        assert!(recovered.was_ungraceful());
    }

    #[tokio::test]
    async fn truncate_starts_over() {
        let root = tempfile::tempdir().unwrap();
        let key = HistoryKey::new("ws", "p1");
        let mut writer = HistoryWriter::init(root.path(), &key, meta(), Vec::new(), None);
        writer.write(b"old");
        writer.truncate();
        writer.write(b"new");
        writer.close(None);
        writer.finished().await;

        let recovered = HistoryReader::new(root.path(), &key, 1024).read().await.unwrap();
        assert_eq!(recovered.scrollback, b"new".to_vec());
    }

    #[tokio::test]
    async fn read_returns_tail_only() {
        let root = tempfile::tempdir().unwrap();
        let key = HistoryKey::new("ws", "p1");
        let mut writer = HistoryWriter::init(root.path(), &key, meta(), Vec::new(), None);
        writer.write(b"0123456789abcdef");
        writer.close(Some(0));
        writer.finished().await;

        let recovered = HistoryReader::new(root.path(), &key, 6).read().await.unwrap();
        assert_eq!(recovered.scrollback, b"abcdef".to_vec());
    }

    #[tokio::test]
    async fn missing_history_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let reader = HistoryReader::new(root.path(), &HistoryKey::new("ws", "none"), 1024);
        assert_eq!(reader.read().await.unwrap(), RecoveredHistory::default());
        reader.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn new_writer_waits_for_previous_delete() {
        let root = tempfile::tempdir().unwrap();
        let key = HistoryKey::new("ws", "p1");
        let mut first = HistoryWriter::init(root.path(), &key, meta(), Vec::new(), None);
        first.write(b"first");
        first.close_and_delete();

        let mut second = HistoryWriter::init(root.path(), &key, meta(), Vec::new(), Some(first));
        second.write(b"second");
        second.close(Some(0));
        second.finished().await;

        let recovered = HistoryReader::new(root.path(), &key, 1024).read().await.unwrap();
        assert_eq!(recovered.scrollback, b"second".to_vec());
    }

    #[tokio::test]
    async fn cleanup_removes_artifact() {
        let root = tempfile::tempdir().unwrap();
        let key = HistoryKey::new("ws", "p1");
        let mut writer = HistoryWriter::init(root.path(), &key, meta(), b"x".to_vec(), None);
        writer.close(None);
        writer.finished().await;

        let reader = HistoryReader::new(root.path(), &key, 1024);
        reader.cleanup().await.unwrap();
        assert!(!key.dir(root.path()).exists());
        assert!(reader.read().await.unwrap().scrollback.is_empty());
    }

    #[tokio::test]
    async fn closed_history_can_still_be_deleted() {
        let root = tempfile::tempdir().unwrap();
        let key = HistoryKey::new("ws", "p1");
        let mut writer = HistoryWriter::init(root.path(), &key, meta(), Vec::new(), None);
        writer.write(b"data");
        writer.close(Some(0));
        writer.write(b"ignored");
        assert!(writer.is_closed());
        writer.close_and_delete();
        writer.finished().await;
        assert!(!key.dir(root.path()).exists());
    }
}
