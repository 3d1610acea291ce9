//! Follows one access log file across rotations

use super::{LogSource, FILE_CHANNEL_SIZE};
use crate::Result;
use async_trait::async_trait;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use traefik_officer_common::LogLine;

pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct FileTail {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Open file plus the bytes of a line that has no newline yet
struct Cursor {
    reader: BufReader<File>,
    inode: u64,
    offset: u64,
    partial: Vec<u8>,
}

impl Cursor {
    async fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).await?;
        let metadata = file.metadata().await?;
        Ok(Self {
            reader: BufReader::new(file),
            inode: inode(&metadata),
            offset: 0,
            partial: Vec::new(),
        })
    }

    /// Send every complete line available; false once the receiver is gone
    async fn drain(&mut self, tx: &mpsc::Sender<LogLine>) -> Result<bool> {
        loop {
            let read = self.reader.read_until(b'\n', &mut self.partial).await?;
            if read == 0 {
                return Ok(true);
            }
            self.offset += read as u64;

            if self.partial.last() != Some(&b'\n') {
                // Writer is mid-line; keep the bytes for the next poll
                continue;
            }

            let line = String::from_utf8_lossy(&self.partial)
                .trim_end_matches(['\n', '\r'])
                .to_string();
            self.partial.clear();

            if tx.send(LogLine::new(line)).await.is_err() {
                return Ok(false);
            }
        }
    }

    /// The path now points at a different file or this one shrank
    async fn rotated(&self, path: &Path) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(metadata) => inode(&metadata) != self.inode || metadata.len() < self.offset,
            Err(_) => false,
        }
    }
}

#[cfg(unix)]
fn inode(metadata: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn inode(_metadata: &Metadata) -> u64 {
    0
}

#[async_trait]
impl LogSource for FileTail {
    fn name(&self) -> &'static str {
        "file"
    }

    fn capacity(&self) -> usize {
        FILE_CHANNEL_SIZE
    }

    async fn run(self: Box<Self>, tx: mpsc::Sender<LogLine>, shutdown: CancellationToken) {
        info!(path = %self.path.display(), "Tailing access log file");

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cursor: Option<Cursor> = None;
        let mut waiting_logged = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if cursor.is_none() {
                match Cursor::open(&self.path).await {
                    Ok(opened) => {
                        debug!(path = %self.path.display(), "Opened access log file");
                        waiting_logged = false;
                        cursor = Some(opened);
                    }
                    Err(e) => {
                        if !waiting_logged {
                            warn!(path = %self.path.display(), "Waiting for access log file: {}", e);
                            waiting_logged = true;
                        }
                        continue;
                    }
                }
            }

            let Some(current) = cursor.as_mut() else {
                continue;
            };

            let drained = tokio::select! {
                _ = shutdown.cancelled() => break,
                drained = current.drain(&tx) => drained,
            };

            match drained {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(path = %self.path.display(), "Read failed, reopening: {}", e);
                    if tx
                        .send(LogLine::failed(None, format!("{}: {}", self.path.display(), e)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    cursor = None;
                    continue;
                }
            }

            if current.rotated(&self.path).await {
                info!(path = %self.path.display(), "Access log rotated, reopening");
                cursor = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn start(path: &Path) -> (mpsc::Receiver<LogLine>, CancellationToken) {
        let shutdown = CancellationToken::new();
        let source = FileTail::new(path).with_poll_interval(Duration::from_millis(10));
        let (rx, _handle) = crate::source::spawn(Box::new(source), shutdown.clone());
        (rx, shutdown)
    }

    async fn next_text(rx: &mut mpsc::Receiver<LogLine>) -> String {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap().text
    }

    #[tokio::test]
    async fn test_reads_existing_and_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "first\nsecond\n").unwrap();

        let (mut rx, shutdown) = start(&path);
        assert_eq!(next_text(&mut rx).await, "first");
        assert_eq!(next_text(&mut rx).await, "second");

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"thi").unwrap();
        file.flush().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        file.write_all(b"rd\r\n").unwrap();
        file.flush().unwrap();

        assert_eq!(next_text(&mut rx).await, "third");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_waits_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.log");

        let (mut rx, shutdown) = start(&path);
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&path, "hello\n").unwrap();

        assert_eq!(next_text(&mut rx).await, "hello");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_follows_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "before\n").unwrap();

        let (mut rx, shutdown) = start(&path);
        assert_eq!(next_text(&mut rx).await, "before");

        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, "after\n").unwrap();

        assert_eq!(next_text(&mut rx).await, "after");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_closes_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "").unwrap();

        let (mut rx, shutdown) = start(&path);
        shutdown.cancel();

        assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    }
}
