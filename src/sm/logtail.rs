use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const TAIL_BLOCK_BYTES: u64 = 8192;
const TAIL_MAX_BLOCKS: usize = 512;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// Last `n` lines of `path`, oldest first. Reads backward in fixed blocks from
/// the end so huge files never load whole. Missing file or any read error is an
/// empty result, never an error.
pub fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    tail_lines_inner(path, n).unwrap_or_default()
}

fn tail_lines_inner(path: &Path, n: usize) -> std::io::Result<Vec<String>> {
    if n == 0 {
        return Ok(vec![]);
    }
    let mut f = std::fs::OpenOptions::new().read(true).open(path)?;
    let len = f.metadata()?.len();
    if len == 0 {
        return Ok(vec![]);
    }

    // Read from the end in blocks until we have enough newlines.
    let mut pos = len;
    let mut newline_count: usize = 0;
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    while pos > 0 && newline_count <= n {
        let read_size = std::cmp::min(TAIL_BLOCK_BYTES, pos) as usize;
        pos -= read_size as u64;
        f.seek(SeekFrom::Start(pos))?;
        let mut buf = vec![0u8; read_size];
        f.read_exact(&mut buf)?;
        newline_count += buf.iter().filter(|&&b| b == b'\n').count();
        chunks.push(buf);
        if chunks.len() > TAIL_MAX_BLOCKS {
            // Backscan is capped at ~4MB; beyond that the oldest lines are lost.
            break;
        }
    }
    chunks.reverse();
    let data = chunks.concat();
    let s = String::from_utf8_lossy(&data);
    let mut lines: Vec<&str> = s.split_terminator('\n').collect();
    if lines.len() > n {
        lines = lines[lines.len() - n..].to_vec();
    }
    Ok(lines.into_iter().map(|l| l.to_string()).collect())
}

/// Offset-tracking reader over a growing log file. Deliberately poll-driven
/// (portable everywhere tee can write); a notification-driven variant could
/// replace it without touching the framing above it.
#[derive(Debug)]
pub struct LogFollower {
    path: PathBuf,
    offset: u64,
}

impl LogFollower {
    /// Starts at offset 0: the first poll replays the whole existing file,
    /// which pairs with the Clear frame a stream opens with.
    pub fn new(path: PathBuf) -> Self {
        Self { path, offset: 0 }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Lines appended since the last poll. A shrunken file (rotation,
    /// truncation) resets the offset to zero instead of erroring. A trailing
    /// fragment without a newline is emitted as its own line.
    pub fn poll(&mut self) -> std::io::Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let len = std::fs::metadata(&self.path)?.len();
        if len < self.offset {
            self.offset = 0;
        }
        if len <= self.offset {
            return Ok(vec![]);
        }
        let mut f = std::fs::OpenOptions::new().read(true).open(&self.path)?;
        f.seek(SeekFrom::Start(self.offset))?;
        let mut buf = vec![0u8; (len - self.offset) as usize];
        f.read_exact(&mut buf)?;
        self.offset = len;
        let s = String::from_utf8_lossy(&buf);
        Ok(s.split_terminator('\n').map(|l| l.to_string()).collect())
    }
}

/// One unit of the live-log protocol, independent of its wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Client must drop everything it has rendered.
    Clear,
    /// One flush window: discrete lines, one render unit each.
    Lines(Vec<String>),
    /// No-op frame so idle streams survive intermediary timeouts.
    Keepalive,
}

/// Follow `path` until the receiver goes away or `shutting_down` is set.
///
/// Emits Clear first, then polls every 100ms, flushing buffered lines at most
/// 4x/sec as one Lines frame, with a Keepalive every ~10s. Read errors are
/// swallowed and retried after a short backoff; they never end the stream.
pub async fn follow(
    path: PathBuf,
    shutting_down: Arc<AtomicBool>,
    tx: mpsc::Sender<StreamFrame>,
) {
    if tx.send(StreamFrame::Clear).await.is_err() {
        return;
    }
    let mut follower = LogFollower::new(path);
    let mut pending: Vec<String> = Vec::new();
    let mut last_flush = Instant::now();
    let mut last_keepalive = Instant::now();

    while !shutting_down.load(Ordering::Relaxed) {
        match follower.poll() {
            Ok(lines) => pending.extend(lines),
            Err(_) => {
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        }
        if !pending.is_empty() && last_flush.elapsed() >= FLUSH_INTERVAL {
            let batch = std::mem::take(&mut pending);
            if tx.send(StreamFrame::Lines(batch)).await.is_err() {
                return;
            }
            last_flush = Instant::now();
        }
        if last_keepalive.elapsed() >= KEEPALIVE_INTERVAL {
            if tx.send(StreamFrame::Keepalive).await.is_err() {
                return;
            }
            last_keepalive = Instant::now();
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
