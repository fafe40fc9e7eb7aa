use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tokio_stream::StreamExt;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, warn};

/// Target under which every backend output line is logged
pub const BACKEND_LOG_TARGET: &str = "shamble_backend";

const MAX_LINE_LENGTH: usize = 64 * 1024;
const CHANNEL_CAPACITY: usize = 256;

/// A captured pipe of the child process
pub type OutputPipe = Box<dyn AsyncRead + Unpin + Send>;

/// Newline framing that never fails on bad bytes.
///
/// Invalid UTF-8 is replaced, `\r\n` is accepted, and a line longer than
/// `MAX_LINE_LENGTH` is emitted in pieces instead of growing the buffer.
#[derive(Debug, Default)]
pub struct LossyLineCodec;

impl LossyLineCodec {
    fn take_line(src: &mut BytesMut, len: usize, skip: usize) -> String {
        let raw = src.split_to(len);
        let _ = src.split_to(skip);
        let raw = raw.strip_suffix(b"\r").unwrap_or(&raw[..]);
        String::from_utf8_lossy(raw).into_owned()
    }
}

impl Decoder for LossyLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|b| *b == b'\n') {
            Some(newline) if newline <= MAX_LINE_LENGTH => {
                Ok(Some(Self::take_line(src, newline, 1)))
            }
            _ if src.len() > MAX_LINE_LENGTH => Ok(Some(Self::take_line(src, MAX_LINE_LENGTH, 0))),
            _ => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        if src.is_empty() {
            return Ok(None);
        }

        let len = src.len();
        Ok(Some(Self::take_line(src, len, 0)))
    }
}

/// Combined stdout/stderr of a supervised process, one line at a time.
///
/// Lines are pumped by background tasks that never block on the reader, so
/// the child's pipes keep draining even when nobody calls `next_line`.
pub struct OutputLines {
    rx: mpsc::Receiver<String>,
    recent: VecDeque<String>,
    recent_capacity: usize,
}

impl OutputLines {
    /// Merge any number of pipes into a single line stream
    pub fn merge(readers: Vec<OutputPipe>, label: &str, recent_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        for reader in readers {
            tokio::spawn(pump(reader, tx.clone(), label.to_string()));
        }

        Self::from_receiver(rx, recent_capacity)
    }

    /// Build from an existing channel; the stream ends when all senders drop
    pub fn from_receiver(rx: mpsc::Receiver<String>, recent_capacity: usize) -> Self {
        Self {
            rx,
            recent: VecDeque::with_capacity(recent_capacity.min(CHANNEL_CAPACITY)),
            recent_capacity,
        }
    }

    /// Wait for the next line; `None` once every pipe has closed
    pub async fn next_line(&mut self) -> Option<String> {
        let line = self.rx.recv().await?;
        self.remember(line.clone());
        Some(line)
    }

    /// Pull whatever is still queued into the recent lines.
    ///
    /// Keeps reading until every pipe has closed or `wait` has passed; lines
    /// already queued are taken even when `wait` is zero. Returns how many
    /// lines were drained.
    pub async fn drain_remaining(&mut self, wait: Duration) -> usize {
        let deadline = Instant::now() + wait;
        let mut drained = 0;

        while let Ok(Some(line)) = timeout_at(deadline, self.rx.recv()).await {
            self.remember(line);
            drained += 1;
        }

        drained
    }

    /// The most recent lines read from the stream, oldest first
    pub fn recent(&self) -> Vec<String> {
        self.recent.iter().cloned().collect()
    }

    fn remember(&mut self, line: String) {
        if self.recent_capacity == 0 {
            return;
        }
        if self.recent.len() == self.recent_capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(line);
    }
}

async fn pump<R>(reader: R, tx: mpsc::Sender<String>, label: String)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::with_capacity(reader, LossyLineCodec, 1024);

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(line) => {
                debug!(target: BACKEND_LOG_TARGET, process = %label, "{line}");
                // Full or closed: drop the line but keep draining the pipe.
                let _ = tx.try_send(line);
            }
            Err(e) => {
                warn!(process = %label, error = %e, "Failed to read backend output");
                break;
            }
        }
    }
}
