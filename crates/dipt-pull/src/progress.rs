//! Byte-level transfer progress.
//!
//! A [`ProgressTracker`] is created per transfer with the expected total.
//! Its [`ProgressTransport`] wraps blob bodies in a [`ProgressReader`] that
//! counts bytes as they are read and invokes the callback synchronously.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use dipt_core::{EventSink, PullEvent, TransferProgress};
use tokio::io::{AsyncRead, ReadBuf};

use crate::registry::{ByteStream, Transport};

/// Progress callback, invoked on the reading path.
pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

struct TrackerState {
    downloaded: AtomicU64,
    total: u64,
    callback: ProgressCallback,
}

/// Accumulates transferred bytes against a fixed total.
#[derive(Clone)]
pub struct ProgressTracker {
    state: Arc<TrackerState>,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("progress", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl ProgressTracker {
    /// Creates a tracker reporting to `callback`.
    pub fn new(total: u64, callback: impl Fn(TransferProgress) + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(TrackerState {
                downloaded: AtomicU64::new(0),
                total,
                callback: Arc::new(callback),
            }),
        }
    }

    /// Creates a tracker that emits [`PullEvent::Progress`] into `sink`.
    pub fn with_sink(total: u64, sink: Arc<dyn EventSink>) -> Self {
        Self::new(total, move |progress| sink.emit(PullEvent::Progress(progress)))
    }

    /// Wraps a reader so every byte read is counted.
    pub fn wrap<R: AsyncRead + Unpin>(&self, reader: R) -> ProgressReader<R> {
        ProgressReader {
            inner: reader,
            tracker: self.clone(),
        }
    }

    /// Transport that wraps blob bodies with this tracker.
    pub fn transport(&self) -> ProgressTransport {
        ProgressTransport {
            tracker: self.clone(),
        }
    }

    /// Records `bytes` more and reports the new state.
    pub fn record(&self, bytes: u64) {
        let previous = self.state.downloaded.fetch_add(bytes, Ordering::Relaxed);
        (self.state.callback)(TransferProgress {
            downloaded: previous.saturating_add(bytes),
            total: self.state.total,
        });
    }

    /// Reports `(total, total)` once the transfer has completed.
    pub fn finish(&self) {
        (self.state.callback)(TransferProgress {
            downloaded: self.state.total,
            total: self.state.total,
        });
    }

    /// Current state.
    pub fn snapshot(&self) -> TransferProgress {
        TransferProgress {
            downloaded: self.state.downloaded.load(Ordering::Relaxed),
            total: self.state.total,
        }
    }
}

/// Reader that reports every chunk it yields. Dropping it drops the inner stream.
#[derive(Debug)]
pub struct ProgressReader<R> {
    inner: R,
    tracker: ProgressTracker,
}

impl<R> ProgressReader<R> {
    /// Unwraps the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let read = buf.filled().len() - before;
            if read > 0 {
                self.tracker.record(read as u64);
            }
        }
        poll
    }
}

/// Formats a byte count with binary units, e.g. `1.5 MB`.
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    const SUFFIXES: &[u8] = b"KMGTPE";
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT && exp + 1 < SUFFIXES.len() {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}B", bytes as f64 / div as f64, SUFFIXES[exp] as char)
}

/// Returns true for blob download paths.
pub fn is_blob_path(path: &str) -> bool {
    path.contains("/blobs/")
}

/// Transport counting blob bodies; manifests and token requests pass through.
#[derive(Debug, Clone)]
pub struct ProgressTransport {
    tracker: ProgressTracker,
}

impl Transport for ProgressTransport {
    fn intercept(&self, path: &str, body: ByteStream) -> ByteStream {
        if is_blob_path(path) {
            Box::pin(self.tracker.wrap(body))
        } else {
            body
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;

    fn recording(total: u64) -> (ProgressTracker, Arc<Mutex<Vec<TransferProgress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tracker = ProgressTracker::new(total, move |p| sink.lock().push(p));
        (tracker, seen)
    }

    #[tokio::test]
    async fn test_counts_bytes_and_finishes_at_total() {
        let (tracker, seen) = recording(10);
        let mut reader = tracker.wrap(&b"0123456789"[..]);
        let mut chunk = [0u8; 4];
        let mut read = 0;
        loop {
            let n = reader.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            read += n;
        }
        tracker.finish();

        assert_eq!(read, 10);
        let seen = seen.lock();
        let counts: Vec<u64> = seen.iter().map(|p| p.downloaded).collect();
        assert_eq!(counts, vec![4, 8, 10, 10]);
        assert_eq!(
            *seen.last().unwrap(),
            TransferProgress {
                downloaded: 10,
                total: 10
            }
        );
    }

    #[tokio::test]
    async fn test_zero_total_reports_bytes_without_percent() {
        let (tracker, seen) = recording(0);
        let mut out = Vec::new();
        tracker.wrap(&b"abc"[..]).read_to_end(&mut out).await.unwrap();

        let last = *seen.lock().last().unwrap();
        assert_eq!(last.downloaded, 3);
        assert_eq!(last.percent(), None);
    }

    #[tokio::test]
    async fn test_transport_only_wraps_blobs() {
        let (tracker, seen) = recording(5);
        let transport = tracker.transport();

        let mut out = Vec::new();
        transport
            .intercept("/v2/library/nginx/manifests/latest", Box::pin(&b"{}"[..]))
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert!(seen.lock().is_empty());

        out.clear();
        transport
            .intercept("/v2/library/nginx/blobs/sha256:01", Box::pin(&b"layer"[..]))
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(tracker.snapshot().downloaded, 5);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(u64::MAX), "16.0 EB");
    }

    #[test]
    fn test_blob_paths() {
        assert!(is_blob_path("/v2/library/redis/blobs/sha256:abc"));
        assert!(!is_blob_path("/v2/library/redis/manifests/7"));
        assert!(!is_blob_path("/token"));
    }
}
