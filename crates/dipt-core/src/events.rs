//! Pull events and the sinks that consume them.
//!
//! Components never write to the console. They emit [`PullEvent`]s into an
//! injected [`EventSink`]; the front end decides how to render them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::classify::ErrorKind;

/// Steps of a pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PullStage {
    /// Parsing the image reference.
    ResolveReference,
    /// Choosing credentials.
    SelectAuth,
    /// Probing and trying mirrors.
    MaybeMirror,
    /// Fetching the image descriptor.
    FetchMetadata,
    /// Transferring image content.
    FetchContent,
    /// Writing the archive.
    Persist,
    /// Finished successfully.
    Done,
    /// Terminal failure.
    Failed,
}

impl std::fmt::Display for PullStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ResolveReference => "resolve-reference",
            Self::SelectAuth => "select-auth",
            Self::MaybeMirror => "mirror",
            Self::FetchMetadata => "fetch-metadata",
            Self::FetchContent => "fetch-content",
            Self::Persist => "persist",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of a single attempt inside the retry executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The attempt succeeded.
    Succeeded,
    /// The attempt failed; the message is the raw error text.
    Failed(String),
}

/// One attempt made by the retry executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptEvent {
    /// Operation label.
    pub label: String,
    /// Zero-based attempt index.
    pub attempt: u32,
    /// Retry budget of the operation.
    pub max_retries: u32,
    /// What happened.
    pub outcome: AttemptOutcome,
    /// Backoff before the next attempt, if one follows.
    pub delay: Option<Duration>,
}

/// Result of probing one mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeEvent {
    /// Mirror URL.
    pub url: String,
    /// Whether the mirror answered the capability check.
    pub available: bool,
    /// Round-trip time of the probe.
    pub latency: Duration,
    /// Failure description for unavailable mirrors.
    pub error: Option<String>,
}

/// Bytes transferred so far against a fixed total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferProgress {
    /// Bytes read so far.
    pub downloaded: u64,
    /// Expected total; zero when unknown.
    pub total: u64,
}

impl TransferProgress {
    /// Completion percentage, or `None` when the total is zero.
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.downloaded as f64 * 100.0 / self.total as f64)
        }
    }
}

/// Severity of free-form messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    /// Shown only in verbose mode.
    Debug,
    /// Normal progress information.
    Info,
    /// Something went wrong but the pull continues.
    Warn,
}

/// Final outcome of a pull.
#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    /// The archive was written.
    Completed {
        /// Archive path.
        output: PathBuf,
    },
    /// Dry run: nothing was transferred.
    Planned,
    /// The pull failed.
    Failed {
        /// Classified kind.
        kind: ErrorKind,
        /// Remediation message.
        message: String,
    },
}

/// Everything a pull reports while running.
#[derive(Debug, Clone, PartialEq)]
pub enum PullEvent {
    /// The pull moved to a new stage.
    Stage(PullStage),
    /// The retry executor finished an attempt.
    Attempt(AttemptEvent),
    /// A mirror probe completed.
    Probe(ProbeEvent),
    /// A mirror is about to be tried.
    MirrorSelected {
        /// Mirror URL.
        url: String,
        /// Rewritten reference.
        reference: String,
    },
    /// A mirror attempt failed.
    MirrorFailed {
        /// Mirror URL.
        url: String,
        /// Raw error text.
        error: String,
    },
    /// Byte-level transfer progress.
    Progress(TransferProgress),
    /// Free-form message.
    Message {
        /// Severity.
        level: MessageLevel,
        /// Text.
        text: String,
    },
    /// The pull ended.
    Finished(PullOutcome),
}

/// Consumer of pull events.
///
/// `emit` is called on the pulling task, progress events included, so
/// implementations must return quickly and must not call back into the puller.
pub trait EventSink: Send + Sync {
    /// Handles one event.
    fn emit(&self, event: PullEvent);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn emit(&self, event: PullEvent) {
        (**self).emit(event);
    }
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: PullEvent) {}
}

/// Forwards events to `tracing`.
///
/// Mirror and attempt failures are logged at debug level unless verbose.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink {
    verbose: bool,
}

impl TracingSink {
    /// Creates a sink.
    pub const fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: PullEvent) {
        match event {
            PullEvent::Stage(stage) => tracing::debug!(%stage, "Stage"),
            PullEvent::Attempt(AttemptEvent {
                label,
                attempt,
                max_retries,
                outcome: AttemptOutcome::Failed(error),
                delay,
            }) => {
                let delay_ms = delay.map(|d| d.as_millis());
                if self.verbose {
                    tracing::warn!(%label, attempt, max_retries, ?delay_ms, %error, "Attempt failed");
                } else {
                    tracing::debug!(%label, attempt, max_retries, ?delay_ms, %error, "Attempt failed");
                }
            }
            PullEvent::Attempt(AttemptEvent { label, attempt, .. }) => {
                tracing::debug!(%label, attempt, "Attempt succeeded");
            }
            PullEvent::Probe(ProbeEvent {
                url,
                available,
                latency,
                error,
            }) => {
                tracing::info!(
                    %url,
                    available,
                    latency_ms = latency.as_millis(),
                    error = error.as_deref().unwrap_or(""),
                    "Mirror probed"
                );
            }
            PullEvent::MirrorSelected { url, reference } => {
                tracing::info!(%url, %reference, "Trying mirror");
            }
            PullEvent::MirrorFailed { url, error } => {
                if self.verbose {
                    tracing::warn!(%url, %error, "Mirror failed");
                } else {
                    tracing::debug!(%url, %error, "Mirror failed");
                }
            }
            PullEvent::Progress(progress) => {
                tracing::trace!(
                    downloaded = progress.downloaded,
                    total = progress.total,
                    "Progress"
                );
            }
            PullEvent::Message { level, text } => match level {
                MessageLevel::Debug => tracing::debug!("{text}"),
                MessageLevel::Info => tracing::info!("{text}"),
                MessageLevel::Warn => tracing::warn!("{text}"),
            },
            PullEvent::Finished(PullOutcome::Completed { output }) => {
                tracing::info!(output = %output.display(), "Pull completed");
            }
            PullEvent::Finished(PullOutcome::Planned) => tracing::info!("Dry run completed"),
            PullEvent::Finished(PullOutcome::Failed { kind, message }) => {
                tracing::error!(%kind, %message, "Pull failed");
            }
        }
    }
}

/// Hands events to a single consumer over an unbounded channel.
///
/// Emitting never blocks. Events sent after the receiver is dropped are discarded.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PullEvent>,
}

impl ChannelSink {
    /// Creates a sink and the receiver its events arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PullEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: PullEvent) {
        let _ = self.tx.send(event);
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PullEvent>>,
}

impl RecordingSink {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything recorded so far.
    pub fn events(&self) -> Vec<PullEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: PullEvent) {
        self.events.lock().push(event);
    }
}
