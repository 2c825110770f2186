//! Error types for pulls.

use std::time::Duration;

use dipt_core::{classify, ErrorKind, PullStage, ReferenceError, RegistryError};
use thiserror::Error;

use crate::mirror::MirrorError;
use crate::retry::RetryError;

/// A registry client failure tagged with the stage it happened in.
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct StageError {
    /// Stage that failed.
    pub stage: PullStage,
    /// Raw client error.
    #[source]
    pub source: RegistryError,
}

impl StageError {
    /// Creates a stage error.
    pub const fn new(stage: PullStage, source: RegistryError) -> Self {
        Self { stage, source }
    }

    /// Returns true if the failure happened while writing the archive.
    pub fn is_persist(&self) -> bool {
        self.stage == PullStage::Persist
    }
}

/// Raw pull failure, before classification.
#[derive(Debug, Error)]
pub enum PullError {
    /// The image name could not be parsed.
    #[error(transparent)]
    Reference(#[from] ReferenceError),

    /// A stage failed outside the retry executor.
    #[error(transparent)]
    Stage(#[from] StageError),

    /// A retried stage ran out of attempts or was aborted.
    #[error(transparent)]
    Retry(#[from] RetryError<StageError>),

    /// The mirror run failed, origin attempt included.
    #[error(transparent)]
    Mirror(Box<MirrorError<PullError>>),

    /// The overall deadline expired; the in-flight request was dropped.
    #[error("pull did not finish within {}s: {source}", .after.as_secs())]
    TimedOut {
        /// Configured deadline.
        after: Duration,
        /// Timeout description.
        #[source]
        source: RegistryError,
    },

    /// The mirror probe client could not be created.
    #[error("failed to create mirror probe client: {0}")]
    Probe(#[source] RegistryError),
}

impl From<MirrorError<Self>> for PullError {
    fn from(err: MirrorError<Self>) -> Self {
        Self::Mirror(Box::new(err))
    }
}

impl PullError {
    /// Creates a timeout error for an overall deadline.
    pub fn timed_out(after: Duration, image: &str) -> Self {
        Self::TimedOut {
            after,
            source: RegistryError::timeout(format!("pull of {image}")),
        }
    }

    /// Returns true if the failure happened while writing the archive.
    pub fn is_persist(&self) -> bool {
        match self {
            Self::Stage(err) => err.is_persist(),
            Self::Retry(err) => err.last_error().is_persist(),
            _ => false,
        }
    }

    /// Classifies the failure.
    ///
    /// Malformed references count as not found and deadline expiry as a
    /// network failure. For mirror runs the last error of the run decides.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Reference(_) => ErrorKind::ImageNotFound,
            Self::TimedOut { .. } => ErrorKind::Network,
            Self::Mirror(mirror) => match mirror.as_ref() {
                MirrorError::Origin { source }
                | MirrorError::Fatal { source, .. }
                | MirrorError::Exhausted { origin: source, .. } => source.kind(),
            },
            other => classify(Some(other)).unwrap_or(ErrorKind::Unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dipt_core::Diagnostic;

    fn unauthorized() -> RegistryError {
        RegistryError::api("u", 401, vec![Diagnostic::new("UNAUTHORIZED", "")])
    }

    #[test]
    fn test_reference_error_is_not_found() {
        let err = PullError::from(ReferenceError::new("Bad", "uppercase"));
        assert_eq!(err.kind(), ErrorKind::ImageNotFound);
    }

    #[test]
    fn test_timeout_is_network() {
        let err = PullError::timed_out(Duration::from_secs(120), "nginx");
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(err.to_string().contains("120s"));
    }

    #[test]
    fn test_retry_chain_is_classified() {
        let err = PullError::from(RetryError::Exhausted {
            label: "fetch-metadata".into(),
            retries: 3,
            source: StageError::new(PullStage::FetchMetadata, unauthorized()),
        });
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn test_mirror_run_uses_origin_error() {
        let mirror_error = PullError::from(StageError::new(PullStage::FetchMetadata, unauthorized()));
        let origin = PullError::from(StageError::new(
            PullStage::FetchMetadata,
            RegistryError::connection("index.docker.io", "connection refused"),
        ));
        let err = PullError::from(MirrorError::Exhausted {
            last_mirror: "https://m.example".into(),
            mirror_error,
            origin,
        });
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(err.to_string().contains("https://m.example"));
    }

    #[test]
    fn test_persist_stage() {
        let err = StageError::new(PullStage::Persist, RegistryError::Other("disk full".into()));
        assert!(err.is_persist());
        assert_eq!(err.to_string(), "persist failed: disk full");
    }

    #[test]
    fn test_persist_failure_seen_through_retry() {
        let direct = PullError::from(StageError::new(
            PullStage::Persist,
            RegistryError::Other("disk full".into()),
        ));
        assert!(direct.is_persist());

        let retried = PullError::from(RetryError::Aborted {
            label: "pull via https://m.example".into(),
            attempt: 0,
            source: StageError::new(PullStage::Persist, RegistryError::Other("disk full".into())),
        });
        assert!(retried.is_persist());

        let fetch = PullError::from(StageError::new(PullStage::FetchMetadata, unauthorized()));
        assert!(!fetch.is_persist());
    }
}
