//! # dipt pull
//!
//! Resilient image pulls on top of a pluggable [`RegistryClient`].
//!
//! ## Features
//!
//! - **Retries**: bounded exponential backoff with jitter ([`with_retry`], [`execute_with_retry`])
//! - **Mirrors**: concurrent availability probes and ordered fallback ([`MirrorManager`])
//! - **Progress**: byte counting on blob streams ([`ProgressTracker`])
//! - **Orchestration**: the staged pull with a single classified failure ([`Puller`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dipt_core::{ConfigLoader, PullOverrides, TracingSink};
//! use dipt_pull::{PullRequest, Puller};
//!
//! let config = ConfigLoader::discover().load()?;
//! let puller = Puller::new(my_registry_client, config)
//!     .with_overrides(PullOverrides::from_env())
//!     .with_sink(Arc::new(TracingSink::new(false)));
//!
//! puller.pull(&PullRequest::new("redis:7")).await?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod backoff;
pub mod error;
pub mod mirror;
pub mod probe;
pub mod progress;
pub mod puller;
pub mod registry;
pub mod retry;

pub use backoff::{BackoffConfig, BackoffConfigBuilder, BackoffConfigError};
pub use error::{PullError, StageError};
pub use mirror::{MirrorCandidate, MirrorError, MirrorManager};
pub use probe::{capability_url, HttpProbe, MirrorProbe, ProbeOutcome, ProbeReport, PROBE_TIMEOUT};
pub use progress::{format_bytes, ProgressCallback, ProgressReader, ProgressTracker, ProgressTransport};
pub use puller::{plan_pull, PullPlan, PullRequest, PullSuccess, Puller};
pub use registry::{
    ByteStream, Descriptor, DirectTransport, LayerDescriptor, RegistryAuth, RegistryClient,
    Transport,
};
pub use retry::{execute_with_retry, with_retry, RetryError, RetryableOperation};
