//! # dipt core
//!
//! Data model shared by the dipt image puller.
//!
//! ## Features
//!
//! - **Image references**: parsing, default-registry normalisation and mirror rewriting
//! - **Error classification**: an ordered signature table mapping raw failures to a closed taxonomy
//! - **Events**: the [`EventSink`] contract every pull component reports through
//! - **Configuration**: user, project and environment layers merged into an [`EffectiveConfig`]
//!
//! ## Example
//!
//! ```
//! use dipt_core::{archive_file_name, ImageReference, Platform};
//!
//! let reference = ImageReference::parse("nginx:1.25").unwrap();
//! assert_eq!(reference.repository(), "library/nginx");
//!
//! let mirrored = reference.with_registry("https://mirror.example.com");
//! assert_eq!(mirrored.to_string(), "mirror.example.com/nginx:1.25");
//!
//! let platform = Platform::new("linux", "arm64");
//! assert_eq!(archive_file_name("nginx:1.25", &platform), "nginx_1.25_linux_arm64.tar");
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod classify;
pub mod config;
pub mod error;
pub mod events;
pub mod reference;

pub use classify::{classify, ClassifiedError, ErrorContext, ErrorKind};
pub use config::{
    ConfigLayer, ConfigLoader, EffectiveConfig, PullOverrides, RegistryLayer, RegistrySettings,
    DEFAULT_PULL_TIMEOUT,
};
pub use error::{ConfigError, Diagnostic, ReferenceError, RegistryError};
pub use events::{
    AttemptEvent, AttemptOutcome, ChannelSink, EventSink, MessageLevel, NoopSink, ProbeEvent,
    PullEvent, PullOutcome, PullStage, RecordingSink, TracingSink, TransferProgress,
};
pub use reference::{
    archive_file_name, is_default_registry_host, Identifier, ImageReference, Platform,
    DEFAULT_REGISTRY, KNOWN_REDIRECTS, SUPPORTED_ARCH, SUPPORTED_OS,
};
