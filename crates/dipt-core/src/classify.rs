//! Failure classification.
//!
//! Maps raw registry-client failures onto a closed set of [`ErrorKind`]s
//! using an ordered signature table. The first matching row wins; the
//! whole `source()` chain of the error is inspected.
//!
//! When the chain holds a [`RegistryError`], only its codes, status and
//! URL-free detail are matched, so repository names never decide the kind.
//! Registry answers are judged by codes and status only.

use std::error::Error as StdError;
use std::fmt;

use crate::error::RegistryError;
use crate::reference::{Platform, KNOWN_REDIRECTS};

/// Closed taxonomy of pull failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The image exists but has no manifest for the requested platform.
    PlatformNotSupported,
    /// The registry answered but does not know the image.
    ImageNotFound,
    /// Authentication was missing or rejected.
    Unauthorized,
    /// The registry could not be reached.
    Network,
    /// Anything that matched no signature.
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PlatformNotSupported => "platform not supported",
            Self::ImageNotFound => "image not found",
            Self::Unauthorized => "unauthorized",
            Self::Network => "network error",
            Self::Unknown => "unknown error",
        };
        f.write_str(name)
    }
}

/// One row of the classification table.
struct Signature {
    kind: ErrorKind,
    /// Registry error codes, compared case-insensitively.
    codes: &'static [&'static str],
    /// HTTP statuses of registry answers.
    statuses: &'static [u16],
    /// Lowercase substrings searched for in every error message of the chain.
    needles: &'static [&'static str],
}

const SIGNATURES: &[Signature] = &[
    Signature {
        kind: ErrorKind::PlatformNotSupported,
        codes: &["MANIFEST_UNKNOWN"],
        statuses: &[],
        needles: &["manifest unknown", "manifest_unknown", "no child with platform"],
    },
    Signature {
        kind: ErrorKind::Unauthorized,
        codes: &["UNAUTHORIZED", "DENIED"],
        statuses: &[401, 403],
        needles: &["unauthorized", "denied", "authentication required"],
    },
    Signature {
        kind: ErrorKind::Network,
        codes: &[],
        statuses: &[],
        needles: &[
            "dial tcp",
            "no such host",
            "connection refused",
            "connection reset",
            "dns error",
            "timed out",
        ],
    },
];

/// Classifies an error.
///
/// Returns `None` when there is no error. Never panics, whatever the
/// message text.
///
/// # Examples
///
/// ```
/// use dipt_core::{classify, Diagnostic, ErrorKind, RegistryError};
///
/// let err = RegistryError::api("https://r/v2/", 404, vec![Diagnostic::new("MANIFEST_UNKNOWN", "")]);
/// assert_eq!(classify(Some(&err)), Some(ErrorKind::PlatformNotSupported));
/// assert_eq!(classify(None), None);
/// ```
pub fn classify(err: Option<&(dyn StdError + 'static)>) -> Option<ErrorKind> {
    let err = err?;

    let mut codes: Vec<String> = Vec::new();
    let mut statuses: Vec<u16> = Vec::new();
    let mut registry_texts: Vec<String> = Vec::new();
    let mut texts: Vec<String> = Vec::new();
    let mut saw_registry = false;
    let mut unreachable = false;
    let mut answered = false;

    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(registry) = e.downcast_ref::<RegistryError>() {
            codes.extend(registry.codes().map(str::to_ascii_uppercase));
            statuses.extend(registry.status());
            saw_registry = true;
            if !registry.is_registry_response() {
                registry_texts.push(registry.detail().to_lowercase());
            }
            unreachable |= registry.is_connection_failure();
            answered |= registry.is_registry_response();
        }
        texts.push(e.to_string().to_lowercase());
        current = e.source();
    }
    if saw_registry {
        texts = registry_texts;
    }

    for signature in SIGNATURES {
        let code_hit = signature
            .codes
            .iter()
            .any(|code| codes.iter().any(|c| c == code));
        let status_hit = signature.statuses.iter().any(|s| statuses.contains(s));
        let text_hit = signature
            .needles
            .iter()
            .any(|needle| texts.iter().any(|t| t.contains(needle)));
        if code_hit || status_hit || text_hit {
            return Some(signature.kind);
        }
    }

    if unreachable {
        Some(ErrorKind::Network)
    } else if answered {
        Some(ErrorKind::ImageNotFound)
    } else {
        Some(ErrorKind::Unknown)
    }
}

/// What was being pulled when a failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Image name as given by the user.
    pub image: String,
    /// Registry host the failure relates to.
    pub registry: String,
    /// Requested platform.
    pub platform: Platform,
}

impl ErrorContext {
    /// Creates a context.
    pub fn new(image: impl Into<String>, registry: impl Into<String>, platform: Platform) -> Self {
        Self {
            image: image.into(),
            registry: registry.into(),
            platform,
        }
    }
}

/// A failure with its kind, a remediation message and the raw cause.
#[derive(Debug)]
pub struct ClassifiedError {
    kind: ErrorKind,
    message: String,
    cause: Box<dyn StdError + Send + Sync>,
}

impl ClassifiedError {
    /// Builds a classified error of a known kind.
    pub fn new(
        kind: ErrorKind,
        context: &ErrorContext,
        cause: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        let cause = cause.into();
        let message = remediation(kind, context, &*cause);
        Self {
            kind,
            message,
            cause,
        }
    }

    /// Classifies `err` and wraps it.
    pub fn from_error<E>(err: E, context: &ErrorContext) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let kind = classify(Some(&err)).unwrap_or(ErrorKind::Unknown);
        Self::new(kind, context, err)
    }

    /// The failure kind.
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human readable message with remediation.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The raw failure.
    pub fn cause(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.cause
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for ClassifiedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.cause)
    }
}

const GHCR_HOST: &str = "ghcr.io";

fn is_ghcr(registry: &str, image: &str) -> bool {
    registry == GHCR_HOST
        || image.contains(GHCR_HOST)
        || KNOWN_REDIRECTS
            .iter()
            .any(|(from, to)| *to == GHCR_HOST && image.contains(from))
}

fn remediation(kind: ErrorKind, ctx: &ErrorContext, cause: &dyn StdError) -> String {
    let ErrorContext {
        image,
        registry,
        platform,
    } = ctx;
    match kind {
        ErrorKind::PlatformNotSupported => format!(
            "image {image} has no variant for platform {platform}; \
             pick another os/arch the image is published for"
        ),
        ErrorKind::ImageNotFound => format!(
            "image {image} was not found on {registry}; \
             check the repository name and tag"
        ),
        ErrorKind::Unauthorized if is_ghcr(registry, image) => format!(
            "access to {image} was denied by GitHub Container Registry; \
             set the registry username to your GitHub user and the password \
             to a personal access token with the read:packages scope"
        ),
        ErrorKind::Unauthorized => format!(
            "access to {image} was denied by {registry}; \
             set registry.username and registry.password or log in to the registry"
        ),
        ErrorKind::Network => format!(
            "could not reach {registry} while pulling {image}; \
             check network connectivity or configure a registry mirror"
        ),
        ErrorKind::Unknown => format!("pulling {image} failed: {cause}"),
    }
}
