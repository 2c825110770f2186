//! Registry client contract.
//!
//! The wire protocol (auth handshake, manifest negotiation, digest
//! verification, archive serialization) lives behind [`RegistryClient`].
//! The puller only decides which reference, credentials and transport each
//! call gets.

use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dipt_core::{EffectiveConfig, ImageReference, Platform, RegistryError};
use tokio::io::AsyncRead;

/// Credentials presented to a registry.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum RegistryAuth {
    /// No credentials.
    #[default]
    Anonymous,

    /// Username and password (or token).
    Basic {
        /// Username.
        username: String,
        /// Password or token.
        password: String,
    },
}

impl RegistryAuth {
    /// Creates basic authentication.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Basic auth when both username and password are configured, anonymous otherwise.
    pub fn from_config(config: &EffectiveConfig) -> Self {
        match (&config.registry.username, &config.registry.password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Self::basic(username, password)
            }
            _ => Self::Anonymous,
        }
    }

    /// Returns true for anonymous access.
    pub const fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// One layer entry of an image manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    /// Layer media type.
    pub media_type: String,
    /// Content digest.
    pub digest: String,
    /// Compressed size in bytes.
    pub size: u64,
}

impl LayerDescriptor {
    /// Creates a layer descriptor.
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
        }
    }

    /// Foreign and non-distributable layers are never downloaded.
    pub fn is_distributable(&self) -> bool {
        !(self.media_type.contains(".foreign.") || self.media_type.contains(".nondistributable."))
    }
}

/// Resolved image metadata for one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Manifest digest.
    pub digest: String,
    /// Config blob size in bytes.
    pub config_size: u64,
    /// Layers in manifest order.
    pub layers: Vec<LayerDescriptor>,
}

impl Descriptor {
    /// Bytes expected on the wire: the config blob plus every distributable layer.
    pub fn transfer_size(&self) -> u64 {
        self.layers
            .iter()
            .filter(|l| l.is_distributable())
            .fold(self.config_size, |total, l| total.saturating_add(l.size))
    }
}

/// Response body stream.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Hook applied to every response body the client reads.
///
/// Clients must pass each body through [`Transport::intercept`] together
/// with the request path, before consuming it.
pub trait Transport: Send + Sync {
    /// Returns the stream to read in place of `body`.
    fn intercept(&self, path: &str, body: ByteStream) -> ByteStream;
}

/// Leaves bodies untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectTransport;

impl Transport for DirectTransport {
    fn intercept(&self, _path: &str, body: ByteStream) -> ByteStream {
        body
    }
}

/// Registry protocol implementation consumed by the puller.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetched image content, handed to [`RegistryClient::write_archive`].
    ///
    /// Content may be lazy and keep reading through the transport it was
    /// fetched with until the archive is written.
    type Content: Send;

    /// Resolves the manifest for `platform`.
    async fn get_metadata(
        &self,
        reference: &ImageReference,
        auth: &RegistryAuth,
        platform: &Platform,
        transport: Arc<dyn Transport>,
    ) -> Result<Descriptor, RegistryError>;

    /// Fetches image content, reading bodies through `transport`.
    async fn get_content(
        &self,
        reference: &ImageReference,
        auth: &RegistryAuth,
        platform: &Platform,
        transport: Arc<dyn Transport>,
    ) -> Result<Self::Content, RegistryError>;

    /// Writes `content` as an archive at `path`.
    async fn write_archive(
        &self,
        path: &Path,
        reference: &ImageReference,
        content: Self::Content,
    ) -> Result<(), RegistryError>;
}
