//! Image references and target platforms.

use std::fmt;
use std::str::FromStr;

use crate::error::ReferenceError;

/// Canonical host of the default public registry.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Host names that all denote the default public registry.
const DEFAULT_REGISTRY_ALIASES: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];

/// Implicit namespace of official images on the default registry.
const IMPLICIT_NAMESPACE: &str = "library/";

const DEFAULT_TAG: &str = "latest";

/// Registries known to redirect pulls elsewhere, as `(from, to)` hosts.
pub const KNOWN_REDIRECTS: &[(&str, &str)] = &[("docker.dragonflydb.io", "ghcr.io")];

/// Tag or digest part of a reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// A mutable tag such as `latest`.
    Tag(String),
    /// A content digest such as `sha256:abc...`.
    Digest(String),
}

impl Identifier {
    /// Returns the raw identifier string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tag(t) | Self::Digest(t) => t,
        }
    }

    /// Returns true for digest identifiers.
    pub const fn is_digest(&self) -> bool {
        matches!(self, Self::Digest(_))
    }
}

/// A parsed image reference: registry host, repository path and tag or digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    identifier: Identifier,
}

impl ImageReference {
    /// Parses a raw image name.
    ///
    /// Supported forms:
    /// - `nginx`, `nginx:1.25`
    /// - `bitnami/redis:7`
    /// - `ghcr.io/org/app:v1`
    /// - `localhost:5000/app@sha256:...`
    ///
    /// # Errors
    ///
    /// Returns [`ReferenceError`] for empty or malformed input.
    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        let input = raw.trim();
        if input.is_empty() {
            return Err(ReferenceError::new(raw, "empty image reference"));
        }
        if input.chars().any(char::is_whitespace) {
            return Err(ReferenceError::new(raw, "reference contains whitespace"));
        }

        let (name, identifier) = if let Some((name, digest)) = input.split_once('@') {
            validate_digest(raw, digest)?;
            // The digest pins the image; a tag next to it is checked, then dropped.
            let (name, _) = split_tag(raw, name)?;
            (name, Identifier::Digest(digest.to_string()))
        } else {
            match split_tag(raw, input)? {
                (name, Some(tag)) => (name, Identifier::Tag(tag.to_string())),
                (name, None) => (name, Identifier::Tag(DEFAULT_TAG.to_string())),
            }
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if looks_like_host(first) => (first.to_string(), rest.to_string()),
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        let registry = if is_default_registry_host(&registry) {
            DEFAULT_REGISTRY.to_string()
        } else {
            registry
        };

        validate_repository(raw, &repository)?;

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("{IMPLICIT_NAMESPACE}{repository}")
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
            identifier,
        })
    }

    /// Registry host (e.g. `index.docker.io`, `ghcr.io`, `localhost:5000`).
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path (e.g. `library/nginx`).
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Tag or digest.
    pub const fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// Returns true if this reference targets the default public registry.
    pub fn is_default_registry(&self) -> bool {
        is_default_registry_host(&self.registry)
    }

    /// Rewrites the registry host to a mirror endpoint.
    ///
    /// The scheme and trailing slash of `mirror_url` are dropped, the
    /// repository path and tag or digest are kept, and the implicit
    /// `library/` namespace of the default registry is stripped.
    #[must_use]
    pub fn with_registry(&self, mirror_url: &str) -> Self {
        let host = mirror_url
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        let repository = self
            .repository
            .strip_prefix(IMPLICIT_NAMESPACE)
            .unwrap_or(&self.repository);

        Self {
            registry: host.to_string(),
            repository: repository.to_string(),
            identifier: self.identifier.clone(),
        }
    }

    /// Returns a copy pointing at another registry host without touching the repository.
    #[must_use]
    pub fn with_host(&self, host: &str) -> Self {
        Self {
            registry: host.to_string(),
            repository: self.repository.clone(),
            identifier: self.identifier.clone(),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Identifier::Tag(tag) => write!(f, "{}/{}:{tag}", self.registry, self.repository),
            Identifier::Digest(digest) => {
                write!(f, "{}/{}@{digest}", self.registry, self.repository)
            }
        }
    }
}

impl FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Returns true for host names of the default public registry.
pub fn is_default_registry_host(host: &str) -> bool {
    DEFAULT_REGISTRY_ALIASES.contains(&host)
}

/// Splits `name:tag` into its parts.
fn split_tag<'a>(raw: &str, input: &'a str) -> Result<(&'a str, Option<&'a str>), ReferenceError> {
    // A tag colon always comes after the last '/', otherwise it is a port.
    let last_slash = input.rfind('/').map_or(0, |p| p + 1);
    match input.rfind(':') {
        Some(colon) if colon >= last_slash => {
            let tag = &input[colon + 1..];
            validate_tag(raw, tag)?;
            Ok((&input[..colon], Some(tag)))
        }
        _ => Ok((input, None)),
    }
}

fn looks_like_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn validate_repository(raw: &str, repository: &str) -> Result<(), ReferenceError> {
    if repository.is_empty() {
        return Err(ReferenceError::new(raw, "missing repository"));
    }
    for segment in repository.split('/') {
        if segment.is_empty() {
            return Err(ReferenceError::new(raw, "empty path segment"));
        }
        let valid = segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(ReferenceError::new(
                raw,
                format!("invalid repository segment '{segment}'"),
            ));
        }
        if !segment.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(ReferenceError::new(
                raw,
                format!("repository segment '{segment}' must start with a letter or digit"),
            ));
        }
    }
    Ok(())
}

fn validate_tag(raw: &str, tag: &str) -> Result<(), ReferenceError> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        && !tag.starts_with(['.', '-']);
    if valid {
        Ok(())
    } else {
        Err(ReferenceError::new(raw, format!("invalid tag '{tag}'")))
    }
}

fn validate_digest(raw: &str, digest: &str) -> Result<(), ReferenceError> {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return Err(ReferenceError::new(raw, "digest must be <algorithm>:<hex>"));
    };
    if algorithm.is_empty() || hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ReferenceError::new(raw, format!("invalid digest '{digest}'")));
    }
    Ok(())
}

/// Operating systems accepted as defaults.
pub const SUPPORTED_OS: &[&str] = &["linux", "windows", "darwin"];

/// Architectures accepted as defaults.
pub const SUPPORTED_ARCH: &[&str] = &["amd64", "arm64", "arm", "386"];

/// Target platform used to select a manifest variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Platform {
    /// Operating system (e.g. `linux`).
    pub os: String,
    /// CPU architecture (e.g. `amd64`).
    pub architecture: String,
}

impl Platform {
    /// Creates a platform.
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
        }
    }

    /// Platform of the running host, in registry naming.
    pub fn host() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Self::new(os, architecture)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

/// Derives the archive file name for an image and platform.
///
/// `bitnami/redis:7` on `linux/amd64` becomes `bitnami_redis_7_linux_amd64.tar`.
pub fn archive_file_name(image: &str, platform: &Platform) -> String {
    let image = image.trim();
    let (name, version) = if let Some((name, digest)) = image.split_once('@') {
        (name, digest.replace(':', "_"))
    } else {
        let last_slash = image.rfind('/').map_or(0, |p| p + 1);
        match image.rfind(':') {
            Some(colon) if colon >= last_slash => (&image[..colon], image[colon + 1..].to_string()),
            _ => (image, DEFAULT_TAG.to_string()),
        }
    };
    let name = name.replace(['/', ':'], "_");
    format!(
        "{name}_{version}_{}_{}.tar",
        platform.os, platform.architecture
    )
}
