//! Mirror availability probes.
//!
//! A mirror is available when an unauthenticated `GET <mirror>/v2/`
//! answers 200 or 401 within [`PROBE_TIMEOUT`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dipt_core::RegistryError;
use url::Url;

/// Deadline for a single probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes of the response body kept by [`HttpProbe::inspect`].
const PREVIEW_BYTES: usize = 512;

/// Result of probing one mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Whether the mirror can be used.
    pub available: bool,
    /// Time until the answer (or failure).
    pub latency: Duration,
    /// HTTP status, if the mirror answered.
    pub status: Option<u16>,
    /// Why the mirror is unavailable.
    pub error: Option<String>,
}

impl ProbeOutcome {
    /// A successful probe.
    pub const fn available(latency: Duration, status: u16) -> Self {
        Self {
            available: true,
            latency,
            status: Some(status),
            error: None,
        }
    }

    /// A failed probe.
    pub fn unavailable(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            available: false,
            latency,
            status: None,
            error: Some(error.into()),
        }
    }
}

/// Checks whether a mirror endpoint is usable.
#[async_trait]
pub trait MirrorProbe: Send + Sync {
    /// Probes `mirror_url`. Never fails; problems are reported as unavailable.
    async fn probe(&self, mirror_url: &str) -> ProbeOutcome;
}

/// Statuses that mean the registry API is served.
pub const fn is_available_status(status: u16) -> bool {
    matches!(status, 200 | 401)
}

/// Capability endpoint of a mirror.
///
/// A missing scheme defaults to `https`.
///
/// # Errors
///
/// Returns the parse error for URLs that cannot be parsed.
///
/// # Examples
///
/// ```
/// use dipt_pull::capability_url;
///
/// assert_eq!(capability_url("mirror.example.com").unwrap().as_str(), "https://mirror.example.com/v2/");
/// assert_eq!(capability_url("http://hub.example.net/").unwrap().as_str(), "http://hub.example.net/v2/");
/// ```
pub fn capability_url(mirror: &str) -> Result<Url, url::ParseError> {
    let mirror = mirror.trim();
    let with_scheme = if mirror.starts_with("http://") || mirror.starts_with("https://") {
        mirror.to_string()
    } else {
        format!("https://{mirror}")
    };
    let base = with_scheme.trim_end_matches('/');
    let base = base.strip_suffix("/v2").unwrap_or(base);
    Url::parse(&format!("{base}/v2/"))
}

/// Detailed answer of a mirror, for diagnostics.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    /// Probed URL.
    pub url: String,
    /// HTTP status.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Start of the response body.
    pub body_preview: String,
    /// Whether the status means the mirror is usable.
    pub available: bool,
}

/// Probes mirrors over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    http: reqwest::Client,
}

impl HttpProbe {
    /// Creates a probe with the standard 5s timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self, RegistryError> {
        Self::with_timeout(PROBE_TIMEOUT)
    }

    /// Creates a probe with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_timeout(timeout: Duration) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("dipt/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    /// Fetches the capability endpoint and returns everything it answered.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the URL is invalid or the request fails.
    pub async fn inspect(&self, mirror_url: &str) -> Result<ProbeReport, RegistryError> {
        let url = capability_url(mirror_url)
            .map_err(|e| RegistryError::Other(format!("invalid mirror URL '{mirror_url}': {e}")))?;
        let response = self.http.get(url.clone()).send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await?;
        let body_preview = String::from_utf8_lossy(&body[..body.len().min(PREVIEW_BYTES)]).into_owned();

        Ok(ProbeReport {
            url: url.to_string(),
            status,
            headers,
            body_preview,
            available: is_available_status(status),
        })
    }
}

#[async_trait]
impl MirrorProbe for HttpProbe {
    async fn probe(&self, mirror_url: &str) -> ProbeOutcome {
        let start = Instant::now();
        let url = match capability_url(mirror_url) {
            Ok(url) => url,
            Err(e) => return ProbeOutcome::unavailable(start.elapsed(), format!("invalid mirror URL: {e}")),
        };

        match self.http.get(url).send().await {
            Ok(response) => {
                let latency = start.elapsed();
                let status = response.status().as_u16();
                if is_available_status(status) {
                    ProbeOutcome::available(latency, status)
                } else {
                    ProbeOutcome {
                        status: Some(status),
                        ..ProbeOutcome::unavailable(latency, format!("unexpected status code: {status}"))
                    }
                }
            }
            Err(e) => ProbeOutcome::unavailable(start.elapsed(), RegistryError::from(e).to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Length: 2\r\nDocker-Distribution-Api-Version: registry/2.0\r\nConnection: close\r\n\r\n{{}}"
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_capability_url_forms() {
        let cases = [
            ("mirror.example.com", "https://mirror.example.com/v2/"),
            ("https://mirror.example.com/", "https://mirror.example.com/v2/"),
            ("https://mirror.example.com/v2/", "https://mirror.example.com/v2/"),
            ("http://hub-mirror.example.net", "http://hub-mirror.example.net/v2/"),
            ("localhost:5000", "https://localhost:5000/v2/"),
        ];
        for (input, expected) in cases {
            assert_eq!(capability_url(input).unwrap().as_str(), expected, "{input}");
        }
        assert!(capability_url("http://exa mple.com").is_err());
    }

    #[test]
    fn test_available_statuses() {
        assert!(is_available_status(200));
        assert!(is_available_status(401));
        assert!(!is_available_status(403));
        assert!(!is_available_status(404));
        assert!(!is_available_status(500));
    }

    #[tokio::test]
    async fn test_probe_unauthorized_is_available() {
        let url = serve_once("401 Unauthorized").await;
        let outcome = HttpProbe::new().unwrap().probe(&url).await;
        assert!(outcome.available, "{outcome:?}");
        assert_eq!(outcome.status, Some(401));
    }

    #[tokio::test]
    async fn test_probe_server_error_is_unavailable() {
        let url = serve_once("503 Service Unavailable").await;
        let outcome = HttpProbe::new().unwrap().probe(&url).await;
        assert!(!outcome.available);
        assert_eq!(outcome.status, Some(503));
        assert!(outcome.error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_probe_refused_connection_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = HttpProbe::new()
            .unwrap()
            .probe(&format!("http://{addr}"))
            .await;
        assert!(!outcome.available);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn test_inspect_reports_headers_and_body() {
        let url = serve_once("200 OK").await;
        let report = HttpProbe::new().unwrap().inspect(&url).await.unwrap();
        assert!(report.available);
        assert_eq!(report.status, 200);
        assert_eq!(report.body_preview, "{}");
        assert!(report
            .headers
            .iter()
            .any(|(k, v)| k == "docker-distribution-api-version" && v == "registry/2.0"));
    }
}
