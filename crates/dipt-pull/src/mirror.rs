//! Mirror candidates, probing and fallback.
//!
//! The candidate list sits behind one read/write lock. Probing takes a
//! snapshot under the read lock, runs every probe concurrently, then applies
//! all results under a single write lock. Adding candidates needs `&mut self`,
//! so the list cannot change while a probe round or a fallback run is in flight.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dipt_core::{EventSink, ImageReference, MessageLevel, NoopSink, ProbeEvent, PullEvent};
use futures::future::join_all;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::probe::{MirrorProbe, ProbeOutcome, PROBE_TIMEOUT};

/// A configured mirror endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorCandidate {
    /// Mirror URL as configured.
    pub url: String,
    /// Result of the last probe. Candidates start out available.
    pub available: bool,
    /// Latency of the last probe.
    pub latency: Option<Duration>,
    /// When the last probe finished.
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Try order; lower first.
    pub priority: u32,
}

impl MirrorCandidate {
    fn new(url: impl Into<String>, priority: u32) -> Self {
        Self {
            url: url.into(),
            available: true,
            latency: None,
            last_checked_at: None,
            priority,
        }
    }
}

/// Failure of [`MirrorManager::try_with_fallback`].
#[derive(Debug, Error)]
pub enum MirrorError<E> {
    /// No mirror was available; the single attempt against the origin failed.
    #[error("{source}")]
    Origin {
        /// Origin failure.
        #[source]
        source: E,
    },

    /// Every available mirror failed, then the origin failed too.
    #[error("all mirrors failed (last: {last_mirror}: {mirror_error}); origin: {origin}")]
    Exhausted {
        /// URL of the last mirror tried.
        last_mirror: String,
        /// Error from that mirror.
        mirror_error: E,
        /// Error from the final origin attempt.
        #[source]
        origin: E,
    },

    /// A mirror attempt failed in a way that rules out any further attempt.
    #[error("{mirror}: {source}")]
    Fatal {
        /// Mirror the failure happened on.
        mirror: String,
        /// The failure.
        #[source]
        source: E,
    },
}

impl<E> MirrorError<E> {
    /// The last error of the run: the origin failure, or the fatal mirror failure.
    pub fn into_last(self) -> E {
        match self {
            Self::Origin { source } | Self::Fatal { source, .. } => source,
            Self::Exhausted { origin, .. } => origin,
        }
    }

    /// The last mirror failure, if any mirror was tried.
    pub const fn last_mirror_error(&self) -> Option<(&String, &E)> {
        match self {
            Self::Origin { .. } => None,
            Self::Exhausted {
                last_mirror,
                mirror_error,
                ..
            } => Some((last_mirror, mirror_error)),
            Self::Fatal { mirror, source } => Some((mirror, source)),
        }
    }
}

/// Ordered mirror endpoints with probing and fallback.
pub struct MirrorManager {
    candidates: RwLock<Vec<MirrorCandidate>>,
    probe: Arc<dyn MirrorProbe>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for MirrorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorManager")
            .field("candidates", &*self.candidates.read())
            .finish_non_exhaustive()
    }
}

impl MirrorManager {
    /// Creates an empty manager.
    pub fn new(probe: Arc<dyn MirrorProbe>) -> Self {
        Self {
            candidates: RwLock::new(Vec::new()),
            probe,
            sink: Arc::new(NoopSink),
        }
    }

    /// Creates a manager with `urls` in priority order.
    pub fn with_mirrors<I, S>(urls: I, probe: Arc<dyn MirrorProbe>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut manager = Self::new(probe);
        for url in urls {
            manager.add_mirror(url);
        }
        manager
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Appends a mirror with priority equal to its insertion index.
    pub fn add_mirror(&mut self, url: impl Into<String>) {
        let priority = u32::try_from(self.candidates.get_mut().len()).unwrap_or(u32::MAX);
        self.add_mirror_with_priority(url, priority);
    }

    /// Adds a mirror, or updates the priority of an existing one.
    pub fn add_mirror_with_priority(&mut self, url: impl Into<String>, priority: u32) {
        let url = url.into();
        let candidates = self.candidates.get_mut();
        if let Some(existing) = candidates.iter_mut().find(|c| c.url == url) {
            existing.priority = priority;
        } else {
            candidates.push(MirrorCandidate::new(url, priority));
        }
    }

    /// Number of configured mirrors.
    pub fn len(&self) -> usize {
        self.candidates.read().len()
    }

    /// Returns true without mirrors.
    pub fn is_empty(&self) -> bool {
        self.candidates.read().is_empty()
    }

    /// Snapshot of all candidates in insertion order.
    pub fn candidates(&self) -> Vec<MirrorCandidate> {
        self.candidates.read().clone()
    }

    /// Probes every candidate concurrently and records the results.
    ///
    /// Each probe is bounded by [`PROBE_TIMEOUT`]. Returns the number of
    /// available mirrors.
    pub async fn probe_all(&self) -> usize {
        let urls: Vec<String> = self
            .candidates
            .read()
            .iter()
            .map(|c| c.url.clone())
            .collect();

        let outcomes = join_all(urls.iter().map(|url| async move {
            let started = std::time::Instant::now();
            match tokio::time::timeout(PROBE_TIMEOUT, self.probe.probe(url)).await {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome::unavailable(started.elapsed(), "probe timed out"),
            }
        }))
        .await;

        let checked_at = Utc::now();
        {
            let mut candidates = self.candidates.write();
            for (candidate, outcome) in candidates.iter_mut().zip(&outcomes) {
                candidate.available = outcome.available;
                candidate.latency = Some(outcome.latency);
                candidate.last_checked_at = Some(checked_at);
            }
        }

        for (url, outcome) in urls.into_iter().zip(outcomes.iter()) {
            self.sink.emit(PullEvent::Probe(ProbeEvent {
                url,
                available: outcome.available,
                latency: outcome.latency,
                error: outcome.error.clone(),
            }));
        }

        outcomes.iter().filter(|o| o.available).count()
    }

    /// Available mirrors by ascending priority, ties by ascending latency.
    pub fn available_sorted(&self) -> Vec<MirrorCandidate> {
        let mut available: Vec<MirrorCandidate> = self
            .candidates
            .read()
            .iter()
            .filter(|c| c.available)
            .cloned()
            .collect();
        available.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.latency.unwrap_or(Duration::MAX).cmp(&b.latency.unwrap_or(Duration::MAX)))
        });
        available
    }

    // Cleared by the next probe round.
    fn mark_unavailable(&self, url: &str) {
        if let Some(candidate) = self.candidates.write().iter_mut().find(|c| c.url == url) {
            candidate.available = false;
        }
    }

    /// Probes, then runs `attempt` against each available mirror until one succeeds.
    ///
    /// `attempt` receives the reference to pull and the mirror URL, or `None`
    /// for the origin. Without available mirrors the origin is tried once.
    /// When every mirror fails the origin is tried once more at the end.
    /// A mirror that fails is not retried within the same call.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::Origin`] if no mirror was available and the
    /// origin failed, or [`MirrorError::Exhausted`] if every mirror and the
    /// origin failed.
    pub async fn try_with_fallback<T, E, F, Fut>(
        &self,
        reference: &ImageReference,
        attempt: F,
    ) -> Result<T, MirrorError<E>>
    where
        F: FnMut(ImageReference, Option<String>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.try_with_fallback_unless(reference, |_| false, attempt)
            .await
    }

    /// Like [`try_with_fallback`](Self::try_with_fallback), but a mirror
    /// failure for which `is_fatal` holds ends the run at once: no further
    /// mirror and no origin attempt follow.
    ///
    /// # Errors
    ///
    /// As [`try_with_fallback`](Self::try_with_fallback), plus
    /// [`MirrorError::Fatal`] for a fatal mirror failure.
    pub async fn try_with_fallback_unless<T, E, P, F, Fut>(
        &self,
        reference: &ImageReference,
        is_fatal: P,
        mut attempt: F,
    ) -> Result<T, MirrorError<E>>
    where
        P: Fn(&E) -> bool,
        F: FnMut(ImageReference, Option<String>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.probe_all().await;
        let available = self.available_sorted();

        if available.is_empty() {
            self.sink.emit(PullEvent::Message {
                level: MessageLevel::Warn,
                text: "no mirror available, using the origin registry".to_string(),
            });
            return attempt(reference.clone(), None)
                .await
                .map_err(|source| MirrorError::Origin { source });
        }

        let mut last_failure: Option<(String, E)> = None;
        for candidate in available {
            let rewritten = reference.with_registry(&candidate.url);
            self.sink.emit(PullEvent::MirrorSelected {
                url: candidate.url.clone(),
                reference: rewritten.to_string(),
            });

            match attempt(rewritten, Some(candidate.url.clone())).await {
                Ok(value) => {
                    debug!(mirror = %candidate.url, "Mirror succeeded");
                    return Ok(value);
                }
                Err(e) => {
                    self.mark_unavailable(&candidate.url);
                    self.sink.emit(PullEvent::MirrorFailed {
                        url: candidate.url.clone(),
                        error: e.to_string(),
                    });
                    if is_fatal(&e) {
                        return Err(MirrorError::Fatal {
                            mirror: candidate.url,
                            source: e,
                        });
                    }
                    last_failure = Some((candidate.url, e));
                }
            }
        }

        self.sink.emit(PullEvent::Message {
            level: MessageLevel::Warn,
            text: "all mirrors failed, using the origin registry".to_string(),
        });
        match attempt(reference.clone(), None).await {
            Ok(value) => Ok(value),
            Err(origin) => Err(match last_failure {
                Some((last_mirror, mirror_error)) => MirrorError::Exhausted {
                    last_mirror,
                    mirror_error,
                    origin,
                },
                None => MirrorError::Origin { source: origin },
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dipt_core::RecordingSink;
    use std::collections::HashMap;

    struct TableProbe {
        answers: HashMap<String, (bool, Duration)>,
    }

    impl TableProbe {
        fn new(entries: &[(&str, bool, u64)]) -> Arc<Self> {
            Arc::new(Self {
                answers: entries
                    .iter()
                    .map(|(url, ok, ms)| ((*url).to_string(), (*ok, Duration::from_millis(*ms))))
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl MirrorProbe for TableProbe {
        async fn probe(&self, mirror_url: &str) -> ProbeOutcome {
            match self.answers.get(mirror_url) {
                Some((true, latency)) => ProbeOutcome::available(*latency, 200),
                Some((false, latency)) => ProbeOutcome::unavailable(*latency, "503"),
                None => ProbeOutcome::unavailable(Duration::ZERO, "unknown mirror"),
            }
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl MirrorProbe for HangingProbe {
        async fn probe(&self, _mirror_url: &str) -> ProbeOutcome {
            std::future::pending().await
        }
    }

    fn nginx() -> ImageReference {
        ImageReference::parse("nginx:latest").unwrap()
    }

    #[tokio::test]
    async fn test_probe_all_records_results() {
        let probe = TableProbe::new(&[("https://a.example", true, 30), ("https://b.example", false, 10)]);
        let sink = Arc::new(RecordingSink::new());
        let manager = MirrorManager::with_mirrors(["https://a.example", "https://b.example"], probe)
            .with_sink(sink.clone());

        assert_eq!(manager.probe_all().await, 1);

        let candidates = manager.candidates();
        assert!(candidates[0].available);
        assert!(!candidates[1].available);
        assert_eq!(candidates[0].latency, Some(Duration::from_millis(30)));
        assert!(candidates.iter().all(|c| c.last_checked_at.is_some()));

        let probes = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, PullEvent::Probe(_)))
            .count();
        assert_eq!(probes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_marks_unavailable() {
        let manager = MirrorManager::with_mirrors(["https://slow.example"], Arc::new(HangingProbe));
        assert_eq!(manager.probe_all().await, 0);
        assert!(!manager.candidates()[0].available);
    }

    #[tokio::test]
    async fn test_available_sorted_by_priority_then_latency() {
        let probe = TableProbe::new(&[
            ("https://a.example", true, 50),
            ("https://b.example", true, 10),
            ("https://c.example", false, 1),
            ("https://d.example", true, 5),
        ]);
        let mut manager = MirrorManager::new(probe);
        manager.add_mirror_with_priority("https://a.example", 1);
        manager.add_mirror_with_priority("https://b.example", 1);
        manager.add_mirror_with_priority("https://c.example", 0);
        manager.add_mirror_with_priority("https://d.example", 2);
        manager.probe_all().await;

        let order: Vec<String> = manager.available_sorted().into_iter().map(|c| c.url).collect();
        assert_eq!(order, vec!["https://b.example", "https://a.example", "https://d.example"]);
    }

    #[test]
    fn test_add_existing_mirror_updates_priority() {
        let mut manager = MirrorManager::new(TableProbe::new(&[]));
        manager.add_mirror("https://a.example");
        manager.add_mirror("https://b.example");
        manager.add_mirror_with_priority("https://a.example", 9);
        let candidates = manager.candidates();
        assert_eq!(manager.len(), 2);
        assert_eq!(candidates[0].priority, 9);
        assert_eq!(candidates[1].priority, 1);
    }

    #[tokio::test]
    async fn test_only_available_mirror_is_attempted_once() {
        let probe = TableProbe::new(&[
            ("https://a.example", false, 10),
            ("https://b.example", true, 10),
            ("https://c.example", false, 10),
        ]);
        let manager = MirrorManager::with_mirrors(
            ["https://a.example", "https://b.example", "https://c.example"],
            probe,
        );

        let mut calls = Vec::new();
        let result: Result<String, MirrorError<String>> = manager
            .try_with_fallback(&nginx(), |reference, mirror| {
                calls.push((reference.to_string(), mirror.clone()));
                async move { Ok(reference.to_string()) }
            })
            .await;

        assert_eq!(result.unwrap(), "b.example/nginx:latest");
        assert_eq!(
            calls,
            vec![("b.example/nginx:latest".to_string(), Some("https://b.example".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_no_available_mirror_tries_origin_once() {
        let probe = TableProbe::new(&[("https://a.example", false, 10)]);
        let manager = MirrorManager::with_mirrors(["https://a.example"], probe);

        let mut calls = Vec::new();
        let result: Result<(), MirrorError<String>> = manager
            .try_with_fallback(&nginx(), |reference, mirror| {
                calls.push((reference.registry().to_string(), mirror));
                async { Err("origin down".to_string()) }
            })
            .await;

        assert_eq!(calls, vec![("index.docker.io".to_string(), None)]);
        assert!(matches!(result, Err(MirrorError::Origin { .. })));
    }

    #[tokio::test]
    async fn test_all_failures_aggregate_last_mirror() {
        let probe = TableProbe::new(&[("https://a.example", true, 10), ("https://b.example", true, 20)]);
        let sink = Arc::new(RecordingSink::new());
        let manager = MirrorManager::with_mirrors(["https://a.example", "https://b.example"], probe)
            .with_sink(sink.clone());

        let mut attempts = 0;
        let result: Result<(), MirrorError<String>> = manager
            .try_with_fallback(&nginx(), |reference, _mirror| {
                attempts += 1;
                async move { Err(format!("{} refused", reference.registry())) }
            })
            .await;

        assert_eq!(attempts, 3);
        assert!(manager.available_sorted().is_empty());
        let err = result.unwrap_err();
        let (last_mirror, mirror_error) = err.last_mirror_error().unwrap();
        assert_eq!(last_mirror, "https://b.example");
        assert_eq!(mirror_error, "b.example refused");
        assert!(err.to_string().contains("https://b.example"));
        assert_eq!(err.into_last(), "index.docker.io refused");

        let failed = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, PullEvent::MirrorFailed { .. }))
            .count();
        assert_eq!(failed, 2);
    }

    #[tokio::test]
    async fn test_fallback_to_origin_after_mirror_failure() {
        let probe = TableProbe::new(&[("https://a.example", true, 10)]);
        let manager = MirrorManager::with_mirrors(["https://a.example"], probe);

        let result: Result<&str, MirrorError<String>> = manager
            .try_with_fallback(&nginx(), |_reference, mirror| async move {
                match mirror {
                    Some(_) => Err("mirror broken".to_string()),
                    None => Ok("origin"),
                }
            })
            .await;
        assert_eq!(result.unwrap(), "origin");
    }

    #[tokio::test]
    async fn test_fatal_mirror_failure_stops_the_run() {
        let probe = TableProbe::new(&[("https://a.example", true, 10), ("https://b.example", true, 20)]);
        let manager = MirrorManager::with_mirrors(["https://a.example", "https://b.example"], probe);

        let mut calls = Vec::new();
        let result: Result<(), MirrorError<String>> = manager
            .try_with_fallback_unless(
                &nginx(),
                |e: &String| e.starts_with("fatal"),
                |_reference, mirror| {
                    calls.push(mirror);
                    async { Err("fatal: disk full".to_string()) }
                },
            )
            .await;

        assert_eq!(calls, vec![Some("https://a.example".to_string())]);
        let err = result.unwrap_err();
        assert!(matches!(err, MirrorError::Fatal { ref mirror, .. } if mirror == "https://a.example"));
        assert_eq!(err.into_last(), "fatal: disk full");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_mirrors_share_one_timeout() {
        let urls: Vec<String> = (0..6).map(|i| format!("https://m{i}.example")).collect();
        let manager = MirrorManager::with_mirrors(urls, Arc::new(HangingProbe));

        let start = tokio::time::Instant::now();
        assert_eq!(manager.probe_all().await, 0);
        let elapsed = start.elapsed();
        assert!(elapsed >= PROBE_TIMEOUT);
        assert!(elapsed < PROBE_TIMEOUT + Duration::from_millis(10));
        assert!(manager.candidates().iter().all(|c| !c.available));
    }
}
