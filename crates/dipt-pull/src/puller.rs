//! Pull orchestration.
//!
//! A pull walks `ResolveReference -> SelectAuth -> (MaybeMirror) ->
//! FetchMetadata -> FetchContent -> Persist -> Done`, or ends in `Failed`
//! from any step. Failures are classified exactly once, here.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dipt_core::{
    archive_file_name, classify, ClassifiedError, EffectiveConfig, ErrorContext, ErrorKind,
    EventSink, ImageReference, MessageLevel, NoopSink, Platform, PullEvent, PullOutcome,
    PullOverrides, PullStage, ReferenceError, KNOWN_REDIRECTS,
};

use crate::backoff::BackoffConfig;
use crate::error::{PullError, StageError};
use crate::mirror::MirrorManager;
use crate::probe::{HttpProbe, MirrorProbe};
use crate::progress::{format_bytes, ProgressTracker};
use crate::registry::{Descriptor, DirectTransport, RegistryAuth, RegistryClient};
use crate::retry::{execute_with_retry, RetryableOperation};

/// What to pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    /// Image name as typed by the user.
    pub image: String,
    /// Target platform; the configured default when unset.
    pub platform: Option<Platform>,
    /// Archive path; derived from the image name when unset.
    pub output: Option<PathBuf>,
}

impl PullRequest {
    /// Creates a request for `image`.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            platform: None,
            output: None,
        }
    }

    /// Sets the target platform.
    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Sets the archive path.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// Everything decided before the first network request.
#[derive(Debug, Clone, PartialEq)]
pub struct PullPlan {
    /// Image name as requested.
    pub image: String,
    /// Parsed reference.
    pub reference: ImageReference,
    /// Target platform.
    pub platform: Platform,
    /// Archive path.
    pub output: PathBuf,
    /// Credentials for the origin registry.
    pub auth: RegistryAuth,
    /// Mirrors in try order, custom mirror first.
    pub mirrors: Vec<String>,
    /// Whether the mirror path will be taken.
    pub use_mirrors: bool,
    /// Overall deadline.
    pub timeout: Duration,
    /// Plan only.
    pub dry_run: bool,
}

/// Resolves a request against the configuration without any I/O.
///
/// Mirrors are used only when at least one is configured and the image
/// lives on the default public registry.
///
/// # Errors
///
/// Returns [`ReferenceError`] for malformed image names.
pub fn plan_pull(
    request: &PullRequest,
    config: &EffectiveConfig,
    overrides: &PullOverrides,
) -> Result<PullPlan, ReferenceError> {
    let reference = ImageReference::parse(&request.image)?;
    let platform = request
        .platform
        .clone()
        .unwrap_or_else(|| config.platform());
    let output = request.output.clone().unwrap_or_else(|| {
        config
            .default_save_dir
            .join(archive_file_name(&request.image, &platform))
    });
    let mirrors = overrides.mirrors(config);
    let use_mirrors = !mirrors.is_empty() && reference.is_default_registry();

    Ok(PullPlan {
        image: request.image.clone(),
        reference,
        platform,
        output,
        auth: RegistryAuth::from_config(config),
        mirrors,
        use_mirrors,
        timeout: overrides.timeout,
        dry_run: overrides.dry_run,
    })
}

/// Successful end of a pull.
#[derive(Debug, Clone, PartialEq)]
pub enum PullSuccess {
    /// The archive was written.
    Completed {
        /// Archive path.
        output: PathBuf,
    },
    /// Dry run; nothing was transferred.
    Planned(PullPlan),
}

/// Drives a [`RegistryClient`] through a resilient pull.
///
/// # Example
///
/// ```rust,ignore
/// let puller = Puller::new(client, config)
///     .with_sink(Arc::new(TracingSink::new(false)))
///     .with_overrides(PullOverrides::from_env());
///
/// match puller.pull(&PullRequest::new("nginx:1.25")).await {
///     Ok(PullSuccess::Completed { output }) => println!("saved {}", output.display()),
///     Ok(PullSuccess::Planned(plan)) => println!("would save {}", plan.output.display()),
///     Err(err) => eprintln!("{}", err.message()),
/// }
/// ```
pub struct Puller<C> {
    client: C,
    config: EffectiveConfig,
    overrides: PullOverrides,
    sink: Arc<dyn EventSink>,
    probe: Option<Arc<dyn MirrorProbe>>,
    direct_policy: BackoffConfig,
    mirror_policy: BackoffConfig,
}

impl<C> std::fmt::Debug for Puller<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Puller")
            .field("overrides", &self.overrides)
            .field("direct_policy", &self.direct_policy)
            .field("mirror_policy", &self.mirror_policy)
            .finish_non_exhaustive()
    }
}

impl<C: RegistryClient> Puller<C> {
    /// Creates a puller with default policies and no event sink.
    pub fn new(client: C, config: EffectiveConfig) -> Self {
        Self {
            client,
            config,
            overrides: PullOverrides::default(),
            sink: Arc::new(NoopSink),
            probe: None,
            direct_policy: BackoffConfig::default(),
            mirror_policy: BackoffConfig::mirror(),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the mirror probe. An HTTP probe is created on demand otherwise.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn MirrorProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Sets the runtime overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: PullOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Sets the retry policies for the origin and for mirrors.
    #[must_use]
    pub fn with_policies(mut self, direct: BackoffConfig, mirror: BackoffConfig) -> Self {
        self.direct_policy = direct;
        self.mirror_policy = mirror;
        self
    }

    /// The configuration this puller runs with.
    pub const fn config(&self) -> &EffectiveConfig {
        &self.config
    }

    /// Pulls an image and writes it as an archive.
    ///
    /// # Errors
    ///
    /// Returns the single [`ClassifiedError`] of the run. A
    /// [`PullEvent::Finished`] event carrying the same outcome is emitted
    /// either way.
    pub async fn pull(&self, request: &PullRequest) -> Result<PullSuccess, ClassifiedError> {
        self.stage(PullStage::ResolveReference);
        let plan = match plan_pull(request, &self.config, &self.overrides) {
            Ok(plan) => plan,
            Err(e) => {
                let platform = request
                    .platform
                    .clone()
                    .unwrap_or_else(|| self.config.platform());
                let context = ErrorContext::new(&request.image, "the registry", platform);
                return Err(self.fail(PullError::from(e), &context));
            }
        };

        self.stage(PullStage::SelectAuth);
        if plan.dry_run {
            self.message(
                MessageLevel::Info,
                format!(
                    "dry run: would pull {} for {} into {}",
                    plan.reference,
                    plan.platform,
                    plan.output.display()
                ),
            );
            self.sink.emit(PullEvent::Finished(PullOutcome::Planned));
            return Ok(PullSuccess::Planned(plan));
        }

        if let Some(custom) = &self.overrides.custom_mirror {
            self.message(MessageLevel::Info, format!("using custom mirror {custom}"));
        }
        self.message(
            MessageLevel::Info,
            format!("pulling {} for {}", plan.reference, plan.platform),
        );

        let context = ErrorContext::new(
            &plan.image,
            plan.reference.registry(),
            plan.platform.clone(),
        );
        match tokio::time::timeout(plan.timeout, self.execute(&plan)).await {
            Ok(Ok(output)) => {
                self.stage(PullStage::Done);
                self.sink.emit(PullEvent::Finished(PullOutcome::Completed {
                    output: output.clone(),
                }));
                Ok(PullSuccess::Completed { output })
            }
            Ok(Err(e)) => Err(self.fail(e, &context)),
            Err(_) => Err(self.fail(PullError::timed_out(plan.timeout, &plan.image), &context)),
        }
    }

    async fn execute(&self, plan: &PullPlan) -> Result<PathBuf, PullError> {
        if !plan.use_mirrors {
            return self.pull_direct(plan, plan.reference.clone()).await;
        }

        self.stage(PullStage::MaybeMirror);
        let probe: Arc<dyn MirrorProbe> = match &self.probe {
            Some(probe) => Arc::clone(probe),
            None => Arc::new(HttpProbe::new().map_err(PullError::Probe)?),
        };
        let manager = MirrorManager::with_mirrors(plan.mirrors.iter().cloned(), probe)
            .with_sink(Arc::clone(&self.sink));

        let this = self;
        manager
            .try_with_fallback_unless(
                &plan.reference,
                PullError::is_persist,
                move |reference, mirror| async move {
                    match mirror {
                        Some(url) => this.pull_from_mirror(plan, reference, &url).await,
                        None => this.pull_direct(plan, reference).await,
                    }
                },
            )
            .await
            .map_err(PullError::from)
    }

    /// One mirror: anonymous, reduced budget, every attempt runs the whole transfer.
    async fn pull_from_mirror(
        &self,
        plan: &PullPlan,
        reference: ImageReference,
        mirror_url: &str,
    ) -> Result<PathBuf, PullError> {
        let op = MirrorTransfer {
            puller: self,
            plan,
            reference: &reference,
            auth: RegistryAuth::Anonymous,
            label: format!("pull via {mirror_url}"),
        };
        execute_with_retry(&op, &self.mirror_policy, &*self.sink).await?;
        Ok(plan.output.clone())
    }

    /// The origin registry, with the configured credentials.
    async fn pull_direct(
        &self,
        plan: &PullPlan,
        reference: ImageReference,
    ) -> Result<PathBuf, PullError> {
        let auth = &plan.auth;
        let fetch = FetchMetadata {
            puller: self,
            reference: &reference,
            auth,
            platform: &plan.platform,
            label: "fetch-metadata".to_string(),
        };
        let (reference, descriptor) =
            match execute_with_retry(&fetch, &self.direct_policy, &*self.sink).await {
                Ok(descriptor) => (reference, descriptor),
                Err(err) => {
                    let Some(host) = redirect_target(&plan.image, &err.last_error().to_string())
                    else {
                        return Err(err.into());
                    };
                    let redirected = reference.with_host(host);
                    self.message(
                        MessageLevel::Info,
                        format!(
                            "{} redirects to {host}, retrying as {redirected}",
                            reference.registry()
                        ),
                    );
                    let fetch = FetchMetadata {
                        puller: self,
                        reference: &redirected,
                        auth,
                        platform: &plan.platform,
                        label: format!("fetch-metadata [{host}]"),
                    };
                    let descriptor =
                        execute_with_retry(&fetch, &self.direct_policy, &*self.sink).await?;
                    (redirected, descriptor)
                }
            };

        let fetch = FetchContent {
            puller: self,
            reference: &reference,
            auth,
            platform: &plan.platform,
            total: descriptor.transfer_size(),
        };
        let (content, tracker) =
            execute_with_retry(&fetch, &self.direct_policy, &*self.sink).await?;
        self.persist(plan, &reference, content, &tracker).await?;
        Ok(plan.output.clone())
    }

    async fn fetch_metadata(
        &self,
        reference: &ImageReference,
        auth: &RegistryAuth,
        platform: &Platform,
    ) -> Result<Descriptor, StageError> {
        self.stage(PullStage::FetchMetadata);
        self.client
            .get_metadata(reference, auth, platform, Arc::new(DirectTransport))
            .await
            .map_err(|source| StageError::new(PullStage::FetchMetadata, source))
    }

    async fn fetch_content(
        &self,
        reference: &ImageReference,
        auth: &RegistryAuth,
        platform: &Platform,
        total: u64,
    ) -> Result<(C::Content, ProgressTracker), StageError> {
        self.stage(PullStage::FetchContent);
        self.message(
            MessageLevel::Info,
            format!("total download size: {}", format_bytes(total)),
        );
        let tracker = ProgressTracker::with_sink(total, Arc::clone(&self.sink));
        let content = self
            .client
            .get_content(reference, auth, platform, Arc::new(tracker.transport()))
            .await
            .map_err(|source| StageError::new(PullStage::FetchContent, source))?;
        Ok((content, tracker))
    }

    async fn persist(
        &self,
        plan: &PullPlan,
        reference: &ImageReference,
        content: C::Content,
        tracker: &ProgressTracker,
    ) -> Result<(), StageError> {
        self.stage(PullStage::Persist);
        self.client
            .write_archive(&plan.output, reference, content)
            .await
            .map_err(|source| StageError::new(PullStage::Persist, source))?;
        tracker.finish();
        Ok(())
    }

    fn fail(&self, err: PullError, context: &ErrorContext) -> ClassifiedError {
        let classified = ClassifiedError::new(err.kind(), context, err);
        self.stage(PullStage::Failed);
        self.sink.emit(PullEvent::Finished(PullOutcome::Failed {
            kind: classified.kind(),
            message: classified.message().to_string(),
        }));
        classified
    }

    fn stage(&self, stage: PullStage) {
        self.sink.emit(PullEvent::Stage(stage));
    }

    fn message(&self, level: MessageLevel, text: String) {
        self.sink.emit(PullEvent::Message { level, text });
    }
}

/// Returns false for failures another attempt cannot fix.
fn is_transient(error: &StageError) -> bool {
    !matches!(
        classify(Some(error)),
        Some(ErrorKind::PlatformNotSupported | ErrorKind::Unauthorized)
    )
}

/// Host an image is known to redirect to, when `error` shows the redirect.
fn redirect_target(image: &str, error: &str) -> Option<&'static str> {
    KNOWN_REDIRECTS
        .iter()
        .find(|(from, to)| image.contains(from) && error.contains(to))
        .map(|(_, to)| *to)
}

struct FetchMetadata<'a, C> {
    puller: &'a Puller<C>,
    reference: &'a ImageReference,
    auth: &'a RegistryAuth,
    platform: &'a Platform,
    label: String,
}

#[async_trait]
impl<C: RegistryClient> RetryableOperation for FetchMetadata<'_, C> {
    type Output = Descriptor;
    type Error = StageError;

    fn name(&self) -> &str {
        &self.label
    }

    async fn execute(&self) -> Result<Descriptor, StageError> {
        self.puller
            .fetch_metadata(self.reference, self.auth, self.platform)
            .await
    }

    fn should_retry(&self, error: &StageError) -> bool {
        is_transient(error)
    }
}

struct FetchContent<'a, C> {
    puller: &'a Puller<C>,
    reference: &'a ImageReference,
    auth: &'a RegistryAuth,
    platform: &'a Platform,
    total: u64,
}

#[async_trait]
impl<C: RegistryClient> RetryableOperation for FetchContent<'_, C> {
    type Output = (C::Content, ProgressTracker);
    type Error = StageError;

    fn name(&self) -> &str {
        "fetch-content"
    }

    async fn execute(&self) -> Result<Self::Output, StageError> {
        self.puller
            .fetch_content(self.reference, self.auth, self.platform, self.total)
            .await
    }

    fn should_retry(&self, error: &StageError) -> bool {
        is_transient(error)
    }
}

// A whole transfer against one mirror; archive write failures are final.
struct MirrorTransfer<'a, C> {
    puller: &'a Puller<C>,
    plan: &'a PullPlan,
    reference: &'a ImageReference,
    auth: RegistryAuth,
    label: String,
}

#[async_trait]
impl<C: RegistryClient> RetryableOperation for MirrorTransfer<'_, C> {
    type Output = ();
    type Error = StageError;

    fn name(&self) -> &str {
        &self.label
    }

    async fn execute(&self) -> Result<(), StageError> {
        let puller = self.puller;
        let descriptor = puller
            .fetch_metadata(self.reference, &self.auth, &self.plan.platform)
            .await?;
        let (content, tracker) = puller
            .fetch_content(
                self.reference,
                &self.auth,
                &self.plan.platform,
                descriptor.transfer_size(),
            )
            .await?;
        puller
            .persist(self.plan, self.reference, content, &tracker)
            .await
    }

    fn should_retry(&self, error: &StageError) -> bool {
        !error.is_persist() && is_transient(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EffectiveConfig {
        EffectiveConfig::default()
    }

    #[test]
    fn test_plan_defaults() {
        let plan = plan_pull(
            &PullRequest::new("nginx"),
            &config(),
            &PullOverrides::default(),
        )
        .unwrap();
        assert_eq!(plan.reference.repository(), "library/nginx");
        assert_eq!(plan.platform, Platform::new("linux", "amd64"));
        assert_eq!(plan.output, PathBuf::from("./nginx_latest_linux_amd64.tar"));
        assert!(plan.auth.is_anonymous());
        assert!(!plan.use_mirrors);
        assert_eq!(plan.timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_plan_uses_mirrors_only_for_default_registry() {
        let config = config().with_mirrors(vec!["https://m.example".into()]);
        let overrides = PullOverrides::default();

        let hub = plan_pull(&PullRequest::new("redis:7"), &config, &overrides).unwrap();
        assert!(hub.use_mirrors);

        let ghcr = plan_pull(&PullRequest::new("ghcr.io/org/app:v1"), &config, &overrides).unwrap();
        assert!(!ghcr.use_mirrors);
    }

    #[test]
    fn test_plan_custom_mirror_enables_mirror_path() {
        let overrides = PullOverrides::default().with_custom_mirror("https://custom.example");
        let plan = plan_pull(&PullRequest::new("alpine"), &config(), &overrides).unwrap();
        assert!(plan.use_mirrors);
        assert_eq!(plan.mirrors, vec!["https://custom.example"]);
    }

    #[test]
    fn test_plan_explicit_platform_and_output() {
        let request = PullRequest::new("nginx:1.25")
            .with_platform(Platform::new("linux", "arm64"))
            .with_output("/tmp/out.tar");
        let plan = plan_pull(&request, &config(), &PullOverrides::default()).unwrap();
        assert_eq!(plan.platform.architecture, "arm64");
        assert_eq!(plan.output, PathBuf::from("/tmp/out.tar"));
    }

    #[test]
    fn test_plan_credentials_select_basic_auth() {
        let config = config().with_credentials("alice", "token");
        let plan = plan_pull(&PullRequest::new("nginx"), &config, &PullOverrides::default()).unwrap();
        assert_eq!(plan.auth, RegistryAuth::basic("alice", "token"));
    }

    #[test]
    fn test_plan_rejects_malformed_reference() {
        assert!(plan_pull(&PullRequest::new("Not Valid"), &config(), &PullOverrides::default()).is_err());
    }

    #[test]
    fn test_redirect_target() {
        assert_eq!(
            redirect_target(
                "docker.dragonflydb.io/dragonflydb/dragonfly",
                "GET https://ghcr.io/token: DENIED"
            ),
            Some("ghcr.io")
        );
        assert_eq!(redirect_target("docker.dragonflydb.io/x", "connection refused"), None);
        assert_eq!(redirect_target("nginx", "ghcr.io"), None);
    }

    #[test]
    fn test_permanent_registry_answers_are_not_transient() {
        use dipt_core::{Diagnostic, RegistryError};

        let stage = |source| StageError::new(PullStage::FetchMetadata, source);
        let url = "https://index.docker.io/v2/library/nginx/manifests/latest";

        let missing = RegistryError::api(url, 404, vec![Diagnostic::new("MANIFEST_UNKNOWN", "")]);
        assert!(!is_transient(&stage(missing)));
        assert!(!is_transient(&stage(RegistryError::api(url, 401, vec![]))));
        assert!(!is_transient(&stage(RegistryError::api(url, 403, vec![]))));

        assert!(is_transient(&stage(RegistryError::connection(url, "connection refused"))));
        assert!(is_transient(&stage(RegistryError::api(url, 503, vec![]))));
    }
}
