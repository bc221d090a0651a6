//! Client factory: credentials, pipeline assembly, and configuration
//! validation.
//!
//! The factory produces concrete service clients bound to a base address.
//! Every built pipeline carries exactly one retry stage, placed outermost
//! so a retry re-executes all caller-registered stages, not just the
//! transport send. Configuration problems surface as terminal
//! [`Fault::configuration`] values at build time and are never retried.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Url;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware};

use crate::events::{SendObserver, TracingObserver};
use crate::fault::Fault;
use crate::middleware::RetrySendMiddleware;
use crate::retry::RetryPolicy;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::verify::IdentityRepair;

/// Well-known base address of the identity-provisioning service.
pub const DEFAULT_IDENTITY_BASE: &str = "https://identity.forge.dev/";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const USER_AGENT: &str = concat!("forgewire/", env!("CARGO_PKG_VERSION"));

/// Credential material applied to every request of a built client.
#[derive(Debug, Clone)]
pub enum Credentials {
    Anonymous,
    /// OAuth-style bearer token.
    Bearer(String),
    /// Personal access token, sent as basic auth with an empty user name.
    Pat(String),
}

impl Credentials {
    fn authorization_header(&self) -> Result<Option<HeaderValue>, Fault> {
        let raw = match self {
            Credentials::Anonymous => return Ok(None),
            Credentials::Bearer(token) => format!("Bearer {}", token),
            Credentials::Pat(token) => {
                format!("Basic {}", BASE64.encode(format!(":{}", token)))
            }
        };
        let mut value = HeaderValue::from_str(&raw).map_err(|e| {
            Fault::configuration("credential material is not a valid header value")
                .with_source(e)
        })?;
        value.set_sensitive(true);
        Ok(Some(value))
    }
}

/// A pipeline stage registered with the factory.
///
/// Stages are ordered: earlier stages wrap later ones. The retry stage is
/// always placed outermost regardless of where it appears in the list, and
/// supplying more than one is a configuration fault.
#[derive(Clone)]
pub struct Stage {
    kind: StageKind,
    middleware: Arc<dyn Middleware>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageKind {
    Retry,
    Custom,
}

impl Stage {
    /// A caller-defined middleware stage.
    pub fn custom<M: Middleware>(middleware: M) -> Self {
        Self { kind: StageKind::Custom, middleware: Arc::new(middleware) }
    }

    /// A caller-configured retry stage, used in place of the factory's
    /// default one.
    pub fn retry(middleware: RetrySendMiddleware) -> Self {
        Self { kind: StageKind::Retry, middleware: Arc::new(middleware) }
    }

    fn is_retry(&self) -> bool {
        self.kind == StageKind::Retry
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage").field("kind", &self.kind).finish()
    }
}

/// Configuration for clients produced by a [`ClientFactory`].
#[derive(Clone)]
pub struct ClientOptions {
    pub(crate) credentials: Credentials,
    pub(crate) timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) policy: RetryPolicy,
    pub(crate) stages: Vec<Stage>,
    pub(crate) observer: Arc<dyn SendObserver>,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    pub(crate) identity_base: Url,
    pub(crate) identity_repair: Option<Arc<dyn IdentityRepair>>,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("credentials", &self.credentials)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("policy", &self.policy)
            .field("stages", &self.stages)
            .field("identity_base", &self.identity_base.as_str())
            .finish()
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            credentials: Credentials::Anonymous,
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            policy: RetryPolicy::default(),
            stages: Vec::new(),
            observer: Arc::new(TracingObserver),
            sleeper: Arc::new(TokioSleeper),
            identity_base: Url::parse(DEFAULT_IDENTITY_BASE)
                .expect("default identity base address is a valid URL"),
            identity_repair: None,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register an additional pipeline stage.
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn SendObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Override the identity-service base address used by verification.
    pub fn identity_base(mut self, base: Url) -> Self {
        self.identity_base = base;
        self
    }

    /// Override the identity-repair collaborator used by verification.
    pub fn identity_repair(mut self, repair: Arc<dyn IdentityRepair>) -> Self {
        self.identity_repair = Some(repair);
        self
    }
}

/// Capability contract implemented by every concrete Forge client.
///
/// The compiler enforces what the original system checked by reflection:
/// a type built by the factory must declare its capability and accept the
/// standard pipeline/base-address constructor shape.
pub trait ForgeClient: Send + Sync + Sized {
    /// Capability the client exposes, e.g. `"build"` or `"identity"`.
    const CAPABILITY: &'static str;

    fn from_pipeline(http: ClientWithMiddleware, base_url: Url) -> Self;

    fn base_url(&self) -> &Url;

    fn http(&self) -> &ClientWithMiddleware;
}

/// Builds fully configured, resilient service clients.
#[derive(Debug, Clone, Default)]
pub struct ClientFactory {
    options: ClientOptions,
}

impl ClientFactory {
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Construct a concrete client bound to `base_url`.
    ///
    /// Fails with a configuration fault if the base address scheme is not
    /// HTTP(S), more than one retry stage was registered, or the transport
    /// cannot be built.
    pub fn create<C: ForgeClient>(&self, base_url: Url) -> Result<C, Fault> {
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(Fault::configuration(format!(
                "unsupported base address scheme '{}' for {} client",
                base_url.scheme(),
                C::CAPABILITY
            )));
        }

        let retry_stages: Vec<&Stage> =
            self.options.stages.iter().filter(|s| s.is_retry()).collect();
        if retry_stages.len() > 1 {
            return Err(Fault::configuration(format!(
                "{} retry stages supplied; the pipeline carries exactly one",
                retry_stages.len()
            )));
        }

        let mut headers = HeaderMap::new();
        if let Some(value) = self.options.credentials.authorization_header()? {
            headers.insert(AUTHORIZATION, value);
        }

        let transport = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(self.options.timeout)
            .connect_timeout(self.options.connect_timeout)
            .build()
            .map_err(|e| {
                Fault::configuration("failed to construct HTTP transport").with_source(e)
            })?;
        let retry: Arc<dyn Middleware> = match retry_stages.first() {
            Some(stage) => stage.middleware.clone(),
            None => Arc::new(
                RetrySendMiddleware::from_policy(self.options.policy.clone())
                    .with_observer(self.options.observer.clone())
                    .with_sleeper(self.options.sleeper.clone()),
            ),
        };

        // Retry outermost, then caller stages in registration order.
        let mut builder = ClientBuilder::new(transport).with_arc(retry);
        for stage in self.options.stages.iter().filter(|s| !s.is_retry()) {
            builder = builder.with_arc(stage.middleware.clone());
        }

        Ok(C::from_pipeline(builder.build(), base_url))
    }
}
