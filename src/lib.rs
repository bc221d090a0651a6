#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Forgewire
//!
//! HTTP resilience layer for Forge build-automation service clients:
//! transient-fault classification, retry with exponential backoff, a
//! pipeline retry stage applied to every outbound send, and a client
//! factory that verifies connectivity (repairing the caller's identity
//! once if needed) before handing a client out.
//!
//! ## Features
//!
//! - **Fault classification** of status codes, socket errors, timeouts,
//!   and service-level failures into a single retryability decision
//! - **Exponential backoff** with bounded jitter, clamped to policy bounds
//! - **Generic retry executor** for arbitrary async operations, with
//!   cancellation support
//! - **Retry middleware** composable with caller-supplied pipeline stages
//! - **Verified client bring-up** with a one-shot identity-repair handshake
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use forgewire::{ClientFactory, ClientOptions, Credentials, RetryPolicy};
//! use forgewire::factory::ForgeClient;
//! use reqwest::Url;
//! use reqwest_middleware::ClientWithMiddleware;
//!
//! struct BuildClient {
//!     http: ClientWithMiddleware,
//!     base_url: Url,
//! }
//!
//! impl ForgeClient for BuildClient {
//!     const CAPABILITY: &'static str = "build";
//!     fn from_pipeline(http: ClientWithMiddleware, base_url: Url) -> Self {
//!         Self { http, base_url }
//!     }
//!     fn base_url(&self) -> &Url {
//!         &self.base_url
//!     }
//!     fn http(&self) -> &ClientWithMiddleware {
//!         &self.http
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), forgewire::Fault> {
//!     let options = ClientOptions::new()
//!         .credentials(Credentials::Pat("token".into()))
//!         .policy(RetryPolicy::builder().max_retries(3).build()?);
//!     let factory = ClientFactory::new(options);
//!     let client: BuildClient = factory.create(Url::parse("https://forge.example/").unwrap())?;
//!     factory.verify_connection(&client).await?;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod classify;
pub mod events;
pub mod factory;
pub mod fault;
pub mod middleware;
pub mod retry;
pub mod sleeper;
pub mod verify;

// Re-exports
pub use classify::{Classification, TransientClassifier};
pub use events::{MemoryObserver, SendEvent, SendObserver, TracingObserver};
pub use factory::{ClientFactory, ClientOptions, Credentials, ForgeClient, Stage};
pub use fault::{Fault, FaultKind, ServiceResponseError};
pub use middleware::{RetrySendMiddleware, RETRY_CONNECTION_RESET_ENV};
pub use retry::{RetryExecutor, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use verify::{IdentityClient, IdentityProfile, IdentityRepair, VerificationResult};
