//! Connection verification and identity repair.
//!
//! After building a client the factory can probe it end to end before
//! handing it to the caller. The probe is an OPTIONS capability request
//! driven by the generic retry executor with a small fixed budget. An
//! authorization fault short-circuits the retry loop and triggers the
//! one-shot repair protocol instead: provision the caller's identity
//! profile through a side-channel client, then re-issue the probe exactly
//! once. An authorization failure after repair is terminal; there is never
//! a second repair.

use std::sync::Arc;

use http::StatusCode;
use reqwest::Method;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::classify::{fault_from_send_error, TransientClassifier};
use crate::factory::{ClientFactory, ForgeClient};
use crate::fault::Fault;
use crate::retry::{RetryPolicy, RetryExecutor};

/// Retry budget for the verification probe.
pub const VERIFY_RETRY_BUDGET: u32 = 2;

/// Outcome of a client bring-up handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationResult {
    /// No probe has completed yet.
    Uninitialized,
    /// The first probe round succeeded.
    InitialRequestSucceeded,
    /// The probe succeeded only after the identity-repair cycle.
    RequestSucceededAfterIdentityRepair,
}

/// Side-channel collaborator that provisions the caller's identity profile.
///
/// The contract is deliberately thin: `ensure_profile` succeeds once the
/// profile exists, or fails with the fault that prevented it.
#[async_trait::async_trait]
pub trait IdentityRepair: Send + Sync {
    async fn ensure_profile(&self) -> Result<(), Fault>;
}

/// Identity payload returned by the identity service.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityProfile {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Client for the identity-provisioning service.
///
/// Fetching the caller's own identity is what triggers profile creation on
/// the service side, so [`IdentityRepair`] is just a thin wrapper over
/// [`IdentityClient::fetch_self`].
pub struct IdentityClient {
    http: reqwest_middleware::ClientWithMiddleware,
    base_url: reqwest::Url,
}

impl ForgeClient for IdentityClient {
    const CAPABILITY: &'static str = "identity";

    fn from_pipeline(http: reqwest_middleware::ClientWithMiddleware, base_url: reqwest::Url) -> Self {
        Self { http, base_url }
    }

    fn base_url(&self) -> &reqwest::Url {
        &self.base_url
    }

    fn http(&self) -> &reqwest_middleware::ClientWithMiddleware {
        &self.http
    }
}

impl IdentityClient {
    /// Fetch the caller's own identity, creating the profile if needed.
    pub async fn fetch_self(&self) -> Result<IdentityProfile, Fault> {
        let url = self.base_url.join("self").map_err(|e| {
            Fault::configuration("identity base address does not accept a path").with_source(e)
        })?;
        let classifier = TransientClassifier::default();
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| fault_from_send_error(&classifier, e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Fault::authorization(status, "identity service rejected the caller"));
        }
        if !status.is_success() {
            return Err(Fault::status(status));
        }

        let body = response.bytes().await.map_err(|e| {
            Fault::io("failed reading identity profile body").with_source(e)
        })?;
        serde_json::from_slice(&body)
            .map_err(|e| Fault::io("failed decoding identity profile").with_source(e))
    }
}

#[async_trait::async_trait]
impl IdentityRepair for IdentityClient {
    async fn ensure_profile(&self) -> Result<(), Fault> {
        self.fetch_self().await.map(|_| ())
    }
}

impl ClientFactory {
    /// Verify that `client` can reach its service, repairing the caller's
    /// identity once if the probe is rejected for authorization.
    pub async fn verify_connection<C: ForgeClient>(
        &self,
        client: &C,
    ) -> Result<VerificationResult, Fault> {
        let mut outcome = VerificationResult::Uninitialized;
        let cancel = CancellationToken::new();

        let probe_policy = RetryPolicy::builder()
            .max_retries(VERIFY_RETRY_BUDGET)
            .min_backoff(self.options().policy.min_backoff())
            .max_backoff(self.options().policy.max_backoff())
            .backoff_coefficient(self.options().policy.backoff_coefficient())
            .build()?;
        let mut executor =
            RetryExecutor::new(probe_policy).with_sleeper(self.options().sleeper.clone());

        match executor.invoke(|| probe(client), &cancel).await {
            Ok(()) => outcome = VerificationResult::InitialRequestSucceeded,
            Err(fault) if fault.is_authorization() => {
                tracing::debug!(
                    capability = C::CAPABILITY,
                    fault = %fault,
                    "capability probe rejected; repairing identity"
                );
                self.identity_repair()?.ensure_profile().await?;
                // One more probe, no further retries and no second repair.
                probe(client).await?;
                outcome = VerificationResult::RequestSucceededAfterIdentityRepair;
            }
            Err(fault) => return Err(fault),
        }

        Ok(outcome)
    }

    fn identity_repair(&self) -> Result<Arc<dyn IdentityRepair>, Fault> {
        if let Some(repair) = &self.options().identity_repair {
            return Ok(repair.clone());
        }
        let identity: IdentityClient = self.create(self.options().identity_base.clone())?;
        Ok(Arc::new(identity))
    }
}

/// OPTIONS capability probe against the client's base address.
async fn probe<C: ForgeClient>(client: &C) -> Result<(), Fault> {
    let classifier = TransientClassifier::default();
    let response = client
        .http()
        .request(Method::OPTIONS, client.base_url().clone())
        .send()
        .await
        .map_err(|e| fault_from_send_error(&classifier, e))?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Fault::authorization(status, "capability probe rejected"));
    }
    if !status.is_success() {
        return Err(Fault::status(status));
    }
    Ok(())
}
