//! Client bring-up verification: probe, identity repair, re-probe.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{fast_options, TestClient};
use forgewire::{
    ClientFactory, Fault, IdentityRepair, MemoryObserver, VerificationResult,
};
use reqwest::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn base_url(server: &MockServer) -> Url {
    Url::parse(&server.uri()).expect("mock server URI")
}

/// Factory whose middleware never retries, so probe counts are driven by
/// the verification executor alone.
fn factory(observer: &MemoryObserver, identity_base: Url) -> ClientFactory {
    ClientFactory::new(fast_options(0, observer).identity_base(identity_base))
}

fn mount_identity(server: &MockServer) -> impl std::future::Future<Output = ()> + '_ {
    Mock::given(method("GET"))
        .and(path("/self"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(r#"{"id":"u-1","display_name":"Build Bot"}"#, "application/json"),
        )
        .expect(1)
        .mount(server)
}

#[tokio::test]
async fn healthy_service_verifies_on_the_first_probe() {
    let server = MockServer::start().await;
    Mock::given(method("OPTIONS"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let observer = MemoryObserver::new();
    let factory = factory(&observer, base_url(&server));
    let client: TestClient = factory.create(base_url(&server)).expect("client");

    let result = factory.verify_connection(&client).await.expect("verified");
    assert_eq!(result, VerificationResult::InitialRequestSucceeded);
}

#[tokio::test]
async fn transient_probe_failures_use_the_retry_budget() {
    let server = MockServer::start().await;
    Mock::given(method("OPTIONS"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("OPTIONS"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let observer = MemoryObserver::new();
    let factory = factory(&observer, base_url(&server));
    let client: TestClient = factory.create(base_url(&server)).expect("client");

    let result = factory.verify_connection(&client).await.expect("verified");
    assert_eq!(result, VerificationResult::InitialRequestSucceeded);
}

#[tokio::test]
async fn authorization_failure_triggers_one_repair_and_one_reprobe() {
    let service = MockServer::start().await;
    let identity = MockServer::start().await;

    Mock::given(method("OPTIONS"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .expect(1)
        .mount(&service)
        .await;
    Mock::given(method("OPTIONS"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&service)
        .await;
    mount_identity(&identity).await;

    let observer = MemoryObserver::new();
    let factory = factory(&observer, base_url(&identity));
    let client: TestClient = factory.create(base_url(&service)).expect("client");

    let result = factory.verify_connection(&client).await.expect("verified");
    assert_eq!(result, VerificationResult::RequestSucceededAfterIdentityRepair);
}

#[tokio::test]
async fn authorization_failure_after_repair_is_terminal() {
    let service = MockServer::start().await;
    let identity = MockServer::start().await;

    // The probe keeps getting rejected; repair does not help.
    Mock::given(method("OPTIONS"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&service)
        .await;
    mount_identity(&identity).await;

    let observer = MemoryObserver::new();
    let factory = factory(&observer, base_url(&identity));
    let client: TestClient = factory.create(base_url(&service)).expect("client");

    let fault = factory.verify_connection(&client).await.unwrap_err();
    assert!(fault.is_authorization(), "the second rejection is propagated");
    // Mock expectations assert exactly two probes and one repair on drop.
}

#[tokio::test]
async fn repair_runs_exactly_once_even_with_an_injected_collaborator() {
    #[derive(Debug, Default)]
    struct CountingRepair {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl IdentityRepair for CountingRepair {
        async fn ensure_profile(&self) -> Result<(), Fault> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let service = MockServer::start().await;
    Mock::given(method("OPTIONS"))
        .respond_with(ResponseTemplate::new(403))
        .expect(2)
        .mount(&service)
        .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let observer = MemoryObserver::new();
    let options = fast_options(0, &observer)
        .identity_repair(Arc::new(CountingRepair { calls: calls.clone() }));
    let factory = ClientFactory::new(options);
    let client: TestClient = factory.create(base_url(&service)).expect("client");

    let fault = factory.verify_connection(&client).await.unwrap_err();
    assert!(fault.is_authorization());
    assert_eq!(calls.load(Ordering::SeqCst), 1, "never a second repair cycle");
}

#[tokio::test]
async fn failed_repair_propagates_the_repair_fault() {
    let service = MockServer::start().await;
    let identity = MockServer::start().await;

    Mock::given(method("OPTIONS"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&service)
        .await;
    Mock::given(method("GET"))
        .and(path("/self"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&identity)
        .await;

    let observer = MemoryObserver::new();
    let factory = factory(&observer, base_url(&identity));
    let client: TestClient = factory.create(base_url(&service)).expect("client");

    let fault = factory.verify_connection(&client).await.unwrap_err();
    assert!(!fault.is_authorization());
    assert_eq!(fault.status_code().map(|s| s.as_u16()), Some(500));
}

#[tokio::test]
async fn non_authorization_probe_failures_skip_repair() {
    let service = MockServer::start().await;
    let identity = MockServer::start().await;

    Mock::given(method("OPTIONS"))
        .respond_with(ResponseTemplate::new(410))
        .expect(1)
        .mount(&service)
        .await;
    Mock::given(method("GET"))
        .and(path("/self"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&identity)
        .await;

    let observer = MemoryObserver::new();
    let factory = factory(&observer, base_url(&identity));
    let client: TestClient = factory.create(base_url(&service)).expect("client");

    let fault = factory.verify_connection(&client).await.unwrap_err();
    assert_eq!(fault.status_code().map(|s| s.as_u16()), Some(410));
}
