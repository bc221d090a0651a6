//! End-to-end behavior of the outbound retry stage against a mock server.

mod common;

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{fast_options, fast_policy, TestClient};
use forgewire::{
    ClientFactory, ForgeClient, MemoryObserver, RetrySendMiddleware, SendEvent, Stage,
};
use http::Extensions;
use reqwest::{Request, Response, StatusCode, Url};
use reqwest_middleware::{Middleware, Next};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn base_url(server: &MockServer) -> Url {
    Url::parse(&server.uri()).expect("mock server URI")
}

#[tokio::test]
async fn transient_statuses_are_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/builds"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/builds"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let observer = MemoryObserver::new();
    let factory = ClientFactory::new(fast_options(2, &observer));
    let client: TestClient = factory.create(base_url(&server)).expect("client");

    let url = client.base_url().join("builds").unwrap();
    let response = client.http().get(url).send().await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let attempts = observer.count_matching(|e| matches!(e, SendEvent::Attempt { .. }));
    let retries = observer.count_matching(|e| matches!(e, SendEvent::Retry { .. }));
    assert_eq!(attempts, 3, "three attempts observed");
    assert_eq!(retries, 2, "two backoff waits observed");
    assert_eq!(
        observer.count_matching(|e| matches!(e, SendEvent::Succeeded { attempt: 3, .. })),
        1,
        "recovery reported on attempt 3"
    );
}

#[tokio::test]
async fn non_retryable_status_is_returned_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/builds"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let observer = MemoryObserver::new();
    let factory = ClientFactory::new(fast_options(3, &observer));
    let client: TestClient = factory.create(base_url(&server)).expect("client");

    let url = client.base_url().join("builds").unwrap();
    let response = client.http().get(url).send().await.expect("response");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(observer.count_matching(|e| matches!(e, SendEvent::Attempt { .. })), 1);
    assert_eq!(observer.count_matching(|e| matches!(e, SendEvent::Retry { .. })), 0);
}

#[tokio::test]
async fn exhausted_status_budget_returns_the_last_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/builds"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let observer = MemoryObserver::new();
    let factory = ClientFactory::new(fast_options(1, &observer));
    let client: TestClient = factory.create(base_url(&server)).expect("client");

    let url = client.base_url().join("builds").unwrap();
    let response = client.http().get(url).send().await.expect("response");

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(observer.count_matching(|e| matches!(e, SendEvent::Attempt { .. })), 2);
    assert_eq!(
        observer.count_matching(
            |e| matches!(e, SendEvent::Failed { attempts: 2, .. })
        ),
        1,
        "terminal failure reported with the attempt count"
    );
}

/// Stage below the retry stage that fails with a connection reset a fixed
/// number of times before delegating.
#[derive(Debug)]
struct ResettingStage {
    remaining: AtomicUsize,
}

impl ResettingStage {
    fn failing(times: usize) -> Self {
        Self { remaining: AtomicUsize::new(times) }
    }
}

#[async_trait::async_trait]
impl Middleware for ResettingStage {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        if self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(reqwest_middleware::Error::Middleware(anyhow::Error::new(
                io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"),
            )));
        }
        next.run(req, extensions).await
    }
}

#[tokio::test]
async fn connection_reset_is_not_retried_by_default() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;

    let observer = MemoryObserver::new();
    let options =
        fast_options(3, &observer).stage(Stage::custom(ResettingStage::failing(1)));
    let factory = ClientFactory::new(options);
    let client: TestClient = factory.create(base_url(&server)).expect("client");

    let result = client.http().get(client.base_url().clone()).send().await;

    assert!(result.is_err(), "socket fault surfaces on attempt 1");
    assert_eq!(observer.count_matching(|e| matches!(e, SendEvent::Attempt { .. })), 1);
    assert_eq!(observer.count_matching(|e| matches!(e, SendEvent::Retry { .. })), 0);
}

#[tokio::test]
async fn connection_reset_retries_with_the_opt_in() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(200)).expect(1).mount(&server).await;

    let observer = MemoryObserver::new();
    let retry_stage = RetrySendMiddleware::from_policy(fast_policy(3))
        .retry_connection_resets(true)
        .with_observer(Arc::new(observer.clone()))
        .with_sleeper(Arc::new(forgewire::InstantSleeper));
    let options = fast_options(3, &observer)
        .stage(Stage::retry(retry_stage))
        .stage(Stage::custom(ResettingStage::failing(1)));
    let factory = ClientFactory::new(options);
    let client: TestClient = factory.create(base_url(&server)).expect("client");

    let response = client.http().get(client.base_url().clone()).send().await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(observer.count_matching(|e| matches!(e, SendEvent::Attempt { .. })), 2);
    assert_eq!(
        observer.count_matching(|e| matches!(e, SendEvent::Succeeded { attempt: 2, .. })),
        1
    );
}

#[tokio::test]
async fn terminal_pipeline_faults_carry_attempt_diagnostics() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;

    let observer = MemoryObserver::new();
    // The stage keeps resetting; the opt-in is off so attempt 1 is final.
    let options =
        fast_options(2, &observer).stage(Stage::custom(ResettingStage::failing(usize::MAX)));
    let factory = ClientFactory::new(options);
    let client: TestClient = factory.create(base_url(&server)).expect("client");

    let error = client.http().get(client.base_url().clone()).send().await.unwrap_err();
    let fault = forgewire::classify::fault_from_send_error(
        &forgewire::TransientClassifier::default(),
        error,
    );
    assert_eq!(fault.kind(), forgewire::FaultKind::Socket);
    assert_eq!(fault.attempts(), Some(1));
}

#[tokio::test]
async fn caller_stages_are_reexecuted_on_retry() {
    // A counting stage between retry and transport sees every attempt.
    #[derive(Debug, Default)]
    struct CountingStage {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Middleware for CountingStage {
        async fn handle(
            &self,
            req: Request,
            extensions: &mut Extensions,
            next: Next<'_>,
        ) -> reqwest_middleware::Result<Response> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            next.run(req, extensions).await
        }
    }

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let seen = Arc::new(AtomicUsize::new(0));
    let observer = MemoryObserver::new();
    let options = fast_options(2, &observer)
        .stage(Stage::custom(CountingStage { seen: seen.clone() }));
    let factory = ClientFactory::new(options);
    let client: TestClient = factory.create(base_url(&server)).expect("client");

    let response = client.http().get(client.base_url().clone()).send().await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(seen.load(Ordering::SeqCst), 2, "the whole remaining pipeline is re-run");
}
