//! Instance metadata discovery exercised against a local fake IMDSv2.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use ebsmount::{ContextError, ContextResolver, ImdsClient};
use tokio::net::TcpListener;

const TOKEN: &str = "imds-token";

#[derive(Clone)]
struct FakeImds {
    identity: Option<String>,
    token_requests: Arc<AtomicUsize>,
}

impl FakeImds {
    fn new() -> Self {
        Self {
            identity: Some(String::from(
                r#"{"instanceId":"i-0abc","region":"eu-west-1","availabilityZone":"eu-west-1b","accountId":"1"}"#,
            )),
            token_requests: Arc::new(AtomicUsize::new(0)),
        }
    }
}

async fn token(State(fake): State<FakeImds>, headers: HeaderMap) -> Response {
    if !headers.contains_key("x-aws-ec2-metadata-token-ttl-seconds") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    fake.token_requests.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::OK,
        [("x-aws-ec2-metadata-token-ttl-seconds", "21600")],
        TOKEN,
    )
        .into_response()
}

async fn identity(State(fake): State<FakeImds>, headers: HeaderMap) -> Response {
    let authorised = headers
        .get("x-aws-ec2-metadata-token")
        .and_then(|value| value.to_str().ok())
        == Some(TOKEN);
    if !authorised {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match fake.identity {
        Some(document) => (StatusCode::OK, document).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start(fake: FakeImds) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake metadata endpoint");
    let address = listener.local_addr().expect("local address");
    let app = Router::new()
        .route("/latest/api/token", put(token))
        .route("/latest/dynamic/instance-identity/document", get(identity))
        .with_state(fake);
    tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("serve fake metadata endpoint");
    });
    format!("http://{address}")
}

#[tokio::test]
async fn identity_document_resolves_the_instance_context() {
    let fake = FakeImds::new();
    let token_requests = Arc::clone(&fake.token_requests);
    let endpoint = start(fake).await;
    let client = ImdsClient::new(endpoint).expect("client should build");

    let context = client.resolve().await.expect("identity should resolve");

    assert_eq!(context.instance_id, "i-0abc");
    assert_eq!(context.region, "eu-west-1");
    assert_eq!(context.availability_zone, "eu-west-1b");
    assert_eq!(token_requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn blank_identity_fields_are_rejected() {
    let mut fake = FakeImds::new();
    fake.identity = Some(String::from(
        r#"{"instanceId":"i-0abc","region":"","availabilityZone":" "}"#,
    ));
    let endpoint = start(fake).await;
    let client = ImdsClient::new(endpoint).expect("client should build");

    let err = client.identity().await.expect_err("blank fields");

    let ContextError::Malformed { message, .. } = &err else {
        panic!("expected a malformed document error, got {err:?}");
    };
    assert!(message.contains("region"));
    assert!(message.contains("availabilityZone"));
    assert!(!message.contains("instanceId"));
}

#[tokio::test]
async fn missing_identity_document_reports_request_failure() {
    let mut fake = FakeImds::new();
    fake.identity = None;
    let endpoint = start(fake).await;
    let client = ImdsClient::new(endpoint).expect("client should build");

    let err = client.identity().await.expect_err("document is missing");

    assert!(matches!(err, ContextError::Request { .. }), "got: {err:?}");
    assert!(
        err.to_string().starts_with("instance metadata unavailable"),
        "got: {err}"
    );
}

#[tokio::test]
async fn unreachable_endpoint_reports_request_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local address");
    drop(listener);
    let client = ImdsClient::new(format!("http://{address}")).expect("client should build");

    let err = client.identity().await.expect_err("nothing is listening");

    assert!(matches!(err, ContextError::Request { .. }), "got: {err:?}");
}
