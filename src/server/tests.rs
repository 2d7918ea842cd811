//! Router and transport tests driven through `tower::ServiceExt::oneshot`.

use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use rstest::{fixture, rstest};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use super::*;
use crate::test_support::Harness;

struct Rig {
    harness: Harness,
    dir: TempDir,
}

impl Rig {
    fn app(&self) -> Router {
        router(Arc::clone(&self.harness.manager), TaskTracker::new())
    }

    fn mount_point(&self) -> String {
        self.dir.path().join("data").display().to_string()
    }
}

#[fixture]
fn rig() -> Rig {
    Rig {
        harness: Harness::new(),
        dir: TempDir::new().expect("create temp dir"),
    }
}

async fn post_json(app: Router, path: &str, body: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_owned()))
        .expect("build request");
    let response = app.oneshot(request).await.expect("router is infallible");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let json = serde_json::from_slice(&bytes).expect("json body");
    (status, json)
}

#[rstest]
#[tokio::test]
async fn mount_returns_the_mount_result(rig: Rig) {
    let body = serde_json::json!({ "mount_point": rig.mount_point() }).to_string();

    let (status, json) = post_json(rig.app(), "/mount", &body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["device"], "/dev/sdf");
    assert_eq!(json["volume_id"], "vol-1");
    assert_eq!(json["mount_point"], rig.mount_point());
    let requests = rig.harness.cloud.create_requests();
    assert_eq!(requests.first().map(|request| request.size_gb), Some(200));
}

#[rstest]
#[case::empty("")]
#[case::blank("  \n")]
#[tokio::test]
async fn empty_body_is_a_validation_error(rig: Rig, #[case] body: &str) {
    let (status, json) = post_json(rig.app(), "/mount", body).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "validation");
    assert!(rig.harness.cloud.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn malformed_body_is_a_validation_error(rig: Rig) {
    let (status, json) = post_json(rig.app(), "/mount", "{not json").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "validation");
    assert!(
        json["error"]
            .as_str()
            .is_some_and(|message| message.contains("malformed"))
    );
}

#[rstest]
#[tokio::test]
async fn invalid_fields_are_all_reported(rig: Rig) {
    let body = r#"{"size": -1, "mount_point": "data", "volume_type": "gp9"}"#;

    let (status, json) = post_json(rig.app(), "/mount", body).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let message = json["error"].as_str().unwrap_or_default();
    assert!(message.contains("invalid size"), "{message}");
    assert!(message.contains("absolute path"), "{message}");
    assert!(message.contains("gp9"), "{message}");
    assert!(rig.harness.cloud.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn lifecycle_failure_maps_to_500_with_kind(rig: Rig) {
    rig.harness.runner.push_failure(1, "mkfs: bad superblock");
    let body = serde_json::json!({ "mount_point": rig.mount_point() }).to_string();

    let (status, json) = post_json(rig.app(), "/mount", &body).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["kind"], "external_tool_failure");
    assert_eq!(rig.harness.cloud.delete_calls(), vec![String::from("vol-1")]);
}

#[rstest]
#[tokio::test]
async fn unmount_returns_an_empty_object(rig: Rig) {
    rig.harness.cloud.seed_available("vol-7");

    let (status, json) = post_json(rig.app(), "/unmount", r#"{"volume_id": "vol-7"}"#).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, serde_json::json!({}));
    assert_eq!(rig.harness.cloud.delete_calls(), vec![String::from("vol-7")]);
}

#[rstest]
#[tokio::test]
async fn unmount_requires_a_volume_id(rig: Rig) {
    let (status, json) = post_json(rig.app(), "/unmount", r#"{"mount_point": "/data"}"#).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "validation");
}

#[rstest]
#[tokio::test]
async fn unmount_of_missing_volume_reports_not_found(rig: Rig) {
    let (status, json) = post_json(rig.app(), "/unmount", r#"{"volume_id": "vol-404"}"#).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["kind"], "not_found");
}

#[tokio::test]
async fn stale_socket_is_removed() {
    let dir = TempDir::new().expect("create temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("stale.sock")).expect("utf-8 path");
    drop(std::os::unix::net::UnixListener::bind(&path).expect("bind socket"));
    assert!(path.exists());

    remove_stale_socket(&path).await.expect("remove stale socket");

    assert!(!path.exists());
}

#[tokio::test]
async fn regular_file_is_not_replaced() {
    let dir = TempDir::new().expect("create temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("ebsmount.sock")).expect("utf-8 path");
    std::fs::write(&path, b"data").expect("write file");

    let err = remove_stale_socket(&path).await.expect_err("not a socket");

    assert!(matches!(err, ServerError::NotASocket { .. }), "{err}");
    assert!(path.exists());
}

#[tokio::test]
async fn unix_server_removes_its_socket_on_shutdown() {
    let dir = TempDir::new().expect("create temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("run/ebsmount.sock")).expect("utf-8 path");
    let harness = Harness::new();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(serve(
        Arc::clone(&harness.manager),
        Transport::Unix(path.clone()),
        async move {
            stopped.await.ok();
        },
    ));

    for _ in 0..100 {
        if path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(path.exists(), "socket should be bound");

    stop.send(()).expect("server still running");
    server
        .await
        .expect("server task")
        .expect("server exits cleanly");
    assert!(!path.exists(), "socket should be removed");
}
