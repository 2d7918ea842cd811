//! HTTP front door exposing mount and unmount over a unix socket or TCP.
//!
//! Each request spawns its lifecycle operation onto a [`TaskTracker`], so a
//! client that disconnects mid-request never abandons a half-provisioned
//! volume, and shutdown waits for every tracked operation to finish.

use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::FileTypeExt;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Json;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::backend::VolumeBackend;
use crate::lifecycle::{MountResult, VolumeLifecycleManager};
use crate::mount::CommandRunner;
use crate::request::{MountRequest, UnmountRequest, ValidationError};

/// Where the service listens.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Transport {
    /// Unix domain socket at the given path.
    Unix(Utf8PathBuf),
    /// TCP socket address.
    Tcp(SocketAddr),
}

/// Errors raised while running the service.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Address or socket path.
        address: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A non-socket file occupies the socket path.
    #[error("refusing to replace {path}: not a unix socket")]
    NotASocket {
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// Filesystem work around the socket failed.
    #[error("socket file operation on {path} failed: {source}")]
    Socket {
        /// Socket path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The accept loop failed.
    #[error("server failed: {0}")]
    Serve(#[source] io::Error),
}

struct AppState<B, R> {
    manager: Arc<VolumeLifecycleManager<B, R>>,
    tracker: TaskTracker,
}

impl<B, R> Clone for AppState<B, R> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            tracker: self.tracker.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct Empty {}

/// Error response rendered as `{"error": ..., "kind": ...}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                error: message.into(),
                kind: "validation",
            },
        }
    }

    fn internal(message: impl Into<String>, kind: &'static str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorBody {
                error: message.into(),
                kind,
            },
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::validation(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::validation("request body is required"));
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError::validation(format!("malformed request body: {err}")))
}

/// Builds the router serving `POST /mount` and `POST /unmount`.
///
/// Operations are spawned onto `tracker`; callers that need to drain them
/// close and await the tracker after the server stops.
pub fn router<B, R>(manager: Arc<VolumeLifecycleManager<B, R>>, tracker: TaskTracker) -> Router
where
    B: VolumeBackend + 'static,
    R: CommandRunner + 'static,
{
    Router::new()
        .route("/mount", post(mount::<B, R>))
        .route("/unmount", post(unmount::<B, R>))
        .with_state(AppState { manager, tracker })
}

async fn mount<B, R>(
    State(state): State<AppState<B, R>>,
    body: Bytes,
) -> Result<Json<MountResult>, ApiError>
where
    B: VolumeBackend + 'static,
    R: CommandRunner + 'static,
{
    let request: MountRequest = parse_body(&body)?;
    let spec = request.validate()?;
    let manager = state.manager;
    let outcome = state
        .tracker
        .spawn(async move {
            manager
                .create_and_mount(&spec, &CancellationToken::new())
                .await
        })
        .await
        .map_err(|err| ApiError::internal(err.to_string(), "internal"))?;

    outcome.map(Json).map_err(|err| {
        warn!(error = %err, kind = err.kind(), "mount request failed");
        ApiError::internal(err.to_string(), err.kind())
    })
}

async fn unmount<B, R>(
    State(state): State<AppState<B, R>>,
    body: Bytes,
) -> Result<Json<Empty>, ApiError>
where
    B: VolumeBackend + 'static,
    R: CommandRunner + 'static,
{
    let request: UnmountRequest = parse_body(&body)?;
    let target = request.validate()?;
    let manager = state.manager;
    let outcome = state
        .tracker
        .spawn(async move {
            manager
                .unmount_detach_delete(
                    &target.volume_id,
                    target.mount_point.as_deref(),
                    &CancellationToken::new(),
                )
                .await
        })
        .await
        .map_err(|err| ApiError::internal(err.to_string(), "internal"))?;

    outcome.map(|()| Json(Empty {})).map_err(|err| {
        warn!(error = %err, kind = err.kind(), "unmount request failed");
        ApiError::internal(err.to_string(), err.kind())
    })
}

/// Removes a leftover socket file from a previous run.
///
/// # Errors
///
/// Returns [`ServerError::NotASocket`] when the path holds something other
/// than a socket, and [`ServerError::Socket`] when it cannot be inspected or
/// removed.
pub async fn remove_stale_socket(path: &Utf8Path) -> Result<(), ServerError> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(ServerError::Socket {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if !metadata.file_type().is_socket() {
        return Err(ServerError::NotASocket {
            path: path.to_path_buf(),
        });
    }
    info!(%path, "removing stale socket");
    tokio::fs::remove_file(path)
        .await
        .map_err(|source| ServerError::Socket {
            path: path.to_path_buf(),
            source,
        })
}

/// Serves requests on `transport` until `shutdown` resolves, then waits for
/// in-flight operations and removes the unix socket file.
///
/// # Errors
///
/// Returns [`ServerError`] when binding or serving fails.
pub async fn serve<B, R, F>(
    manager: Arc<VolumeLifecycleManager<B, R>>,
    transport: Transport,
    shutdown: F,
) -> Result<(), ServerError>
where
    B: VolumeBackend + 'static,
    R: CommandRunner + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let tracker = TaskTracker::new();
    let app = router(manager, tracker.clone());

    let served = match &transport {
        Transport::Tcp(address) => {
            let listener =
                TcpListener::bind(address)
                    .await
                    .map_err(|source| ServerError::Bind {
                        address: address.to_string(),
                        source,
                    })?;
            info!(%address, "listening on tcp");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
        }
        Transport::Unix(path) => {
            remove_stale_socket(path).await?;
            if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| ServerError::Socket {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
            let listener = UnixListener::bind(path).map_err(|source| ServerError::Bind {
                address: path.to_string(),
                source,
            })?;
            info!(%path, "listening on unix socket");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
        }
    };

    info!("shutting down; waiting for in-flight operations");
    tracker.close();
    tracker.wait().await;

    if let Transport::Unix(path) = &transport {
        if let Err(err) = tokio::fs::remove_file(path).await {
            warn!(%path, error = %err, "failed to remove socket file");
        }
    }
    served.map_err(ServerError::Serve)
}

#[cfg(test)]
mod tests;
