//! Instance identity discovery through the EC2 instance metadata service.
//!
//! The resolved [`InstanceContext`] is read-only and shared behind an `Arc`
//! by every lifecycle operation.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use aws_config::imds;
use aws_config::imds::client::error::ImdsError;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Default metadata endpoint reachable from every EC2 instance.
pub const DEFAULT_METADATA_ENDPOINT: &str = "http://169.254.169.254";

const IDENTITY_PATH: &str = "/latest/dynamic/instance-identity/document";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity of the instance this process runs on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceContext {
    /// Instance identifier (for example `i-0abc`).
    pub instance_id: String,
    /// Region (for example `us-east-1`).
    pub region: String,
    /// Availability zone (for example `us-east-1a`).
    pub availability_zone: String,
}

impl InstanceContext {
    /// Creates a context from its parts.
    #[must_use]
    pub fn new(
        instance_id: impl Into<String>,
        region: impl Into<String>,
        availability_zone: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            region: region.into(),
            availability_zone: availability_zone.into(),
        }
    }
}

/// Raised when the instance identity cannot be established.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The configured metadata endpoint is not a valid URI.
    #[error("instance metadata unavailable: invalid endpoint '{endpoint}': {message}")]
    Endpoint {
        /// Endpoint as configured.
        endpoint: String,
        /// Description of the problem.
        message: String,
    },
    /// The metadata service could not be reached or refused the request.
    #[error("instance metadata unavailable: request for {path} failed")]
    Request {
        /// Metadata path that was requested.
        path: &'static str,
        /// Failure reported by the metadata client.
        #[source]
        source: Box<ImdsError>,
    },
    /// The metadata document could not be understood.
    #[error("instance metadata unavailable: malformed response for {path}: {message}")]
    Malformed {
        /// Metadata path that was requested.
        path: &'static str,
        /// Description of the problem.
        message: String,
    },
}

/// Future returned by [`ContextResolver::resolve`].
pub type ContextFuture<'a> =
    Pin<Box<dyn Future<Output = Result<InstanceContext, ContextError>> + Send + 'a>>;

/// Source of the instance identity.
pub trait ContextResolver: Send + Sync {
    /// Resolves the identity of the current instance.
    fn resolve(&self) -> ContextFuture<'_>;
}

/// Resolver returning a context known ahead of time.
#[derive(Clone, Debug)]
pub struct FixedContext(pub InstanceContext);

impl ContextResolver for FixedContext {
    fn resolve(&self) -> ContextFuture<'_> {
        let context = self.0.clone();
        Box::pin(async move { Ok(context) })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityDocument {
    instance_id: String,
    region: String,
    availability_zone: String,
}

/// IMDSv2 client. Session tokens are fetched and cached by the SDK client;
/// a failed request is not retried.
#[derive(Clone, Debug)]
pub struct ImdsClient {
    client: imds::Client,
}

impl ImdsClient {
    /// Creates a client for `endpoint` (scheme, host and optional port).
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Endpoint`] when `endpoint` is not a valid
    /// URI.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ContextError> {
        let raw = endpoint.into();
        let builder = imds::Client::builder()
            .endpoint(raw.trim_end_matches('/'))
            .map_err(|err| ContextError::Endpoint {
                endpoint: raw.clone(),
                message: err.to_string(),
            })?;
        let client = builder
            .max_attempts(1)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build();
        Ok(Self { client })
    }

    /// Fetches the instance identity document.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] when the endpoint is unreachable, rejects
    /// the request, or returns a document missing required fields.
    pub async fn identity(&self) -> Result<InstanceContext, ContextError> {
        debug!(path = IDENTITY_PATH, "querying instance metadata");
        let body = self
            .client
            .get(IDENTITY_PATH)
            .await
            .map_err(|source| ContextError::Request {
                path: IDENTITY_PATH,
                source: Box::new(source),
            })?;
        parse_identity(body.as_ref())
    }
}

impl ContextResolver for ImdsClient {
    fn resolve(&self) -> ContextFuture<'_> {
        Box::pin(self.identity())
    }
}

fn parse_identity(body: &str) -> Result<InstanceContext, ContextError> {
    let document: IdentityDocument =
        serde_json::from_str(body).map_err(|err| ContextError::Malformed {
            path: IDENTITY_PATH,
            message: err.to_string(),
        })?;

    let missing: Vec<&str> = [
        ("instanceId", &document.instance_id),
        ("region", &document.region),
        ("availabilityZone", &document.availability_zone),
    ]
    .into_iter()
    .filter(|(_, value)| value.trim().is_empty())
    .map(|(name, _)| name)
    .collect();
    if !missing.is_empty() {
        return Err(ContextError::Malformed {
            path: IDENTITY_PATH,
            message: format!("empty fields: {}", missing.join(", ")),
        });
    }

    Ok(InstanceContext {
        instance_id: document.instance_id,
        region: document.region,
        availability_zone: document.availability_zone,
    })
}
