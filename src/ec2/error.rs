//! Error types for the EC2 backend.

use aws_sdk_ec2::config::http::HttpResponse;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use thiserror::Error;

use crate::backend::{ClassifyFault, RemoteFault};

/// Error codes EC2 documents as retryable.
const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "Unavailable",
    "InternalError",
    "InternalFailure",
];

/// Errors raised by the EC2 backend.
#[derive(Debug, Error)]
pub enum Ec2BackendError {
    /// The request never produced a usable response: it timed out, the
    /// connection failed, or the response could not be read.
    #[error("{action} request failed: {message}")]
    Transport {
        /// API action invoked.
        action: &'static str,
        /// Description of the failure, including its causes.
        message: String,
    },
    /// The SDK refused to build the request, for example because no
    /// credentials could be loaded.
    #[error("{action} request could not be sent: {message}")]
    Request {
        /// API action invoked.
        action: &'static str,
        /// Description of the failure, including its causes.
        message: String,
    },
    /// EC2 rejected the request.
    #[error("{action} failed with {code}: {message}")]
    Api {
        /// API action invoked.
        action: &'static str,
        /// HTTP status code, when a response was received.
        status: Option<u16>,
        /// EC2 error code such as `IncorrectState`.
        code: String,
        /// EC2 error message.
        message: String,
    },
    /// EC2 answered with a volume the backend cannot represent.
    #[error("{action} returned a malformed response: {message}")]
    Malformed {
        /// API action invoked.
        action: &'static str,
        /// Description of the problem.
        message: String,
    },
    /// The configured endpoint is not a usable URL.
    #[error("invalid EC2 endpoint '{endpoint}': {message}")]
    Endpoint {
        /// Endpoint as configured.
        endpoint: String,
        /// Description of the problem.
        message: String,
    },
}

impl Ec2BackendError {
    /// Converts an SDK failure for `action`.
    pub(super) fn from_sdk<E>(action: &'static str, err: &SdkError<E, HttpResponse>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
    {
        match err {
            SdkError::ServiceError(context) => {
                let status = context.raw().status().as_u16();
                let service = context.err();
                let code = service
                    .code()
                    .map_or_else(|| format!("HTTP{status}"), str::to_owned);
                let message = service
                    .message()
                    .map_or_else(|| DisplayErrorContext(service).to_string(), str::to_owned);
                Self::Api {
                    action,
                    status: Some(status),
                    code,
                    message,
                }
            }
            SdkError::ConstructionFailure(_) => Self::Request {
                action,
                message: DisplayErrorContext(err).to_string(),
            },
            _ => Self::Transport {
                action,
                message: DisplayErrorContext(err).to_string(),
            },
        }
    }

    /// Error for a volume id the provider does not know.
    pub(super) fn volume_not_found(action: &'static str, volume_id: &str) -> Self {
        Self::Api {
            action,
            status: None,
            code: String::from("InvalidVolume.NotFound"),
            message: format!("The volume '{volume_id}' does not exist."),
        }
    }
}

impl ClassifyFault for Ec2BackendError {
    fn fault(&self) -> RemoteFault {
        match self {
            Self::Transport { .. } => RemoteFault::Transient,
            Self::Api {
                status,
                code,
                message,
                ..
            } => classify_api(*status, code, message),
            Self::Request { .. } | Self::Malformed { .. } | Self::Endpoint { .. } => {
                RemoteFault::Other
            }
        }
    }
}

fn classify_api(status: Option<u16>, code: &str, message: &str) -> RemoteFault {
    match code {
        "InvalidParameterValue" if message.contains("already in use") => RemoteFault::DeviceInUse,
        "IncorrectState" if message.contains("'available'") => RemoteFault::AlreadyDetached,
        "InvalidVolume.NotFound" => RemoteFault::NotFound,
        _ if TRANSIENT_CODES.contains(&code) || status.is_some_and(|value| value >= 500) => {
            RemoteFault::Transient
        }
        _ => RemoteFault::Other,
    }
}
