//! Error types for the service mirror
//!
//! Errors carry enough context (link, secret, resource kind) to be useful in
//! logs, since nothing in the mirroring path propagates to a human caller.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for service mirror operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error (local or remote cluster)
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid Link specification
    #[error("validation error for link {link}: {message}")]
    Validation {
        /// Name of the Link with invalid configuration
        link: String,
        /// Description of what's invalid
        message: String,
    },

    /// Credentials secret could not be turned into a remote access config
    #[error("credentials error for secret {secret}: {message}")]
    Credentials {
        /// Name of the credentials secret
        secret: String,
        /// Description of what failed
        message: String,
    },

    /// A remote event carried a snapshot that cannot be mirrored
    #[error("malformed {kind} event: {message}")]
    MalformedEvent {
        /// Resource kind of the event (Service, Endpoints)
        kind: String,
        /// Description of what's wrong with the snapshot
        message: String,
    },

    /// A remote watch stream terminated
    #[error("watch on remote {resource} closed: {message}")]
    WatchClosed {
        /// Watched resource (services, endpoints)
        resource: String,
        /// Why the stream ended
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "engine", "supervisor")
        context: String,
    },
}

impl Error {
    /// Create a validation error for a Link
    pub fn validation(link: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            link: link.into(),
            message: msg.into(),
        }
    }

    /// Create a credentials error for a secret
    pub fn credentials(secret: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credentials {
            secret: secret.into(),
            message: msg.into(),
        }
    }

    /// Create a malformed event error
    pub fn malformed(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedEvent {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a watch closure error
    pub fn watch_closed(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::WatchClosed {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Kubernetes 4xx responses are permanent, except 409 Conflict and
    /// 429 Too Many Requests. Bad links, bad credentials and malformed
    /// snapshots need a fix upstream and are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 || ae.code == 429 => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Credentials { .. } => false,
            Error::MalformedEvent { .. } => false,
            Error::WatchClosed { .. } => true,
            Error::Internal { .. } => true,
        }
    }
}
