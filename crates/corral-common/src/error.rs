//! Error types for corral controllers and actuators
//!
//! Errors are structured with fields so that status messages, events, and
//! logs carry the resource and cloud context that produced them. Every error
//! is classified by [`Error::is_retryable`]: retryable errors go back to the
//! controller runtime for requeue, permanent ones are recorded on the
//! resource status and left until the spec changes.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// HTTP status the compute API and the Kubernetes API use for missing resources
pub const NOT_FOUND: u16 = 404;

/// HTTP status Kubernetes returns when a write loses an optimistic-concurrency race
pub const CONFLICT: u16 = 409;

/// Main error type for corral operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The resource changed between read and write
    #[error("conflict writing {kind} {name}: object was modified since it was read")]
    Conflict {
        /// Resource kind (Cluster, Machine, Secret)
        kind: String,
        /// Resource name
        name: String,
    },

    /// Provider config blob could not be decoded into the expected kind
    #[error("provider config decode error for {resource}: {message}")]
    Decode {
        /// Resource whose provider config was rejected
        resource: String,
        /// What was wrong with the blob
        message: String,
    },

    /// Invalid resource spec
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource with the invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.providerConfig")
        field: Option<String>,
    },

    /// The requested actuator verb is not implemented for this change
    #[error("{operation} not supported for {resource}: {message}")]
    Unsupported {
        /// Resource the operation targeted
        resource: String,
        /// Actuator verb (update, delete)
        operation: String,
        /// Why it is not supported
        message: String,
    },

    /// Compute API request failed
    #[error("compute error for {resource}: {message}")]
    Compute {
        /// Cloud resource path or name the request targeted
        resource: String,
        /// Message returned by the API (or transport error)
        message: String,
        /// HTTP status code if the API answered
        code: Option<u16>,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// A long-running cloud operation reached DONE with errors
    #[error("operation {operation} failed: {message}")]
    OperationFailed {
        /// Operation name
        operation: String,
        /// Errors reported by the operation
        message: String,
    },

    /// Polling exceeded its deadline
    #[error("timed out after {elapsed_secs}s waiting for {operation}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Seconds spent before giving up
        elapsed_secs: u64,
    },

    /// Work was cancelled before it completed
    #[error("cancelled while waiting for {operation}")]
    Cancelled {
        /// What was being waited for
        operation: String,
    },

    /// External command failed; `output` is the captured combined output
    #[error("command `{command}` failed: {message}: {output}")]
    Command {
        /// Command line that was run
        command: String,
        /// Exit status or spawn failure
        message: String,
        /// Combined stdout and stderr
        output: String,
    },

    /// Some steps of a multi-step operation failed
    #[error("{operation} partially failed: {}", .failures.join("; "))]
    PartialFailure {
        /// The multi-step operation
        operation: String,
        /// One entry per failed step
        failures: Vec<String>,
    },

    /// No setup config entry matched the parameters
    #[error("could not find a matching {table} config for {params}")]
    SetupNoMatch {
        /// Table that was searched (machine setup, cluster setup)
        table: String,
        /// Rendered query parameters
        params: String,
    },

    /// More than one setup config entry matched the parameters
    #[error("found multiple matching {table} configs for {params} ({matches} matches)")]
    SetupAmbiguous {
        /// Table that was searched
        table: String,
        /// Rendered query parameters
        params: String,
        /// Number of matching entries
        matches: usize,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Process configuration is invalid or unreadable
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "firewall")
        context: String,
    },
}

impl Error {
    /// Map a Kubernetes write error, turning optimistic-concurrency losses into [`Error::Conflict`]
    pub fn from_kube_write(kind: &str, name: &str, source: kube::Error) -> Self {
        match source {
            kube::Error::Api(ae) if ae.code == CONFLICT => Self::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            other => Self::Kube { source: other },
        }
    }

    /// Create a decode error for the given resource
    pub fn decode(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Decode {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an unsupported-operation error
    pub fn unsupported(
        resource: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Unsupported {
            resource: resource.into(),
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a compute error from an HTTP status
    ///
    /// 429 and 5xx are retryable, other 4xx are not.
    pub fn compute_status(resource: impl Into<String>, code: u16, msg: impl Into<String>) -> Self {
        Self::Compute {
            resource: resource.into(),
            message: msg.into(),
            code: Some(code),
            retryable: code == 429 || code >= 500,
        }
    }

    /// Create a retryable compute error without a status (transport failure)
    pub fn compute_transport(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Compute {
            resource: resource.into(),
            message: msg.into(),
            code: None,
            retryable: true,
        }
    }

    /// Create a not-found compute error
    pub fn compute_not_found(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        Self::Compute {
            message: format!("{} not found", resource),
            resource,
            code: Some(NOT_FOUND),
            retryable: false,
        }
    }

    /// Create an error for a cloud operation that finished with errors
    pub fn operation_failed(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a command failure carrying the captured output
    pub fn command(
        command: impl Into<String>,
        msg: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
            output: output.into(),
        }
    }

    /// Aggregate step failures of a multi-step operation
    pub fn partial_failure(operation: impl Into<String>, failures: Vec<Error>) -> Self {
        Self::PartialFailure {
            operation: operation.into(),
            failures: failures.iter().map(ToString::to_string).collect(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
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
    /// Transient failures (network, timeouts, conflicts, cloud operations that
    /// finished with errors, partially applied multi-step work) are retryable. Structural problems with the
    /// resource spec or process configuration are not: retrying cannot fix them.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == CONFLICT => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Conflict { .. } => true,
            Error::Decode { .. } => false,
            Error::Validation { .. } => false,
            Error::Unsupported { .. } => false,
            Error::Compute { retryable, .. } => *retryable,
            Error::OperationFailed { .. } => true,
            Error::Timeout { .. } => true,
            Error::Cancelled { .. } => true,
            Error::Command { .. } => true,
            Error::PartialFailure { .. } => true,
            Error::SetupNoMatch { .. } => false,
            Error::SetupAmbiguous { .. } => false,
            Error::Serialization { .. } => false,
            Error::Configuration { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Inverse of [`Error::is_retryable`]
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }

    /// Whether the API reported the target as missing
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Compute { code, .. } => *code == Some(NOT_FOUND),
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == NOT_FOUND,
            _ => false,
        }
    }

    /// Whether the spec itself is wrong (as opposed to an unsupported change)
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Error::Decode { .. }
                | Error::Validation { .. }
                | Error::SetupNoMatch { .. }
                | Error::SetupAmbiguous { .. }
                | Error::Serialization { .. }
                | Error::Configuration { .. }
        )
    }

    /// Short label used for metrics and logs
    pub fn class(&self) -> &'static str {
        if self.is_retryable() {
            "transient"
        } else {
            "permanent"
        }
    }
}
