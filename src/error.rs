//! Error types for stub registration, proxying and fault injection.

use thiserror::Error;

/// Errors surfaced by the stub registry.
#[derive(Debug, Error)]
pub enum StubError {
    /// The definition has contradictory or unparseable fields.
    #[error("invalid stub definition `{id}`: {reason}")]
    InvalidRuleDefinition { id: String, reason: String },

    /// The id was already issued by this registry (possibly to a removed stub).
    #[error("stub id `{0}` has already been issued by this registry")]
    DuplicateId(String),
}

impl StubError {
    pub(crate) fn invalid(id: impl Into<String>, reason: impl Into<String>) -> Self {
        StubError::InvalidRuleDefinition {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from forwarding a request to an upstream service.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid HTTP method for upstream request: {0}")]
    InvalidMethod(String),

    #[error("upstream request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Returned to the transport when a rule asks for the connection to be
/// dropped without a response.
#[derive(Debug, Error)]
#[error("fault injected: connection closed without response")]
pub struct FaultInjected;
