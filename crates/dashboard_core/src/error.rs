use shared::error::ApiFailure;
use thiserror::Error;

use crate::Operation;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid endpoint {endpoint}: {source}")]
    Endpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("server rejected the request: {0}")]
    Rejected(#[from] ApiFailure),
    #[error("unexpected response body from {endpoint}: {source}")]
    Body {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("bridge is closed")]
    BridgeClosed,
    #[error("bridge send failed: {0}")]
    Bridge(String),
}

impl TransportError {
    /// Text shown to the operator for this failure.
    pub fn user_message(&self) -> String {
        match self {
            Self::Rejected(failure) => failure.message.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("channel username cannot be empty")]
    EmptyChannelName,
    #[error("channel username must start with @")]
    ChannelNameFormat,
    #[error("a post needs text or attached media")]
    EmptyPost,
    #[error("button text and URL cannot be empty")]
    EmptyButton,
    #[error("URL must start with http:// or https:// (got {0:?})")]
    ButtonUrl(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{operation} is not supported over the {transport} transport")]
    Unsupported {
        operation: Operation,
        transport: &'static str,
    },
    #[error("preview could not be created: {0}")]
    Preview(#[source] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
