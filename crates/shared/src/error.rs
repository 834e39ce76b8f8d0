use thiserror::Error;

/// Why an inbound message could not be read as a response envelope.
///
/// The bridge carries unrelated traffic too, so callers treat every variant as
/// "not for us" rather than as a failure worth surfacing.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("message is not a JSON envelope: {0}")]
    NotJson(#[source] serde_json::Error),
    #[error("envelope has an unknown type tag {0:?}")]
    UnknownType(String),
    #[error("payload of {kind} does not match its schema: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("legacy wrapper is malformed: {0}")]
    MalformedWrapper(&'static str),
    #[error("legacy body has {0} fields, expected 3")]
    FieldCount(usize),
    #[error("legacy body carries marker {0:?}")]
    UnexpectedMarker(String),
}

/// Failure detail extracted from a `{ok: false, detail|message}` reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ApiFailure {
    pub status: Option<u16>,
    pub message: String,
}

impl ApiFailure {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}
