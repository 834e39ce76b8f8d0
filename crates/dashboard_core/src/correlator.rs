//! Decodes inbound bridge traffic and ties each response to the request that
//! caused it.
//!
//! Two encodings are accepted:
//!
//! * the JSON envelope `{type, data, request_id?}`
//! * the legacy wrapped form `<tag>__TWA_RESPONSE__||<type>||<json></tag>`
//!
//! Anything else is not a response and is dropped without touching state.

use std::collections::VecDeque;

use serde_json::Value;
use shared::{
    domain::RequestId,
    error::ParseError,
    protocol::{InboundEnvelope, InboundMessage},
};
use tracing::{debug, warn};

use crate::{loading::LoadingToken, Operation};

pub const LEGACY_MARKER: &str = "__TWA_RESPONSE__";
const LEGACY_DELIMITER: &str = "||";

pub fn decode(raw: &str) -> Result<InboundEnvelope, ParseError> {
    let raw = raw.trim();
    if raw.starts_with('<') {
        decode_legacy(raw)
    } else {
        InboundEnvelope::from_json(raw)
    }
}

fn decode_legacy(raw: &str) -> Result<InboundEnvelope, ParseError> {
    let body = strip_wrapper(raw)?;
    let fields: Vec<&str> = body.splitn(3, LEGACY_DELIMITER).collect();
    let [marker, kind, payload] = fields[..] else {
        return Err(ParseError::FieldCount(fields.len()));
    };
    if marker != LEGACY_MARKER {
        return Err(ParseError::UnexpectedMarker(marker.to_string()));
    }
    let data: Value = serde_json::from_str(payload).map_err(ParseError::NotJson)?;
    InboundEnvelope::from_parts(kind, Some(data), None)
}

/// `<tag>body</tag>` to `body`; the closing tag must match the opening one.
fn strip_wrapper(raw: &str) -> Result<&str, ParseError> {
    let rest = raw
        .strip_prefix('<')
        .ok_or(ParseError::MalformedWrapper("missing opening tag"))?;
    let (tag, rest) = rest
        .split_once('>')
        .ok_or(ParseError::MalformedWrapper("unterminated opening tag"))?;
    let valid_tag = !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid_tag {
        return Err(ParseError::MalformedWrapper("invalid tag name"));
    }
    rest.strip_suffix(&format!("</{tag}>"))
        .ok_or(ParseError::MalformedWrapper("missing matching closing tag"))
}

/// Whether `message` is a possible answer to a request of `operation`.
fn answers(operation: Operation, message: &InboundMessage) -> bool {
    match (operation, message) {
        (Operation::FetchData, InboundMessage::InitialData(_)) => true,
        (Operation::AddChannel, InboundMessage::AddChannel(_)) => true,
        (
            Operation::AddChannel | Operation::SchedulePost | Operation::DeletePost,
            InboundMessage::ActionSuccess(_) | InboundMessage::ActionError(_),
        ) => true,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub operation: Operation,
    pub token: LoadingToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    Matched(PendingRequest),
    /// Server push, or a response to a request that already expired.
    Unsolicited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    pub correlation: Correlation,
    pub message: InboundMessage,
}

/// Outstanding bridge requests in issue order.
#[derive(Default)]
pub struct ResponseCorrelator {
    pending: VecDeque<PendingRequest>,
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, request_id: RequestId, operation: Operation, token: LoadingToken) {
        self.pending.push_back(PendingRequest {
            request_id,
            operation,
            token,
        });
    }

    pub fn forget(&mut self, request_id: RequestId) -> Option<PendingRequest> {
        let index = self
            .pending
            .iter()
            .position(|pending| pending.request_id == request_id)?;
        self.pending.remove(index)
    }

    pub fn forget_token(&mut self, token: LoadingToken) -> Option<PendingRequest> {
        let index = self
            .pending
            .iter()
            .position(|pending| pending.token == token)?;
        self.pending.remove(index)
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Decodes `raw` and correlates it. `None` means the message was not a
    /// response at all.
    pub fn accept(&mut self, raw: &str) -> Option<Routed> {
        let envelope = match decode(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(error = %err, "correlator: ignoring inbound message");
                return None;
            }
        };
        let correlation = self.correlate(&envelope);
        Some(Routed {
            correlation,
            message: envelope.message,
        })
    }

    pub fn correlate(&mut self, envelope: &InboundEnvelope) -> Correlation {
        let index = match envelope.request_id {
            Some(request_id) => {
                let found = self
                    .pending
                    .iter()
                    .position(|pending| pending.request_id == request_id);
                match found {
                    Some(index) if answers(self.pending[index].operation, &envelope.message) => {
                        Some(index)
                    }
                    Some(index) => {
                        warn!(
                            %request_id,
                            operation = %self.pending[index].operation,
                            response = envelope.message.kind(),
                            "correlator: response type does not fit its request"
                        );
                        None
                    }
                    None => None,
                }
            }
            None => self
                .pending
                .iter()
                .position(|pending| answers(pending.operation, &envelope.message)),
        };

        match index.and_then(|index| self.pending.remove(index)) {
            Some(pending) => Correlation::Matched(pending),
            None => Correlation::Unsolicited,
        }
    }
}

#[cfg(test)]
#[path = "tests/correlator_tests.rs"]
mod tests;
