use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{AddChannelStatus, Channel, ChannelId, InlineKeyboard, PostId, PostRecord, RequestId},
    error::{ApiFailure, ParseError},
};

pub const INITIAL_DATA_RESPONSE: &str = "initial_data_response";
pub const ADD_CHANNEL_RESPONSE: &str = "add_channel_response";
pub const ACTION_SUCCESS: &str = "action_success";
pub const ACTION_ERROR: &str = "action_error";

/// Fields of a post submitted for scheduling, shared by both transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSubmission {
    pub channel_id: ChannelId,
    pub text: String,
    pub schedule_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_buttons: Option<InlineKeyboard>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeRequest {
    GetInitialData,
    NewPost(PostSubmission),
    DeletePost { post_id: PostId },
    AddChannel { username: String },
}

impl BridgeRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetInitialData => "get_initial_data",
            Self::NewPost(_) => "new_post",
            Self::DeletePost { .. } => "delete_post",
            Self::AddChannel { .. } => "add_channel",
        }
    }
}

/// Wire form `{type, request_id, ...payload}` of a bridge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub request_id: RequestId,
    #[serde(flatten)]
    pub request: BridgeRequest,
}

impl OutboundEnvelope {
    pub fn new(request: BridgeRequest) -> Self {
        Self {
            request_id: RequestId::new(),
            request,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaRecord {
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default, alias = "file_type")]
    pub media_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InitialData {
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub posts: Vec<PostRecord>,
    /// Absent on transports that never report server-side media.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionReport {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    InitialData(InitialData),
    AddChannel(AddChannelStatus),
    ActionSuccess(ActionReport),
    ActionError(ActionReport),
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitialData(_) => INITIAL_DATA_RESPONSE,
            Self::AddChannel(_) => ADD_CHANNEL_RESPONSE,
            Self::ActionSuccess(_) => ACTION_SUCCESS,
            Self::ActionError(_) => ACTION_ERROR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    pub request_id: Option<RequestId>,
    pub message: InboundMessage,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    request_id: Option<RequestId>,
}

impl InboundEnvelope {
    /// Decodes `{type, data, request_id?}`.
    pub fn from_json(raw: &str) -> Result<Self, ParseError> {
        let envelope: RawEnvelope = serde_json::from_str(raw).map_err(ParseError::NotJson)?;
        Self::from_parts(&envelope.kind, envelope.data, envelope.request_id)
    }

    pub fn from_parts(
        kind: &str,
        data: Option<Value>,
        request_id: Option<RequestId>,
    ) -> Result<Self, ParseError> {
        let message = match kind {
            INITIAL_DATA_RESPONSE => {
                InboundMessage::InitialData(decode_required(INITIAL_DATA_RESPONSE, data)?)
            }
            ADD_CHANNEL_RESPONSE => {
                InboundMessage::AddChannel(decode_required(ADD_CHANNEL_RESPONSE, data)?)
            }
            ACTION_SUCCESS => InboundMessage::ActionSuccess(decode_optional(ACTION_SUCCESS, data)?),
            ACTION_ERROR => InboundMessage::ActionError(decode_optional(ACTION_ERROR, data)?),
            other => return Err(ParseError::UnknownType(other.to_string())),
        };
        Ok(Self {
            request_id,
            message,
        })
    }
}

fn decode_required<T: DeserializeOwned>(
    kind: &'static str,
    data: Option<Value>,
) -> Result<T, ParseError> {
    serde_json::from_value(data.unwrap_or(Value::Null))
        .map_err(|source| ParseError::InvalidPayload { kind, source })
}

fn decode_optional<T: DeserializeOwned + Default>(
    kind: &'static str,
    data: Option<Value>,
) -> Result<T, ParseError> {
    match data {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value)
            .map_err(|source| ParseError::InvalidPayload { kind, source }),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddChannelRequest {
    pub username: String,
}

/// Body of every JSON reply from the HTTP API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiResponse {
    #[serde(default, alias = "success")]
    pub ok: bool,
    #[serde(default)]
    pub data: Option<Value>,
    /// A string for handled errors; validation failures send a structured value.
    #[serde(default)]
    pub detail: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ApiResponse {
    /// The text meant for the operator: `detail`, falling back to `message`.
    pub fn user_message(&self) -> Option<String> {
        let detail = self.detail.as_ref().map(|detail| match detail {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        });
        detail.or_else(|| self.message.clone())
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone().unwrap_or(Value::Null))
    }

    pub fn failure(&self, status: u16) -> ApiFailure {
        let message = self
            .user_message()
            .unwrap_or_else(|| format!("request failed with HTTP {status}"));
        ApiFailure::new(Some(status), message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadedMedia {
    pub file_id: String,
    #[serde(alias = "file_type")]
    pub media_type: String,
}

impl UploadedMedia {
    /// Reads the media descriptor from `data`, or from the top level where
    /// older servers put it.
    pub fn from_response(response: &ApiResponse) -> Result<Self, serde_json::Error> {
        match response.data {
            Some(Value::Object(_)) => response.data_as(),
            _ => serde_json::from_value(Value::Object(response.extra.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn outbound_envelope_flattens_payload_next_to_type() {
        let envelope = OutboundEnvelope::new(BridgeRequest::DeletePost { post_id: PostId(5) });
        let value = serde_json::to_value(&envelope).expect("encode");
        assert_eq!(value["type"], "delete_post");
        assert_eq!(value["post_id"], 5);
        assert!(value["request_id"].is_string());

        let decoded: OutboundEnvelope = serde_json::from_value(value).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn new_post_carries_submission_fields() {
        let submission = PostSubmission {
            channel_id: ChannelId(1),
            text: "hello".into(),
            schedule_time: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            file_id: Some("AgAD".into()),
            file_type: Some("photo".into()),
            inline_buttons: None,
        };
        let value = serde_json::to_value(OutboundEnvelope::new(BridgeRequest::NewPost(
            submission,
        )))
        .expect("encode");
        assert_eq!(value["type"], "new_post");
        assert_eq!(value["channel_id"], 1);
        assert_eq!(value["schedule_time"], "2025-01-01T00:00:00Z");
        assert_eq!(value["file_type"], "photo");
        assert!(value.get("inline_buttons").is_none());
    }

    #[test]
    fn initial_data_requires_a_payload() {
        let err = InboundEnvelope::from_json(r#"{"type":"initial_data_response"}"#);
        assert!(matches!(err, Err(ParseError::InvalidPayload { .. })));
    }

    #[test]
    fn action_reports_tolerate_missing_data() {
        let envelope = InboundEnvelope::from_json(r#"{"type":"action_success"}"#).expect("env");
        assert_eq!(
            envelope.message,
            InboundMessage::ActionSuccess(ActionReport::default())
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = InboundEnvelope::from_json(r#"{"type":"typing","data":{}}"#);
        assert!(matches!(err, Err(ParseError::UnknownType(kind)) if kind == "typing"));
    }

    #[test]
    fn api_response_prefers_detail_and_accepts_success_alias() {
        let response: ApiResponse =
            serde_json::from_str(r#"{"detail":"Channel '@x' not found."}"#).expect("decode");
        assert!(!response.ok);
        assert_eq!(
            response.failure(404).message,
            "Channel '@x' not found.".to_string()
        );

        let response: ApiResponse =
            serde_json::from_str(r#"{"success":true,"message":"Channel 'C' added successfully!"}"#)
                .expect("decode");
        assert!(response.ok);
        assert_eq!(
            response.user_message().as_deref(),
            Some("Channel 'C' added successfully!")
        );
    }

    #[test]
    fn uploaded_media_is_read_from_data_or_top_level() {
        let nested: ApiResponse =
            serde_json::from_str(r#"{"ok":true,"data":{"file_id":"F1","media_type":"photo"}}"#)
                .expect("decode");
        assert_eq!(
            UploadedMedia::from_response(&nested).expect("media").file_id,
            "F1"
        );

        let flat: ApiResponse =
            serde_json::from_str(r#"{"ok":true,"file_id":"F2","media_type":"video"}"#)
                .expect("decode");
        let media = UploadedMedia::from_response(&flat).expect("media");
        assert_eq!(media.file_id, "F2");
        assert_eq!(media.media_type, "video");
    }
}
