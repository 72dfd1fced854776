//! Wire model for the relay channel.
//!
//! Every frame is a JSON object `{ "action", "device_key", "payload" }`. The
//! `action` string is resolved into the closed [`Action`] set as soon as a
//! frame is read; anything outside that set becomes
//! [`InboundMessage::Unknown`] so protocol drift stays visible.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EnvelopeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    RegisterFrontend,
    CameraFrame,
    CaptureFrame,
    Screenshot,
    AudioStream,
    RecordedAudio,
    WebRtcOffer,
    WebRtcAnswer,
    WebRtcIce,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::RegisterFrontend,
        Action::CameraFrame,
        Action::CaptureFrame,
        Action::Screenshot,
        Action::AudioStream,
        Action::RecordedAudio,
        Action::WebRtcOffer,
        Action::WebRtcAnswer,
        Action::WebRtcIce,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::RegisterFrontend => "register_frontend",
            Action::CameraFrame => "camera_frame",
            Action::CaptureFrame => "capture_frame",
            Action::Screenshot => "screenshot",
            Action::AudioStream => "audio_stream",
            Action::RecordedAudio => "recorded_audio",
            Action::WebRtcOffer => "webrtc_offer",
            Action::WebRtcAnswer => "webrtc_answer",
            Action::WebRtcIce => "webrtc_ice",
        }
    }

    pub fn parse(value: &str) -> Option<Action> {
        Action::ALL.into_iter().find(|action| action.as_str() == value)
    }

    /// Actions a viewer expects to receive from the relay.
    pub fn is_inbound(self) -> bool {
        !matches!(self, Action::RegisterFrontend | Action::WebRtcAnswer)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default)]
    pub device_key: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    pub fn new(action: Action, device_key: impl Into<String>, payload: Value) -> Self {
        Self {
            action: action.as_str().to_string(),
            device_key: device_key.into(),
            payload,
        }
    }

    /// The first frame a viewer sends on a fresh connection.
    pub fn register(device_key: impl Into<String>) -> Self {
        Self::new(Action::RegisterFrontend, device_key, Value::Null)
    }

    pub fn answer(device_key: impl Into<String>, answer: &SessionDescription) -> Self {
        Self::new(
            Action::WebRtcAnswer,
            device_key,
            serde_json::to_value(answer).unwrap_or(Value::Null),
        )
    }

    pub fn ice(device_key: impl Into<String>, candidate: &IceCandidate) -> Self {
        Self::new(
            Action::WebRtcIce,
            device_key,
            serde_json::to_value(candidate).unwrap_or(Value::Null),
        )
    }

    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(text).map_err(|err| EnvelopeError::Malformed(err.to_string()))
    }

    pub fn parse_bytes(data: &[u8]) -> Result<Self, EnvelopeError> {
        let text = std::str::from_utf8(data).map_err(|_| EnvelopeError::NotUtf8)?;
        Self::parse(text)
    }

    pub fn to_text(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|err| EnvelopeError::Malformed(err.to_string()))
    }

    pub fn known_action(&self) -> Option<Action> {
        Action::parse(&self.action)
    }

    /// Resolves the action discriminator and payload shape.
    pub fn classify(self) -> Result<InboundMessage, EnvelopeError> {
        let Some(action) = self.known_action().filter(|action| action.is_inbound()) else {
            return Ok(InboundMessage::Unknown {
                action: self.action,
                payload: self.payload,
            });
        };
        let payload = self.payload;
        let message = match action {
            Action::CameraFrame => InboundMessage::CameraFrame(media_payload(action, payload)?),
            Action::CaptureFrame => InboundMessage::CaptureFrame(media_payload(action, payload)?),
            Action::Screenshot => InboundMessage::Screenshot(media_payload(action, payload)?),
            Action::AudioStream => InboundMessage::AudioStream(media_payload(action, payload)?),
            Action::RecordedAudio => {
                InboundMessage::RecordedAudio(media_payload(action, payload)?)
            }
            Action::WebRtcOffer => {
                let description: SessionDescription =
                    serde_json::from_value(payload).map_err(|err| EnvelopeError::Payload {
                        action: action.to_string(),
                        reason: err.to_string(),
                    })?;
                InboundMessage::Offer(description)
            }
            Action::WebRtcIce => InboundMessage::Ice(IceCandidate::from_payload(payload).map_err(
                |reason| EnvelopeError::Payload {
                    action: action.to_string(),
                    reason,
                },
            )?),
            Action::RegisterFrontend | Action::WebRtcAnswer => InboundMessage::Unknown {
                action: action.to_string(),
                payload,
            },
        };
        Ok(message)
    }
}

fn media_payload(action: Action, payload: Value) -> Result<String, EnvelopeError> {
    match payload {
        Value::String(text) => Ok(text),
        other => Err(EnvelopeError::Payload {
            action: action.to_string(),
            reason: format!("expected base64 string, got {}", json_kind(&other)),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpKind,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SdpKind::Offer,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SdpKind::Answer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Deserialize)]
struct RawIceCandidate {
    #[serde(default)]
    candidate: Value,
    #[serde(default, rename = "sdpMid")]
    sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    sdp_mline_index: Option<u16>,
    #[serde(default, rename = "candidateDescription")]
    candidate_description: Option<String>,
}

impl IceCandidate {
    /// Parses a `webrtc_ice` payload. Devices put the candidate line in
    /// `candidateDescription` and a component number in `candidate`, so the
    /// string form wins wherever it appears.
    pub fn from_payload(payload: Value) -> Result<Self, String> {
        let raw: RawIceCandidate = serde_json::from_value(payload).map_err(|err| err.to_string())?;
        let candidate = match (raw.candidate, raw.candidate_description) {
            (Value::String(line), _) => line,
            (_, Some(line)) => line,
            (other, None) => {
                return Err(format!(
                    "candidate must be a string, got {}",
                    json_kind(&other)
                ));
            }
        };
        Ok(Self {
            candidate,
            sdp_mid: raw.sdp_mid,
            sdp_mline_index: raw.sdp_mline_index,
        })
    }
}

/// A classified inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    CameraFrame(String),
    CaptureFrame(String),
    Screenshot(String),
    AudioStream(String),
    RecordedAudio(String),
    Offer(SessionDescription),
    Ice(IceCandidate),
    Unknown { action: String, payload: Value },
}

impl InboundMessage {
    pub fn action(&self) -> Option<Action> {
        Some(match self {
            InboundMessage::CameraFrame(_) => Action::CameraFrame,
            InboundMessage::CaptureFrame(_) => Action::CaptureFrame,
            InboundMessage::Screenshot(_) => Action::Screenshot,
            InboundMessage::AudioStream(_) => Action::AudioStream,
            InboundMessage::RecordedAudio(_) => Action::RecordedAudio,
            InboundMessage::Offer(_) => Action::WebRtcOffer,
            InboundMessage::Ice(_) => Action::WebRtcIce,
            InboundMessage::Unknown { .. } => return None,
        })
    }

    pub fn action_name(&self) -> &str {
        match self {
            InboundMessage::Unknown { action, .. } => action,
            other => other.action().map(Action::as_str).unwrap_or_default(),
        }
    }
}

/// Selects which inbound messages a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionFilter {
    All,
    Actions(Vec<Action>),
    /// Only messages whose action is outside the known set.
    Unknown,
}

impl ActionFilter {
    pub fn only(actions: &[Action]) -> Self {
        ActionFilter::Actions(actions.to_vec())
    }

    pub fn matches(&self, message: &InboundMessage) -> bool {
        match (self, message.action()) {
            (ActionFilter::All, _) => true,
            (ActionFilter::Actions(actions), Some(action)) => actions.contains(&action),
            (ActionFilter::Actions(_), None) => false,
            (ActionFilter::Unknown, action) => action.is_none(),
        }
    }
}
