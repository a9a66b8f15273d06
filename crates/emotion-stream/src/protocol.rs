//! # Wire Protocol
//!
//! Message shapes exchanged on the ingress WebSocket.
//!
//! ## Client → gateway
//!
//! | Frame | Meaning |
//! |-------|---------|
//! | binary | one encoded image (JPEG bytes) |
//! | `{"type":"location","lat":..,"lng":..}` | geolocation for recommendations |
//! | `{"type":"control","action":"stop"}` | end the session |
//! | `{"type":"stop"}` | end the session |
//!
//! Anything else is ignored.
//!
//! ## Gateway → client
//!
//! ```json
//! {"type":"emotion","sessionId":"…","emotion":"happy","confidence":0.82,
//!  "ts":1767225600000,"recommendations":{"outfit":"…","food":"…","music":"…"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StreamError, StreamResult};
use crate::observation::EmotionObservation;
use crate::recommend::{GeoLocation, Recommendations};

/// Control message types understood by the gateway.
pub mod message_types {
    pub const LOCATION: &str = "location";
    pub const CONTROL: &str = "control";
    pub const STOP: &str = "stop";
}

/// A decoded text message from the capture client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    /// Update the session's geolocation context.
    Location(GeoLocation),
    /// Tear the session down.
    Stop,
}

impl ClientCommand {
    /// Decode a text frame.
    ///
    /// Returns `Err` for text that is not a JSON object and `Ok(None)` for
    /// well-formed JSON that is not a recognized command (unknown or missing
    /// `type`, unknown control action, out-of-range coordinates).
    pub fn parse(text: &str) -> StreamResult<Option<Self>> {
        let value: Value = serde_json::from_str(text)?;
        let Some(object) = value.as_object() else {
            return Err(StreamError::ProtocolError {
                reason: "control message is not a JSON object".into(),
            });
        };

        let command = match object.get("type").and_then(Value::as_str) {
            Some(message_types::LOCATION) => {
                let lat = object.get("lat").and_then(Value::as_f64);
                let lng = object.get("lng").and_then(Value::as_f64);
                lat.zip(lng)
                    .and_then(|(lat, lng)| GeoLocation::new(lat, lng))
                    .map(ClientCommand::Location)
            }
            Some(message_types::CONTROL) => match object.get("action").and_then(Value::as_str) {
                Some(message_types::STOP) => Some(ClientCommand::Stop),
                _ => None,
            },
            Some(message_types::STOP) => Some(ClientCommand::Stop),
            _ => None,
        };
        Ok(command)
    }

    /// Encode as the JSON text a capture client sends.
    pub fn to_json(&self) -> String {
        match self {
            ClientCommand::Location(location) => serde_json::json!({
                "type": message_types::LOCATION,
                "lat": location.lat,
                "lng": location.lng,
            })
            .to_string(),
            ClientCommand::Stop => serde_json::json!({
                "type": message_types::CONTROL,
                "action": message_types::STOP,
            })
            .to_string(),
        }
    }
}

/// Discriminator of outbound updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Emotion,
    EmotionUpdate,
    Recommendations,
}

/// Outbound message sent to the capture client for each upstream result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmotionUpdate {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub emotion: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Recommendations>,
}

impl EmotionUpdate {
    pub fn from_observation(session_id: &str, observation: &EmotionObservation) -> Self {
        Self {
            kind: UpdateKind::Emotion,
            session_id: Some(session_id.to_string()),
            emotion: observation.label.clone(),
            confidence: observation.confidence,
            ts: observation.timestamp_ms(),
            recommendations: observation.recommendations.clone(),
        }
    }

    pub fn to_json(&self) -> StreamResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// An update as seen by a capture client.
///
/// Deserialization is lenient: the label may arrive as `emotion` or
/// `dominantEmotion` and recommendations as `recommendations` or
/// `recommendation`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerUpdate {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub session_id: Option<String>,
    #[serde(alias = "dominantEmotion")]
    pub emotion: Option<String>,
    pub confidence: Option<f64>,
    pub ts: Option<i64>,
    #[serde(alias = "recommendation")]
    pub recommendations: Option<Recommendations>,
}

impl ServerUpdate {
    /// Decode a text frame from the gateway; `None` if it is not an update.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str::<Self>(text)
            .ok()
            .filter(|update| update.emotion.is_some())
    }
}
