use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod permissions;
pub mod records;

pub use permissions::{CollectionMethod, PermissionSet};
pub use records::{
    BreakReminder, ContentTrigger, DataKind, EmotionSample, GazeSample, Record, RecordError,
};

/// Protocol version (bumped when breaking changes are introduced)
pub const VERSION: u8 = 1;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Envelope shared by every channel: `{type, payload, timestamp}`.
///
/// `id` is set on requests that expect a reply, `replyTo` on the reply.
/// Both are omitted from the wire form when absent. A message is never
/// mutated after construction; builders consume and return a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
}

impl Message {
    pub fn new<S: Into<String>>(msg_type: S, payload: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            payload,
            timestamp: now_millis(),
            id: None,
            reply_to: None,
        }
    }

    pub fn of(kind: MessageType, payload: Value) -> Self {
        Self::new(kind.as_str(), payload)
    }

    /// Tag the message with a correlation id so the receiver replies.
    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Build the reply to this message. `PING` is answered with `PONG`,
    /// everything else with `<TYPE>_RESPONSE`.
    pub fn reply(&self, payload: Value) -> Self {
        Self {
            msg_type: reply_type(&self.msg_type),
            payload,
            timestamp: now_millis(),
            id: None,
            reply_to: self.id.clone(),
        }
    }

    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::parse(&self.msg_type)
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn expects_reply(&self) -> bool {
        self.id.is_some()
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Decode a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

pub fn reply_type(request_type: &str) -> String {
    if request_type == MessageType::Ping.as_str() {
        MessageType::Pong.as_str().to_string()
    } else {
        format!("{}_RESPONSE", request_type)
    }
}

/// Known message types. The router keys on the raw string so peers may
/// still exchange types that are not listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    Pong,
    GetPermissions,
    RequestPermissions,
    GetAnalyticsData,
    GetWebcamData,
    GetContinuousData,
    EmotionUpdate,
    ContentTrigger,
    BreakReminder,
    AnalyzePage,
    SyncLocalData,
    ClearData,
    PermissionsUpdated,
    ExtensionConnected,
    ExtensionDisconnected,
    CampusPulseUpdate,
    EmotionData,
    GazeData,
    AnalyticsData,
    WebcamData,
}

impl MessageType {
    pub const ALL: [MessageType; 21] = [
        MessageType::Ping,
        MessageType::Pong,
        MessageType::GetPermissions,
        MessageType::RequestPermissions,
        MessageType::GetAnalyticsData,
        MessageType::GetWebcamData,
        MessageType::GetContinuousData,
        MessageType::EmotionUpdate,
        MessageType::ContentTrigger,
        MessageType::BreakReminder,
        MessageType::AnalyzePage,
        MessageType::SyncLocalData,
        MessageType::ClearData,
        MessageType::PermissionsUpdated,
        MessageType::ExtensionConnected,
        MessageType::ExtensionDisconnected,
        MessageType::CampusPulseUpdate,
        MessageType::EmotionData,
        MessageType::GazeData,
        MessageType::AnalyticsData,
        MessageType::WebcamData,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::GetPermissions => "GET_PERMISSIONS",
            MessageType::RequestPermissions => "REQUEST_PERMISSIONS",
            MessageType::GetAnalyticsData => "GET_ANALYTICS_DATA",
            MessageType::GetWebcamData => "GET_WEBCAM_DATA",
            MessageType::GetContinuousData => "GET_CONTINUOUS_DATA",
            MessageType::EmotionUpdate => "EMOTION_UPDATE",
            MessageType::ContentTrigger => "CONTENT_TRIGGER",
            MessageType::BreakReminder => "BREAK_REMINDER",
            MessageType::AnalyzePage => "ANALYZE_PAGE",
            MessageType::SyncLocalData => "SYNC_LOCAL_DATA",
            MessageType::ClearData => "CLEAR_DATA",
            MessageType::PermissionsUpdated => "PERMISSIONS_UPDATED",
            MessageType::ExtensionConnected => "EXTENSION_CONNECTED",
            MessageType::ExtensionDisconnected => "EXTENSION_DISCONNECTED",
            MessageType::CampusPulseUpdate => "CAMPUS_PULSE_UPDATE",
            MessageType::EmotionData => "EMOTION_DATA",
            MessageType::GazeData => "GAZE_DATA",
            MessageType::AnalyticsData => "ANALYTICS_DATA",
            MessageType::WebcamData => "WEBCAM_DATA",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts reported in a `PONG`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct DataStats {
    pub emotion: usize,
    pub gaze: usize,
    pub analytics: usize,
    pub webcam_data: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub status: String,
    pub version: u8,
    #[serde(default)]
    pub data_stats: DataStats,
}

impl PongPayload {
    pub fn new(data_stats: DataStats) -> Self {
        Self { status: "pong".to_string(), version: VERSION, data_stats }
    }

    pub fn is_valid(&self) -> bool {
        self.status == "pong"
    }
}

/// Explicit error reply, sent instead of leaving a requester hanging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct ErrorPayload {
    pub error: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
}

impl ErrorPayload {
    pub fn unknown_type(msg_type: &str) -> Self {
        Self { error: "unknown message type".to_string(), msg_type: Some(msg_type.to_string()) }
    }

    /// Recognise an error reply inside an arbitrary payload.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        if payload.get("error").is_some() {
            serde_json::from_value(payload.clone()).ok()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct PermissionsRequest {
    pub permissions: PermissionSet,
}

/// Reconciliation payload for `SYNC_LOCAL_DATA`: storage key → value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct SyncLocalData {
    pub data: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    Local,
    Remote,
}

/// Point-in-time pull of everything a newly connected peer needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub permissions: PermissionSet,
    #[serde(default)]
    pub analytics: Vec<Record>,
    #[serde(default)]
    pub webcam_data: Vec<Record>,
    #[serde(default)]
    pub settings: serde_json::Map<String, Value>,
    pub source: SnapshotSource,
}

/// Campus-wide aggregate the relay server broadcasts on a fixed cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct CampusPulse {
    pub active_users: usize,
    /// 0.0 (calm) to 1.0 (stressed)
    pub stress_level: f64,
    pub focus_level: f64,
    pub trending_emotion: String,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_omits_correlation_fields_when_absent() {
        let msg = Message::of(MessageType::GetPermissions, json!({}));
        let v: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "GET_PERMISSIONS");
        assert!(v.get("id").is_none());
        assert!(v.get("replyTo").is_none());
        assert!(v["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn reply_carries_request_id() {
        let req = Message::of(MessageType::Ping, json!({})).with_id("abc");
        let reply = req.reply(json!({"status": "pong"}));
        assert_eq!(reply.msg_type(), "PONG");
        assert_eq!(reply.reply_to(), Some("abc"));
        assert!(!reply.expects_reply());

        let req = Message::of(MessageType::GetPermissions, json!({})).with_id("x1");
        assert_eq!(req.reply(Value::Null).msg_type(), "GET_PERMISSIONS_RESPONSE");
    }

    #[test]
    fn parses_minimal_frame() {
        let msg = Message::from_json(r#"{"type":"CUSTOM"}"#).unwrap();
        assert_eq!(msg.msg_type(), "CUSTOM");
        assert_eq!(msg.payload(), &Value::Null);
        assert_eq!(msg.kind(), None);
    }

    #[test]
    fn rejects_frame_without_type() {
        assert!(Message::from_json(r#"{"payload":{}}"#).is_err());
        assert!(Message::from_json("not json").is_err());
    }

    #[test]
    fn message_type_names_are_unique() {
        for t in MessageType::ALL {
            assert_eq!(MessageType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn error_payload_detection() {
        let p = serde_json::to_value(ErrorPayload::unknown_type("NOPE")).unwrap();
        let back = ErrorPayload::from_payload(&p).unwrap();
        assert_eq!(back.msg_type.as_deref(), Some("NOPE"));
        assert!(ErrorPayload::from_payload(&json!({"status": "pong"})).is_none());
    }
}
