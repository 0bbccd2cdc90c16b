use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use crate::MessageType;

/// Stores kept per process. Each kind has its own capacity and storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Emotion,
    Gaze,
    Analytics,
    Webcam,
}

impl DataKind {
    pub const ALL: [DataKind; 4] =
        [DataKind::Emotion, DataKind::Gaze, DataKind::Analytics, DataKind::Webcam];

    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::Emotion => "emotion",
            DataKind::Gaze => "gaze",
            DataKind::Analytics => "analytics",
            DataKind::Webcam => "webcam",
        }
    }

    /// `<KIND>_DATA` broadcast type.
    pub fn data_message(self) -> MessageType {
        match self {
            DataKind::Emotion => MessageType::EmotionData,
            DataKind::Gaze => MessageType::GazeData,
            DataKind::Analytics => MessageType::AnalyticsData,
            DataKind::Webcam => MessageType::WebcamData,
        }
    }

    /// Key of the persisted array in the storage mirror.
    pub fn storage_key(self) -> &'static str {
        match self {
            DataKind::Emotion => "emotionData",
            DataKind::Gaze => "gazeData",
            DataKind::Analytics => "analytics",
            DataKind::Webcam => "webcamData",
        }
    }

    pub fn default_capacity(self) -> usize {
        match self {
            DataKind::Emotion => 50,
            DataKind::Gaze => 100,
            DataKind::Analytics => 1000,
            DataKind::Webcam => 500,
        }
    }

    /// Store that an inbound message type feeds, if any.
    pub fn for_message(msg_type: MessageType) -> Option<Self> {
        match msg_type {
            MessageType::EmotionData | MessageType::EmotionUpdate => Some(DataKind::Emotion),
            MessageType::GazeData => Some(DataKind::Gaze),
            MessageType::AnalyticsData
            | MessageType::ContentTrigger
            | MessageType::BreakReminder => Some(DataKind::Analytics),
            MessageType::WebcamData => Some(DataKind::Webcam),
            _ => None,
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("record must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("record timestamp is not an integer: {0}")]
    InvalidTimestamp(Value),
}

/// A stored record: a timestamp plus the producer's fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct Record {
    pub timestamp: i64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Validate a JSON value as a record. A missing or null `timestamp`
    /// is filled with `now`.
    pub fn from_value(value: Value, now: i64) -> Result<Self, RecordError> {
        let mut fields = match value {
            Value::Object(map) => map,
            Value::Null => return Err(RecordError::NotAnObject("null")),
            Value::Bool(_) => return Err(RecordError::NotAnObject("bool")),
            Value::Number(_) => return Err(RecordError::NotAnObject("number")),
            Value::String(_) => return Err(RecordError::NotAnObject("string")),
            Value::Array(_) => return Err(RecordError::NotAnObject("array")),
        };
        let timestamp = match fields.remove("timestamp") {
            None | Some(Value::Null) => now,
            Some(Value::Number(n)) => match n.as_i64() {
                Some(ts) => ts,
                None => return Err(RecordError::InvalidTimestamp(Value::Number(n))),
            },
            Some(other) => return Err(RecordError::InvalidTimestamp(other)),
        };
        Ok(Self { timestamp, fields })
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert("timestamp".to_string(), Value::from(self.timestamp));
        Value::Object(map)
    }
}

/// Output of the emotion detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct EmotionSample {
    pub emotion: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Normalised gaze point, `x`/`y` in `0.0..=1.0` of the viewport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct GazeSample {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ContentTrigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub triggers: Vec<String>,
    pub sentiment: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct BreakReminder {
    pub message: String,
    pub continuous_minutes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}
