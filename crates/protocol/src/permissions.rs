use serde::{Deserialize, Serialize};

use crate::DataKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "lowercase")]
pub enum CollectionMethod {
    /// Page content only.
    #[default]
    Content,
    /// Page content plus webcam.
    Both,
}

/// User consent state. `data_collection` is the master switch: no other
/// flag takes effect while it is off, and nothing is collected while
/// `paused` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct PermissionSet {
    pub content_analysis: bool,
    pub eye_tracking: bool,
    pub emotion_detection: bool,
    pub data_collection: bool,
    pub permissions_asked: bool,
    pub paused: bool,
    pub collection_method: CollectionMethod,
}

impl PermissionSet {
    /// Everything granted for the given collection method.
    pub fn granted(method: CollectionMethod) -> Self {
        let webcam = method == CollectionMethod::Both;
        Self {
            content_analysis: true,
            eye_tracking: webcam,
            emotion_detection: webcam,
            data_collection: true,
            permissions_asked: true,
            paused: false,
            collection_method: method,
        }
    }

    /// The user was asked and declined.
    pub fn denied() -> Self {
        Self { permissions_asked: true, ..Self::default() }
    }

    pub fn collection_active(&self) -> bool {
        self.data_collection && !self.paused
    }

    /// Whether a producer may publish records of `kind` right now.
    pub fn allows(&self, kind: DataKind) -> bool {
        if !self.collection_active() {
            return false;
        }
        match kind {
            DataKind::Emotion => self.emotion_detection,
            DataKind::Gaze => self.eye_tracking,
            DataKind::Analytics => self.content_analysis,
            DataKind::Webcam => {
                self.collection_method == CollectionMethod::Both
                    && (self.emotion_detection || self.eye_tracking)
            }
        }
    }

    /// Flip `paused`, returning the new value.
    pub fn toggle_pause(&mut self) -> bool {
        self.paused = !self.paused;
        self.paused
    }
}
