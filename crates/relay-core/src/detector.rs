//! Record sources. The simulated detectors stand in for camera and page
//! analysis and are seedable for reproducible runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use protocol::{ContentTrigger, DataKind, EmotionSample, GazeSample};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::error::RelayResult;

#[async_trait]
pub trait Detector: Send + Sync {
    type Input: Send + 'static;
    type Output: Serialize + Send + Sync;

    /// Store the output is published to.
    fn kind(&self) -> DataKind;

    async fn detect(&self, input: Self::Input) -> RelayResult<Self::Output>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageText {
    pub url: Option<String>,
    pub text: String,
}

const EMOTIONS: [&str; 6] = ["happy", "neutral", "focused", "stressed", "tired", "sad"];

/// Words that flag content worth a wellness check.
const TRIGGER_WORDS: [&str; 10] = [
    "stress", "anxiety", "deadline", "exam", "lonely", "tired", "overwhelmed", "panic", "burnout",
    "failure",
];

fn rng_from(seed: Option<u64>) -> Mutex<StdRng> {
    Mutex::new(match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    })
}

pub struct SimulatedEmotionDetector {
    rng: Mutex<StdRng>,
    kind: DataKind,
}

impl SimulatedEmotionDetector {
    pub fn new(seed: Option<u64>) -> Self {
        Self { rng: rng_from(seed), kind: DataKind::Emotion }
    }

    /// Same samples, published as webcam frames.
    pub fn webcam(seed: Option<u64>) -> Self {
        Self { rng: rng_from(seed), kind: DataKind::Webcam }
    }
}

#[async_trait]
impl Detector for SimulatedEmotionDetector {
    type Input = ();
    type Output = EmotionSample;

    fn kind(&self) -> DataKind {
        self.kind
    }

    async fn detect(&self, _: ()) -> RelayResult<EmotionSample> {
        let mut rng = self.rng.lock();
        let emotion = EMOTIONS.choose(&mut *rng).copied().unwrap_or("neutral");
        Ok(EmotionSample {
            emotion: emotion.to_string(),
            confidence: rng.gen_range(0.5..1.0),
            timestamp: None,
        })
    }
}

pub struct SimulatedGazeTracker {
    rng: Mutex<StdRng>,
}

impl SimulatedGazeTracker {
    pub fn new(seed: Option<u64>) -> Self {
        Self { rng: rng_from(seed) }
    }
}

#[async_trait]
impl Detector for SimulatedGazeTracker {
    type Input = ();
    type Output = GazeSample;

    fn kind(&self) -> DataKind {
        DataKind::Gaze
    }

    async fn detect(&self, _: ()) -> RelayResult<GazeSample> {
        let mut rng = self.rng.lock();
        Ok(GazeSample { x: rng.gen_range(0.0..=1.0), y: rng.gen_range(0.0..=1.0), timestamp: None })
    }
}

/// Keyword scan plus a noisy sentiment score that drops with each hit.
pub struct SimulatedContentDetector {
    rng: Mutex<StdRng>,
}

impl SimulatedContentDetector {
    pub fn new(seed: Option<u64>) -> Self {
        Self { rng: rng_from(seed) }
    }
}

#[async_trait]
impl Detector for SimulatedContentDetector {
    type Input = PageText;
    type Output = ContentTrigger;

    fn kind(&self) -> DataKind {
        DataKind::Analytics
    }

    async fn detect(&self, page: PageText) -> RelayResult<ContentTrigger> {
        let lowered = page.text.to_lowercase();
        let mut triggers: Vec<String> = Vec::new();
        for word in lowered.split(|c: char| !c.is_alphanumeric()) {
            if TRIGGER_WORDS.contains(&word) && !triggers.iter().any(|t| t == word) {
                triggers.push(word.to_string());
            }
        }
        let noise: f64 = self.rng.lock().gen_range(-0.2..0.2);
        let sentiment = (noise - 0.15 * triggers.len() as f64).clamp(-1.0, 1.0);
        Ok(ContentTrigger { url: page.url, triggers, sentiment, timestamp: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_detectors_repeat() {
        let a = SimulatedEmotionDetector::new(Some(7));
        let b = SimulatedEmotionDetector::new(Some(7));
        for _ in 0..5 {
            assert_eq!(a.detect(()).await.unwrap(), b.detect(()).await.unwrap());
        }
    }

    #[tokio::test]
    async fn gaze_stays_in_viewport() {
        let tracker = SimulatedGazeTracker::new(Some(1));
        for _ in 0..50 {
            let g = tracker.detect(()).await.unwrap();
            assert!((0.0..=1.0).contains(&g.x) && (0.0..=1.0).contains(&g.y));
        }
    }

    #[tokio::test]
    async fn content_detector_finds_each_word_once() {
        let detector = SimulatedContentDetector::new(Some(3));
        let page = PageText {
            url: Some("https://example.edu/news".into()),
            text: "Exam stress, exam STRESS and a deadline.".into(),
        };
        let trigger = detector.detect(page).await.unwrap();
        assert_eq!(trigger.triggers, vec!["exam", "stress", "deadline"]);
        assert!(trigger.sentiment < 0.0);
        assert_eq!(trigger.url.as_deref(), Some("https://example.edu/news"));
    }
}
