//! Periodic `CAMPUS_PULSE_UPDATE` broadcast.

use crate::AppState;
use protocol::{CampusPulse, Message, MessageType};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

const EMOTIONS: &[&str] = &["focused", "calm", "stressed", "tired", "happy"];

/// Simulated campus aggregate. `active_users` is the live client count.
pub fn sample<R: Rng>(rng: &mut R, active_users: usize) -> CampusPulse {
    CampusPulse {
        active_users,
        stress_level: round2(rng.gen_range(0.2..0.8)),
        focus_level: round2(rng.gen_range(0.3..0.9)),
        trending_emotion: EMOTIONS[rng.gen_range(0..EMOTIONS.len())].to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// First broadcast happens one full period after start.
pub async fn run(state: AppState, every: Duration) {
    let mut rng = StdRng::from_entropy();
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let clients = state.client_count().await;
        if clients == 0 {
            continue;
        }
        let pulse = sample(&mut rng, clients);
        let frame = match serde_json::to_value(&pulse)
            .and_then(|payload| Message::of(MessageType::CampusPulseUpdate, payload).to_json())
        {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode campus pulse: {}", e);
                continue;
            }
        };
        let delivered = state.broadcast(&frame, None).await;
        debug!(delivered, stress = pulse.stress_level, "campus pulse sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::Outgoing;
    use tokio::sync::mpsc;

    #[test]
    fn sample_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let pulse = sample(&mut rng, 3);
            assert_eq!(pulse.active_users, 3);
            assert!((0.2..=0.8).contains(&pulse.stress_level));
            assert!((0.3..=0.9).contains(&pulse.focus_level));
            assert!(EMOTIONS.contains(&pulse.trending_emotion.as_str()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn broadcasts_on_each_period() {
        let state = AppState::new();
        let (tx, mut rx) = mpsc::channel(8);
        state.register("c1".into(), tx).await;

        let task = tokio::spawn(run(state.clone(), Duration::from_secs(30)));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let Outgoing::Text(text) = first else { panic!("expected text") };
        let msg = Message::from_json(&text).unwrap();
        assert_eq!(msg.kind(), Some(MessageType::CampusPulseUpdate));
        let pulse: CampusPulse = serde_json::from_value(msg.payload().clone()).unwrap();
        assert_eq!(pulse.active_users, 1);

        let second = tokio::time::timeout(Duration::from_secs(31), rx.recv()).await.unwrap();
        assert!(second.is_some());
        task.abort();
    }
}
