//! Trained-model service interface.
//!
//! The engine never trains or hosts a model itself. A host can plug one in
//! through [`PredictionModel`]; without it (or whenever it errors) scoring
//! falls back to the rule-based score.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::profile::UserProfile;
use crate::scoring::ScoringContext;
use crate::track::Track;

/// Outcome of one training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub samples: usize,
    pub epochs: u32,
    pub loss: f64,
    pub accuracy: Option<f64>,
}

/// One labelled example: did the listener finish the track?
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub track: Track,
    pub hour: u32,
    /// 1.0 for a completed listen, 0.0 for a skip.
    pub label: f64,
}

#[async_trait]
pub trait PredictionModel: Send + Sync {
    /// Probability in `[0, 1]` that the listener enjoys `track` right now.
    async fn predict(&self, track: &Track, context: &ScoringContext) -> Result<f64, EngineError>;

    async fn predict_batch(
        &self,
        tracks: &[Track],
        context: &ScoringContext,
    ) -> Result<Vec<f64>, EngineError> {
        let mut predictions = Vec::with_capacity(tracks.len());
        for track in tracks {
            predictions.push(self.predict(track, context).await?);
        }
        Ok(predictions)
    }

    async fn train(&self, examples: &[TrainingExample]) -> Result<TrainingMetrics, EngineError>;

    async fn load_parameters(&self, bytes: &[u8]) -> Result<(), EngineError>;

    async fn save_parameters(&self) -> Result<Vec<u8>, EngineError>;
}

/// Build training examples from the profile's listen history.
///
/// Only completed listens and skips carry a label; partial listens are
/// ignored, as are tracks `lookup` cannot resolve.
pub fn training_examples<'a>(
    profile: &UserProfile,
    lookup: impl Fn(&str) -> Option<&'a Track>,
) -> Vec<TrainingExample> {
    use chrono::Timelike;

    profile
        .listen_history
        .iter()
        .filter(|event| event.completed || event.skipped)
        .filter_map(|event| {
            let track = lookup(&event.track_id)?;
            Some(TrainingExample {
                track: track.clone(),
                hour: event.timestamp.hour(),
                label: if event.completed { 1.0 } else { 0.0 },
            })
        })
        .collect()
}
