//! # Scoring Engine
//!
//! Ranks candidate tracks for a listener. Scoring happens in three layers:
//!
//! 1. **Rule-based affinity** ([`ScoringEngine::rule_score`]) - neutral midpoint
//!    plus weighted artist/genre preferences, time-of-day and duration fit,
//!    minus a tiered recency penalty. Fully deterministic.
//! 2. **Hybrid blend** ([`ScoringEngine::blend_model`]) - mixes in a trained
//!    model's prediction with a weight that grows with each training cycle.
//! 3. **Batch adjustments** ([`ScoringEngine::adjust_batch`]) - exploration,
//!    serendipity, flow and a same-artist diversity penalty.
//!
//! Radio sessions additionally weigh each track's relevance to the seed, see
//! [`seed`].
//!
//! Every score carries a [`ScoreBreakdown`] listing the factors that produced
//! it, so recommendations can be explained.
//!
//! The engine owns no state: it reads the profile and the scoring context and
//! returns numbers.

mod adjust;
pub mod harmony;
mod rules;
pub mod seed;

pub use seed::{RadioSeed, SeedKind};

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::features::AudioFeatures;
use crate::profile::{UserProfile, SCORE_MAX, SCORE_MIN};
use crate::track::Track;

/// Every disliked track scores at or below this, strictly under the lowest
/// score a non-disliked track can reach.
pub const DISLIKED_CEILING: f64 = SCORE_MIN - 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub neutral_score: f64,
    pub artist_weight: f64,
    pub genre_weight: f64,
    pub time_of_day_bonus: f64,
    pub duration_bonus: f64,
    pub recency_penalty_hour: f64,
    pub recency_penalty_day: f64,
    pub recency_penalty_three_days: f64,
    pub freshness_bonus: f64,
    /// Magnitude of the penalty for a disliked track before reason multipliers.
    pub dislike_penalty: f64,
    pub dislike_half_life_days: f64,
    pub initial_model_weight: f64,
    pub model_weight_increment: f64,
    pub max_model_weight: f64,
    pub exploration_bonus: f64,
    pub serendipity_boost: f64,
    pub serendipity_min_similarity: f32,
    pub serendipity_max_similarity: f32,
    pub diversity_penalty: f64,
    pub max_per_artist: usize,
    /// Weight of the flow term; a perfect transition adds `flow_weight * 50`.
    pub flow_weight: f64,
    /// Upper bound on the multiplicative boost audio compatibility gives seed
    /// relevance.
    pub seed_audio_boost: f64,
    pub seed_weight_initial: f64,
    pub seed_weight_decay: f64,
    pub seed_weight_min: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            neutral_score: 50.0,
            artist_weight: 0.3,
            genre_weight: 0.2,
            time_of_day_bonus: 10.0,
            duration_bonus: 5.0,
            recency_penalty_hour: 30.0,
            recency_penalty_day: 15.0,
            recency_penalty_three_days: 5.0,
            freshness_bonus: 5.0,
            dislike_penalty: 200.0,
            dislike_half_life_days: 30.0,
            initial_model_weight: 0.1,
            model_weight_increment: 0.05,
            max_model_weight: 0.7,
            exploration_bonus: 15.0,
            serendipity_boost: 8.0,
            serendipity_min_similarity: 0.5,
            serendipity_max_similarity: 0.8,
            diversity_penalty: 20.0,
            max_per_artist: 3,
            flow_weight: 0.25,
            seed_audio_boost: 0.3,
            seed_weight_initial: 0.7,
            seed_weight_decay: 0.02,
            seed_weight_min: 0.3,
        }
    }
}

/// Ephemeral inputs for one scoring pass. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringContext {
    pub now: DateTime<Utc>,
    pub hour: u32,
    /// 0 = Monday.
    pub day_of_week: u32,
    pub session_track_ids: Vec<String>,
    pub session_genres: Vec<String>,
    pub session_artists: Vec<String>,
    pub session_energy: Option<f64>,
    /// Audio features of the most recently played tracks, newest last.
    pub recent_features: Vec<AudioFeatures>,
    /// `0.0` = pure exploitation, `1.0` = pure exploration.
    pub exploration: f64,
    pub mood_hint: Option<String>,
}

impl ScoringContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            hour: now.hour(),
            day_of_week: now.weekday().num_days_from_monday(),
            session_track_ids: Vec::new(),
            session_genres: Vec::new(),
            session_artists: Vec::new(),
            session_energy: None,
            recent_features: Vec::new(),
            exploration: 0.2,
            mood_hint: None,
        }
    }

    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    #[must_use]
    pub fn with_exploration(mut self, exploration: f64) -> Self {
        self.exploration = exploration.clamp(0.0, 1.0);
        self
    }

    /// Record a session track so later candidates are judged against it.
    pub fn push_session_track(&mut self, track: &Track, features: Option<&AudioFeatures>) {
        self.session_track_ids.push(track.id.clone());
        self.session_artists.extend(track.artist_ids.iter().cloned());
        self.session_genres.extend(track.genres.iter().cloned());
        if let Some(features) = features {
            if let Some(energy) = features.energy {
                self.session_energy = Some(match self.session_energy {
                    Some(current) => current * 0.7 + energy * 0.3,
                    None => energy,
                });
            }
            self.recent_features.push(features.clone());
        }
    }
}

/// One named contribution to a score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreFactor {
    pub name: &'static str,
    pub value: f64,
}

/// A score and the factors that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub track_id: String,
    pub value: f64,
    pub disliked: bool,
    /// Raw model output in `[0, 1]`, when a model took part.
    pub model_prediction: Option<f64>,
    pub factors: Vec<ScoreFactor>,
}

impl ScoreBreakdown {
    fn new(track_id: &str, base: f64) -> Self {
        Self {
            track_id: track_id.to_string(),
            value: base,
            disliked: false,
            model_prediction: None,
            factors: vec![ScoreFactor {
                name: "base",
                value: base,
            }],
        }
    }

    /// Add a non-zero contribution.
    pub fn add(&mut self, name: &'static str, value: f64) {
        if value != 0.0 && value.is_finite() {
            self.value += value;
            self.factors.push(ScoreFactor { name, value });
        }
    }

    pub fn factor(&self, name: &str) -> Option<f64> {
        self.factors.iter().find(|f| f.name == name).map(|f| f.value)
    }

    fn clamp_non_disliked(&mut self) {
        if !self.disliked {
            self.value = self.value.clamp(SCORE_MIN, SCORE_MAX);
        }
    }
}

/// A candidate with everything the batch adjustments look at.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredTrack {
    pub track: Track,
    pub features: Option<AudioFeatures>,
    /// Similarity to whatever anchored the candidate query, if any.
    pub similarity: Option<f32>,
    pub breakdown: ScoreBreakdown,
}

impl ScoredTrack {
    pub fn score(&self) -> f64 {
        self.breakdown.value
    }
}

/// Sort best first; ties fall back to track id so ordering is reproducible.
pub fn sort_by_score(batch: &mut [ScoredTrack]) {
    batch.sort_by(|a, b| {
        b.score()
            .total_cmp(&a.score())
            .then_with(|| a.track.id.cmp(&b.track.id))
    });
}

/// Stateless scorer parameterized by [`ScoringConfig`].
#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    config: ScoringConfig,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Rule-based score; deterministic for identical inputs.
    pub fn rule_score(
        &self,
        track: &Track,
        profile: &UserProfile,
        context: &ScoringContext,
    ) -> ScoreBreakdown {
        rules::rule_score(&self.config, track, profile, context)
    }

    /// Model trust after `training_cycles` completed training runs.
    pub fn model_weight(&self, training_cycles: u32) -> f64 {
        let weight = self.config.initial_model_weight
            + self.config.model_weight_increment * f64::from(training_cycles);
        weight.min(self.config.max_model_weight).max(0.0)
    }

    /// Blend a model prediction in `[0, 1]` into a rule-based breakdown.
    ///
    /// Disliked tracks keep their penalty untouched.
    pub fn blend_model(
        &self,
        mut breakdown: ScoreBreakdown,
        prediction: Option<f64>,
        training_cycles: u32,
    ) -> ScoreBreakdown {
        let Some(prediction) = prediction.filter(|p| p.is_finite()) else {
            return breakdown;
        };
        let prediction = prediction.clamp(0.0, 1.0);
        breakdown.model_prediction = Some(prediction);
        if breakdown.disliked {
            return breakdown;
        }

        let weight = self.model_weight(training_cycles);
        let model_score = prediction * (SCORE_MAX - SCORE_MIN) + SCORE_MIN;
        let blended = (1.0 - weight) * breakdown.value + weight * model_score;
        breakdown.add("model", blended - breakdown.value);
        breakdown.clamp_non_disliked();
        breakdown
    }

    /// Second pass over a candidate batch; re-sorts it best first.
    pub fn adjust_batch(
        &self,
        batch: &mut [ScoredTrack],
        profile: &UserProfile,
        context: &ScoringContext,
    ) {
        adjust::adjust_batch(&self.config, batch, profile, context);
    }

    /// Radio seed weight after `played` radio tracks.
    pub fn seed_weight(&self, played: u32) -> f64 {
        seed::effective_seed_weight(&self.config, played)
    }

    /// Combine a base score with seed relevance for a radio session.
    pub fn apply_seed(
        &self,
        breakdown: &mut ScoreBreakdown,
        seed: &RadioSeed,
        track: &Track,
        features: Option<&AudioFeatures>,
        played: u32,
    ) {
        if breakdown.disliked {
            return;
        }
        let relevance = seed::seed_relevance(&self.config, seed, track, features);
        let weight = self.seed_weight(played);
        let combined = (1.0 - weight) * breakdown.value + weight * relevance * SCORE_MAX;
        breakdown.add("seed", combined - breakdown.value);
    }
}
