//! # Track Features
//!
//! Normalized per-track descriptors and the aggregator that collects them from
//! independently registered analysis providers.
//!
//! - [`AudioFeatures`] - tempo, key, energy and friends; every field optional
//! - [`EmotionFeatures`] / [`LyricsFeatures`] - higher level descriptors
//! - [`AggregatedFeatures`] - the merged bundle plus which provider supplied what
//! - [`FeatureAggregator`] - TTL cache, in-flight dedupe, per-provider timeouts

mod aggregator;
mod provider;

pub use aggregator::{AggregatorConfig, FeatureAggregator, MergeStrategy};
pub use provider::{Capabilities, FeatureProvider};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Major or minor tonality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Major,
    Minor,
}

/// Numeric audio descriptors. Any field may be absent.
///
/// Ranges follow the usual analysis conventions: `key` is a pitch class
/// (0 = C .. 11 = B), `tempo` is in BPM, `loudness` in dB, and the remaining
/// perceptual values are within `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFeatures {
    pub tempo: Option<f64>,
    pub key: Option<u8>,
    pub mode: Option<Mode>,
    pub energy: Option<f64>,
    pub loudness: Option<f64>,
    pub valence: Option<f64>,
    pub arousal: Option<f64>,
    pub danceability: Option<f64>,
    pub acousticness: Option<f64>,
    pub instrumentalness: Option<f64>,
    pub speechiness: Option<f64>,
    pub spectral_centroid: Option<f64>,
    pub spectral_rolloff: Option<f64>,
    pub zero_crossing_rate: Option<f64>,
    pub confidence: Option<f64>,
}

macro_rules! fill_gaps {
    ($target:expr, $source:expr, $filled:ident, [$($field:ident),* $(,)?]) => {
        $(
            if $target.$field.is_none() && $source.$field.is_some() {
                $target.$field = $source.$field;
                $filled += 1;
            }
        )*
    };
}

impl AudioFeatures {
    /// Copy every field that is absent here but present in `other`.
    ///
    /// Present values are never overwritten. Returns the number of fields
    /// that were filled.
    pub fn fill_gaps(&mut self, other: &AudioFeatures) -> usize {
        let mut filled = 0;
        fill_gaps!(
            self,
            other,
            filled,
            [
                tempo,
                key,
                mode,
                energy,
                loudness,
                valence,
                arousal,
                danceability,
                acousticness,
                instrumentalness,
                speechiness,
                spectral_centroid,
                spectral_rolloff,
                zero_crossing_rate,
                confidence,
            ]
        );
        filled
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Emotion model output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmotionFeatures {
    pub valence: Option<f64>,
    pub arousal: Option<f64>,
    pub dominant_mood: Option<String>,
    pub confidence: Option<f64>,
}

/// Lyrics analysis output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LyricsFeatures {
    pub language: Option<String>,
    pub themes: Vec<String>,
    /// Sentiment in `[-1, 1]`.
    pub sentiment: Option<f64>,
    pub explicit: Option<bool>,
}

/// Fields of an [`AggregatedFeatures`] bundle a provider can supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureField {
    Audio,
    Fingerprint,
    Emotion,
    Lyrics,
    Embedding,
}

/// Which provider supplied which fields, for explainability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderContribution {
    pub provider_id: String,
    pub supplied_fields: Vec<FeatureField>,
    pub confidence: f64,
}

/// One normalized feature bundle per track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedFeatures {
    pub track_id: String,
    pub audio: Option<AudioFeatures>,
    pub emotion: Option<EmotionFeatures>,
    pub lyrics: Option<LyricsFeatures>,
    pub embedding: Option<Vec<f32>>,
    pub fingerprint: Option<String>,
    pub contributing_providers: Vec<ProviderContribution>,
    pub last_updated: DateTime<Utc>,
}

impl AggregatedFeatures {
    /// Bundle with every optional field absent.
    pub fn empty(track_id: impl Into<String>) -> Self {
        Self {
            track_id: track_id.into(),
            audio: None,
            emotion: None,
            lyrics: None,
            embedding: None,
            fingerprint: None,
            contributing_providers: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn has_data(&self) -> bool {
        self.audio.is_some()
            || self.emotion.is_some()
            || self.lyrics.is_some()
            || self.embedding.is_some()
            || self.fingerprint.is_some()
    }

    /// Audio features with emotion valence/arousal filled in where the audio
    /// analysis had none.
    pub fn effective_audio(&self) -> Option<AudioFeatures> {
        let mut audio = self.audio.clone().unwrap_or_default();
        if let Some(emotion) = &self.emotion {
            audio.fill_gaps(&AudioFeatures {
                valence: emotion.valence,
                arousal: emotion.arousal,
                ..AudioFeatures::default()
            });
        }
        (!audio.is_empty()).then_some(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_gaps_never_overwrites() {
        let mut base = AudioFeatures {
            tempo: Some(120.0),
            ..AudioFeatures::default()
        };
        let other = AudioFeatures {
            tempo: Some(90.0),
            energy: Some(0.8),
            key: Some(7),
            ..AudioFeatures::default()
        };

        assert_eq!(base.fill_gaps(&other), 2);
        assert_eq!(base.tempo, Some(120.0));
        assert_eq!(base.energy, Some(0.8));
        assert_eq!(base.key, Some(7));
    }

    #[test]
    fn test_effective_audio_borrows_emotion() {
        let mut bundle = AggregatedFeatures::empty("t1");
        assert_eq!(bundle.effective_audio(), None);

        bundle.emotion = Some(EmotionFeatures {
            valence: Some(0.2),
            arousal: Some(0.9),
            ..EmotionFeatures::default()
        });
        let audio = bundle.effective_audio().unwrap();
        assert_eq!(audio.valence, Some(0.2));
        assert_eq!(audio.arousal, Some(0.9));
    }
}
