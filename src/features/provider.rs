//! Feature provider trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AudioFeatures, EmotionFeatures, LyricsFeatures};
use crate::error::EngineError;

/// Capability set a provider declares once, at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub audio: bool,
    pub emotion: bool,
    pub lyrics: bool,
    pub embedding: bool,
}

impl Capabilities {
    pub const AUDIO: Self = Self {
        audio: true,
        emotion: false,
        lyrics: false,
        embedding: false,
    };
    pub const EMOTION: Self = Self {
        audio: false,
        emotion: true,
        lyrics: false,
        embedding: false,
    };
    pub const LYRICS: Self = Self {
        audio: false,
        emotion: false,
        lyrics: true,
        embedding: false,
    };
    pub const EMBEDDING: Self = Self {
        audio: false,
        emotion: false,
        lyrics: false,
        embedding: true,
    };

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            audio: self.audio || other.audio,
            emotion: self.emotion || other.emotion,
            lyrics: self.lyrics || other.lyrics,
            embedding: self.embedding || other.embedding,
        }
    }

    pub const fn is_empty(&self) -> bool {
        !(self.audio || self.emotion || self.lyrics || self.embedding)
    }
}

/// An analysis backend (local DSP, emotion model, lyrics service, embedding
/// model, ...).
///
/// Only the getters matching [`FeatureProvider::capabilities`] are ever
/// called. `Ok(None)` means "no data for this track"; errors are logged and
/// treated the same way.
#[async_trait]
pub trait FeatureProvider: Send + Sync {
    /// Stable identifier, used for explainability and unregistering.
    fn id(&self) -> &str;

    /// Lower values win when fields conflict.
    fn priority(&self) -> u32 {
        100
    }

    fn capabilities(&self) -> Capabilities;

    async fn audio_features(&self, _track_id: &str) -> Result<Option<AudioFeatures>, EngineError> {
        Ok(None)
    }

    /// Acoustic fingerprint, fetched alongside audio features.
    async fn fingerprint(&self, _track_id: &str) -> Result<Option<String>, EngineError> {
        Ok(None)
    }

    async fn emotion_features(
        &self,
        _track_id: &str,
    ) -> Result<Option<EmotionFeatures>, EngineError> {
        Ok(None)
    }

    async fn lyrics_features(
        &self,
        _track_id: &str,
    ) -> Result<Option<LyricsFeatures>, EngineError> {
        Ok(None)
    }

    async fn embedding(&self, _track_id: &str) -> Result<Option<Vec<f32>>, EngineError> {
        Ok(None)
    }
}
