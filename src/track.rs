//! Track records as the engine sees them.

use serde::{Deserialize, Deserializer, Serialize};

use crate::features::AudioFeatures;

/// A catalog track.
///
/// Tracks come from local libraries as well as search and trending results, so
/// almost everything beyond the id and title is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist_ids: Vec<String>,
    pub artist_names: Vec<String>,
    pub album: Option<String>,
    #[serde(deserialize_with = "deserialize_genres")]
    pub genres: Vec<String>,
    pub duration_ms: Option<u64>,
    /// Precomputed embedding, if the source already has one.
    pub embedding: Option<Vec<f32>>,
    /// Audio descriptors shipped with the catalog record.
    pub features: Option<AudioFeatures>,
    /// Source popularity in `[0, 100]`.
    pub popularity: Option<f64>,
}

impl Track {
    /// Minimal track used in tests and by callers that only know ids.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_artist(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.artist_ids.push(id.into());
        self.artist_names.push(name.into());
        self
    }

    #[must_use]
    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genres.push(normalize_genre(&genre.into()));
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    #[must_use]
    pub fn with_features(mut self, features: AudioFeatures) -> Self {
        self.features = Some(features);
        self
    }

    /// First credited artist, used for diversity accounting.
    pub fn primary_artist(&self) -> Option<&str> {
        self.artist_ids.first().map(String::as_str)
    }

    pub fn has_artist(&self, artist_id: &str) -> bool {
        self.artist_ids.iter().any(|a| a == artist_id)
    }

    pub fn has_genre(&self, genre: &str) -> bool {
        let genre = normalize_genre(genre);
        self.genres.iter().any(|g| normalize_genre(g) == genre)
    }

    /// Bring genres set directly on the struct into normalized form.
    pub fn normalize_genres(&mut self) {
        for genre in &mut self.genres {
            *genre = normalize_genre(genre);
        }
    }

    /// Human readable "Artist - Title".
    pub fn display_name(&self) -> String {
        match self.artist_names.first() {
            Some(artist) => format!("{artist} - {}", self.title),
            None => self.title.clone(),
        }
    }
}

/// Genre names arrive in every casing and spacing imaginable.
pub fn normalize_genre(genre: &str) -> String {
    genre.trim().to_lowercase().replace(['_', '-'], " ")
}

fn deserialize_genres<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    Ok(raw.iter().map(|genre| normalize_genre(genre)).collect())
}
