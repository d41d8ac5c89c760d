//! Radio seed relevance.
//!
//! A radio session is anchored on a track, an artist or a genre. Candidates
//! are judged on metadata overlap with the seed, boosted (never replaced) by
//! audio compatibility when the seed has features.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::features::AudioFeatures;
use crate::track::{normalize_genre, Track};

use super::{harmony, ScoringConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedKind {
    Track,
    Artist,
    Genre,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioSeed {
    pub kind: SeedKind,
    /// Track id, artist id or genre name depending on `kind`.
    pub id: String,
    pub name: String,
    pub artist_ids: Vec<String>,
    pub genres: Vec<String>,
    pub features: Option<AudioFeatures>,
}

impl RadioSeed {
    pub fn from_track(track: &Track, features: Option<AudioFeatures>) -> Self {
        Self {
            kind: SeedKind::Track,
            id: track.id.clone(),
            name: track.display_name(),
            artist_ids: track.artist_ids.clone(),
            genres: track.genres.clone(),
            features,
        }
    }

    pub fn artist(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            kind: SeedKind::Artist,
            name: name.into(),
            artist_ids: vec![id.clone()],
            id,
            genres: Vec::new(),
            features: None,
        }
    }

    pub fn genre(genre: &str) -> Self {
        let genre = normalize_genre(genre);
        Self {
            kind: SeedKind::Genre,
            id: genre.clone(),
            name: genre.clone(),
            artist_ids: Vec::new(),
            genres: vec![genre],
            features: None,
        }
    }

    #[must_use]
    pub fn with_genres(mut self, genres: impl IntoIterator<Item = String>) -> Self {
        self.genres
            .extend(genres.into_iter().map(|g| normalize_genre(&g)));
        self.genres.dedup();
        self
    }

    #[must_use]
    pub fn with_features(mut self, features: AudioFeatures) -> Self {
        self.features = Some(features);
        self
    }
}

fn genre_overlap(seed: &RadioSeed, track: &Track) -> f64 {
    if seed.genres.is_empty() || track.genres.is_empty() {
        return 0.0;
    }
    let wanted: HashSet<String> = seed.genres.iter().map(|g| normalize_genre(g)).collect();
    let shared = track
        .genres
        .iter()
        .filter(|g| wanted.contains(&normalize_genre(g)))
        .count();
    shared as f64 / wanted.len() as f64
}

/// Metadata relevance in `[0, 1]`.
pub fn metadata_relevance(seed: &RadioSeed, track: &Track) -> f64 {
    let shares_artist = seed.artist_ids.iter().any(|a| track.has_artist(a));
    let overlap = genre_overlap(seed, track).min(1.0);
    match seed.kind {
        SeedKind::Track => {
            let artist = if shares_artist { 0.6 } else { 0.0 };
            artist + 0.4 * overlap
        }
        SeedKind::Artist if shares_artist => 1.0,
        SeedKind::Artist => 0.5 * overlap,
        SeedKind::Genre if track.has_genre(&seed.id) => 1.0,
        SeedKind::Genre => 0.5 * overlap,
    }
}

/// Relevance of `track` to the seed. Audio compatibility scales the metadata
/// match up by at most `seed_audio_boost`, and gives a small amount of
/// relevance on its own.
pub fn seed_relevance(
    config: &ScoringConfig,
    seed: &RadioSeed,
    track: &Track,
    features: Option<&AudioFeatures>,
) -> f64 {
    let metadata = metadata_relevance(seed, track);
    let audio = match (&seed.features, features) {
        (Some(seed_features), Some(features)) => {
            harmony::compatibility(seed_features, features).unwrap_or(0.0)
        }
        _ => 0.0,
    };
    metadata + config.seed_audio_boost * audio * (0.5 + 0.5 * metadata)
}

/// Seed influence after `played` radio tracks, linearly drifting to the floor.
pub fn effective_seed_weight(config: &ScoringConfig, played: u32) -> f64 {
    let decayed = config.seed_weight_initial - config.seed_weight_decay * f64::from(played);
    decayed.max(config.seed_weight_min)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(tempo: f64, energy: f64) -> AudioFeatures {
        AudioFeatures {
            tempo: Some(tempo),
            energy: Some(energy),
            key: Some(4),
            ..AudioFeatures::default()
        }
    }

    #[test]
    fn test_artist_seed_matches_artist() {
        let seed = RadioSeed::artist("a1", "Artist").with_genres(["rock".to_string()]);
        let own = Track::new("t1", "x").with_artist("a1", "Artist");
        let same_genre = Track::new("t2", "x").with_artist("a2", "B").with_genre("rock");
        let unrelated = Track::new("t3", "x").with_artist("a3", "C").with_genre("jazz");

        assert_eq!(metadata_relevance(&seed, &own), 1.0);
        assert_eq!(metadata_relevance(&seed, &same_genre), 0.5);
        assert_eq!(metadata_relevance(&seed, &unrelated), 0.0);
    }

    #[test]
    fn test_audio_boosts_matching_artist() {
        let config = ScoringConfig::default();
        let seed = RadioSeed::artist("a1", "Artist").with_features(features(120.0, 0.7));
        let track = Track::new("t", "x").with_artist("a1", "Artist");

        let artist_only = seed_relevance(&config, &seed, &track, None);
        let with_audio = seed_relevance(&config, &seed, &track, Some(&features(121.0, 0.72)));
        assert_eq!(artist_only, 1.0);
        assert!(with_audio > artist_only);
        assert!((with_audio - 1.3).abs() < 1e-9);
    }

    #[test]
    fn test_genre_seed() {
        let seed = RadioSeed::genre("Hip-Hop");
        let track = Track::new("t", "x").with_genre("hip hop");
        assert_eq!(metadata_relevance(&seed, &track), 1.0);
    }

    #[test]
    fn test_track_seed_blends_artist_and_genre() {
        let seed_track = Track::new("s", "Seed")
            .with_artist("a1", "A")
            .with_genre("pop")
            .with_genre("dance");
        let seed = RadioSeed::from_track(&seed_track, None);
        let sibling = Track::new("t", "x").with_artist("a1", "A").with_genre("pop");
        assert!((metadata_relevance(&seed, &sibling) - 0.8).abs() < 1e-9);
    }
}
