//! Catalog access.
//!
//! [`CatalogSource`] is whatever knows about tracks beyond the local index: a
//! library database, a metadata service, a search API. Implementations may be
//! slow or flaky, so the engine only talks to them through [`CatalogClient`],
//! which puts a timeout on every call and turns failures into empty results.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineError;
use crate::generator::mood_profile;
use crate::track::Track;

/// What a candidate lookup is anchored on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SeedQuery {
    Mood(String),
    Genre(String),
    Artist(String),
    Track(String),
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Tracks for the given ids. Unknown ids are skipped.
    async fn tracks_by_ids(&self, ids: &[String]) -> Result<Vec<Track>, EngineError>;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Track>, EngineError>;

    async fn candidates_for_seed(
        &self,
        seed: &SeedQuery,
        limit: usize,
    ) -> Result<Vec<Track>, EngineError>;

    async fn trending(&self, limit: usize) -> Result<Vec<Track>, EngineError>;
}

/// Timeout-guarded access to a [`CatalogSource`]; never fails.
#[derive(Clone)]
pub struct CatalogClient {
    source: Arc<dyn CatalogSource>,
    timeout: Duration,
}

impl CatalogClient {
    pub fn new(source: Arc<dyn CatalogSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    async fn guarded<F>(&self, call: &str, fut: F) -> Vec<Track>
    where
        F: Future<Output = Result<Vec<Track>, EngineError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(tracks)) => tracks,
            Ok(Err(e)) => {
                warn!("Catalog {call} failed: {e}");
                Vec::new()
            }
            Err(_) => {
                warn!("Catalog {call} timed out after {:?}", self.timeout);
                Vec::new()
            }
        }
    }

    pub async fn tracks_by_ids(&self, ids: &[String]) -> Vec<Track> {
        if ids.is_empty() {
            return Vec::new();
        }
        self.guarded("lookup", self.source.tracks_by_ids(ids)).await
    }

    pub async fn search(&self, query: &str, limit: usize) -> Vec<Track> {
        self.guarded("search", self.source.search(query, limit))
            .await
    }

    pub async fn candidates_for_seed(&self, seed: &SeedQuery, limit: usize) -> Vec<Track> {
        self.guarded("seed lookup", self.source.candidates_for_seed(seed, limit))
            .await
    }

    pub async fn trending(&self, limit: usize) -> Vec<Track> {
        self.guarded("trending", self.source.trending(limit)).await
    }
}

/// In-memory catalog loaded from a JSON array of tracks.
#[derive(Debug, Clone, Default)]
pub struct JsonCatalog {
    tracks: Vec<Track>,
    by_id: HashMap<String, usize>,
}

impl JsonCatalog {
    pub fn from_tracks(tracks: Vec<Track>) -> Self {
        let mut catalog = Self::default();
        for mut track in tracks {
            track.normalize_genres();
            match catalog.by_id.get(&track.id) {
                Some(&slot) => catalog.tracks[slot] = track,
                None => {
                    catalog.by_id.insert(track.id.clone(), catalog.tracks.len());
                    catalog.tracks.push(track);
                }
            }
        }
        catalog
    }

    /// Load a catalog file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        let tracks: Vec<Track> = serde_json::from_str(&text)
            .with_context(|| format!("Invalid catalog {}", path.display()))?;
        debug!("Loaded {} tracks from {}", tracks.len(), path.display());
        Ok(Self::from_tracks(tracks))
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn get(&self, id: &str) -> Option<&Track> {
        self.by_id.get(id).map(|&slot| &self.tracks[slot])
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    fn by_popularity<'a>(&self, tracks: impl Iterator<Item = &'a Track>) -> Vec<&'a Track> {
        let mut ranked: Vec<&Track> = tracks.collect();
        ranked.sort_by(|a, b| {
            b.popularity
                .unwrap_or(0.0)
                .total_cmp(&a.popularity.unwrap_or(0.0))
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked
    }

    fn related_to(&self, artists: &HashSet<&str>, genres: &HashSet<&str>, skip: &str) -> Vec<Track> {
        let mut related: Vec<(usize, &Track)> = self
            .tracks
            .iter()
            .filter(|t| t.id != skip)
            .map(|t| {
                let shared_artists = t.artist_ids.iter().filter(|a| artists.contains(a.as_str())).count();
                let shared_genres = t.genres.iter().filter(|g| genres.contains(g.as_str())).count();
                (shared_artists * 2 + shared_genres, t)
            })
            .filter(|(overlap, _)| *overlap > 0)
            .collect();
        related.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        related.into_iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl CatalogSource for JsonCatalog {
    async fn tracks_by_ids(&self, ids: &[String]) -> Result<Vec<Track>, EngineError> {
        Ok(ids.iter().filter_map(|id| self.get(id)).cloned().collect())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Track>, EngineError> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let matches = self.tracks.iter().filter(|t| {
            t.title.to_lowercase().contains(&needle)
                || t.artist_names.iter().any(|a| a.to_lowercase().contains(&needle))
                || t.album.as_ref().is_some_and(|a| a.to_lowercase().contains(&needle))
                || t.genres.iter().any(|g| g.contains(&needle))
        });
        Ok(self
            .by_popularity(matches)
            .into_iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn candidates_for_seed(
        &self,
        seed: &SeedQuery,
        limit: usize,
    ) -> Result<Vec<Track>, EngineError> {
        let tracks: Vec<Track> = match seed {
            SeedQuery::Genre(genre) => self
                .by_popularity(self.tracks.iter().filter(|t| t.has_genre(genre)))
                .into_iter()
                .cloned()
                .collect(),
            SeedQuery::Artist(artist) => {
                let own: Vec<&Track> = self.tracks.iter().filter(|t| t.has_artist(artist)).collect();
                let genres: HashSet<&str> = own
                    .iter()
                    .flat_map(|t| t.genres.iter().map(String::as_str))
                    .collect();
                let artists: HashSet<&str> = [artist.as_str()].into_iter().collect();
                self.related_to(&artists, &genres, "")
            }
            SeedQuery::Track(id) => match self.get(id) {
                Some(anchor) => {
                    let artists: HashSet<&str> =
                        anchor.artist_ids.iter().map(String::as_str).collect();
                    let genres: HashSet<&str> = anchor.genres.iter().map(String::as_str).collect();
                    self.related_to(&artists, &genres, id)
                }
                None => Vec::new(),
            },
            SeedQuery::Mood(mood) => match mood_profile(mood) {
                Some(profile) => {
                    let mut fitted: Vec<(f64, &Track)> = self
                        .tracks
                        .iter()
                        .filter_map(|t| {
                            let fit = t.features.as_ref().and_then(|f| profile.fit(f));
                            let genre_match = profile.matches_genre(t);
                            match (fit, genre_match) {
                                (Some(fit), _) if fit > 0.5 => Some((fit, t)),
                                (None, true) => Some((0.5, t)),
                                _ => None,
                            }
                        })
                        .collect();
                    fitted.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
                    fitted.into_iter().map(|(_, t)| t.clone()).collect()
                }
                None => return self.search(mood, limit).await,
            },
        };
        Ok(tracks.into_iter().take(limit).collect())
    }

    async fn trending(&self, limit: usize) -> Result<Vec<Track>, EngineError> {
        Ok(self
            .by_popularity(self.tracks.iter())
            .into_iter()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::AudioFeatures;

    fn catalog() -> JsonCatalog {
        let mut hit = Track::new("hit", "Big Hit")
            .with_artist("a1", "Alpha")
            .with_genre("pop");
        hit.popularity = Some(0.9);
        JsonCatalog::from_tracks(vec![
            hit,
            Track::new("deep", "Deep Cut").with_artist("a1", "Alpha").with_genre("pop"),
            Track::new("jazz", "Blue").with_artist("a2", "Beta").with_genre("jazz"),
            Track::new("calm", "Still Water")
                .with_artist("a3", "Gamma")
                .with_features(AudioFeatures {
                    energy: Some(0.1),
                    valence: Some(0.5),
                    tempo: Some(70.0),
                    ..AudioFeatures::default()
                }),
        ])
    }

    #[tokio::test]
    async fn test_raw_genres_match_searches_and_seeds() {
        let mut track = Track::new("t1", "Neon").with_artist("a1", "Alpha");
        track.genres = vec!["Synth-Pop".to_string()];
        let mut sibling = Track::new("t2", "Glow").with_artist("a9", "Other");
        sibling.genres = vec!["SYNTH_POP".to_string()];
        let catalog = JsonCatalog::from_tracks(vec![track, sibling]);

        assert_eq!(catalog.get("t1").unwrap().genres, vec!["synth pop"]);
        let found = catalog.search("synth pop", 10).await.unwrap();
        assert_eq!(found.len(), 2);

        let related = catalog
            .candidates_for_seed(&SeedQuery::Track("t1".into()), 10)
            .await
            .unwrap();
        assert_eq!(related.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), vec!["t2"]);
    }

    struct Stalled;

    #[async_trait]
    impl CatalogSource for Stalled {
        async fn tracks_by_ids(&self, _: &[String]) -> Result<Vec<Track>, EngineError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }

        async fn search(&self, _: &str, _: usize) -> Result<Vec<Track>, EngineError> {
            Err(EngineError::Catalog("offline".into()))
        }

        async fn candidates_for_seed(&self, _: &SeedQuery, _: usize) -> Result<Vec<Track>, EngineError> {
            Ok(Vec::new())
        }

        async fn trending(&self, _: usize) -> Result<Vec<Track>, EngineError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_lookup_skips_unknown_ids() {
        let tracks = catalog()
            .tracks_by_ids(&["jazz".into(), "nope".into()])
            .await
            .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, "jazz");
    }

    #[tokio::test]
    async fn test_search_and_trending_rank_by_popularity() {
        let catalog = catalog();
        let found = catalog.search("alpha", 10).await.unwrap();
        assert_eq!(found.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), ["hit", "deep"]);
        assert_eq!(catalog.trending(1).await.unwrap()[0].id, "hit");
    }

    #[tokio::test]
    async fn test_seed_candidates() {
        let catalog = catalog();
        let similar = catalog
            .candidates_for_seed(&SeedQuery::Track("hit".into()), 10)
            .await
            .unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].id, "deep");

        let calm = catalog
            .candidates_for_seed(&SeedQuery::Mood("calm".into()), 10)
            .await
            .unwrap();
        assert_eq!(calm[0].id, "calm");

        let jazz = catalog
            .candidates_for_seed(&SeedQuery::Genre("Jazz".into()), 10)
            .await
            .unwrap();
        assert_eq!(jazz.len(), 1);
    }

    #[tokio::test]
    async fn test_client_degrades_to_empty() {
        let client = CatalogClient::new(Arc::new(Stalled), Duration::from_millis(50));
        assert!(client.tracks_by_ids(&["x".into()]).await.is_empty());
        assert!(client.search("x", 5).await.is_empty());
    }
}
