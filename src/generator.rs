//! # Playlist Generation
//!
//! Turns a [`GenerationMethod`] into a ranked, artist-diverse track list.
//!
//! ## Pipeline
//!
//! 1. **Candidates** - nearest neighbors of an anchor vector when the
//!    similarity index is ready, topped up (or replaced) by catalog lookups.
//! 2. **Filtering** - excluded, disliked and method-specific exclusions
//!    (discovery skips recently played and liked tracks).
//! 3. **Scoring** - rule-based score, blended with the prediction model when
//!    one is available, then the batch adjustments.
//! 4. **Selection** - optional seeded jitter, then a hard per-artist cap while
//!    truncating to the requested size.
//!
//! Each method runs with its own exploration level:
//!
//! | Method | Exploration |
//! |---|---|
//! | personalized | 0.1 |
//! | mood | 0.3 |
//! | genre | 0.3 |
//! | artist radio | 0.2 |
//! | discovery | 0.8 |
//! | similar | 0.2 |

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::catalog::{CatalogClient, SeedQuery};
use crate::error::EngineError;
use crate::features::{AudioFeatures, FeatureAggregator};
use crate::index::distance::{cosine_similarity, fit_dimension};
use crate::index::SimilarityIndex;
use crate::model::PredictionModel;
use crate::profile::UserProfile;
use crate::scoring::{sort_by_score, RadioSeed, ScoredTrack, ScoringContext, ScoringEngine};
use crate::track::Track;

/// Target ranges that characterize a mood.
#[derive(Debug, Clone, PartialEq)]
pub struct MoodProfile {
    pub energy: (f64, f64),
    pub valence: (f64, f64),
    pub tempo: (f64, f64),
    pub genres: &'static [&'static str],
}

lazy_static! {
    static ref MOODS: HashMap<&'static str, MoodProfile> = {
        let table = [
            ("happy", MoodProfile {
                energy: (0.5, 0.9),
                valence: (0.7, 1.0),
                tempo: (100.0, 140.0),
                genres: &["pop", "dance", "funk"],
            }),
            ("sad", MoodProfile {
                energy: (0.0, 0.4),
                valence: (0.0, 0.3),
                tempo: (60.0, 100.0),
                genres: &["blues", "acoustic", "singer songwriter"],
            }),
            ("energetic", MoodProfile {
                energy: (0.75, 1.0),
                valence: (0.4, 1.0),
                tempo: (120.0, 180.0),
                genres: &["edm", "rock", "drum and bass"],
            }),
            ("calm", MoodProfile {
                energy: (0.0, 0.35),
                valence: (0.3, 0.7),
                tempo: (50.0, 95.0),
                genres: &["ambient", "classical", "new age"],
            }),
            ("focus", MoodProfile {
                energy: (0.2, 0.5),
                valence: (0.3, 0.6),
                tempo: (70.0, 120.0),
                genres: &["lo fi", "ambient", "post rock"],
            }),
            ("party", MoodProfile {
                energy: (0.7, 1.0),
                valence: (0.6, 1.0),
                tempo: (115.0, 135.0),
                genres: &["dance", "house", "hip hop", "pop"],
            }),
            ("romantic", MoodProfile {
                energy: (0.2, 0.55),
                valence: (0.5, 0.85),
                tempo: (60.0, 110.0),
                genres: &["r&b", "soul", "jazz"],
            }),
            ("angry", MoodProfile {
                energy: (0.8, 1.0),
                valence: (0.0, 0.35),
                tempo: (110.0, 190.0),
                genres: &["metal", "punk", "hardcore"],
            }),
            ("chill", MoodProfile {
                energy: (0.2, 0.5),
                valence: (0.4, 0.75),
                tempo: (70.0, 110.0),
                genres: &["lo fi", "chillout", "downtempo", "trip hop"],
            }),
        ];
        table.into_iter().collect()
    };
}

/// Mood keyword lookup, case-insensitive.
pub fn mood_profile(mood: &str) -> Option<&'static MoodProfile> {
    MOODS.get(mood.trim().to_lowercase().as_str())
}

/// Every known mood keyword, sorted.
pub fn moods() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = MOODS.keys().copied().collect();
    names.sort_unstable();
    names
}

/// 1.0 inside the range, falling off linearly by one range width outside.
fn range_fit(value: f64, (low, high): (f64, f64)) -> f64 {
    let width = (high - low).max(f64::EPSILON);
    if value < low {
        (1.0 - (low - value) / width).max(0.0)
    } else if value > high {
        (1.0 - (value - high) / width).max(0.0)
    } else {
        1.0
    }
}

impl MoodProfile {
    /// How well `features` fit the mood, `None` without energy, valence or tempo.
    pub fn fit(&self, features: &AudioFeatures) -> Option<f64> {
        let terms: Vec<f64> = [
            features.energy.map(|e| range_fit(e, self.energy)),
            features.valence.map(|v| range_fit(v, self.valence)),
            features.tempo.map(|t| range_fit(t, self.tempo)),
        ]
        .into_iter()
        .flatten()
        .collect();
        if terms.is_empty() {
            return None;
        }
        Some(terms.iter().sum::<f64>() / terms.len() as f64)
    }

    pub fn matches_genre(&self, track: &Track) -> bool {
        self.genres.iter().any(|g| track.has_genre(g))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum GenerationMethod {
    Personalized,
    Mood { mood: String },
    Genre { genre: String },
    ArtistRadio { artist_id: String },
    Discovery,
    Similar { track_id: String },
}

impl GenerationMethod {
    pub fn exploration(&self) -> f64 {
        match self {
            Self::Personalized => 0.1,
            Self::Mood { .. } | Self::Genre { .. } => 0.3,
            Self::ArtistRadio { .. } | Self::Similar { .. } => 0.2,
            Self::Discovery => 0.8,
        }
    }

    fn seed_query(&self) -> Option<SeedQuery> {
        match self {
            Self::Mood { mood } => Some(SeedQuery::Mood(mood.clone())),
            Self::Genre { genre } => Some(SeedQuery::Genre(genre.clone())),
            Self::ArtistRadio { artist_id } => Some(SeedQuery::Artist(artist_id.clone())),
            Self::Similar { track_id } => Some(SeedQuery::Track(track_id.clone())),
            Self::Personalized | Self::Discovery => None,
        }
    }
}

impl fmt::Display for GenerationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Personalized => write!(f, "personalized"),
            Self::Mood { mood } => write!(f, "mood:{mood}"),
            Self::Genre { genre } => write!(f, "genre:{genre}"),
            Self::ArtistRadio { artist_id } => write!(f, "artist-radio:{artist_id}"),
            Self::Discovery => write!(f, "discovery"),
            Self::Similar { track_id } => write!(f, "similar:{track_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Candidate pool size as a multiple of the requested length.
    pub candidate_multiplier: usize,
    /// Hard cap on tracks per primary artist in one playlist.
    pub max_per_artist: usize,
    /// Discovery skips tracks played within this many hours.
    pub discovery_window_hours: i64,
    pub catalog_timeout_ms: u64,
    /// Bonus for a perfect mood fit in mood playlists.
    pub mood_weight: f64,
    /// Amplitude of the random score jitter applied before selection; 0 disables.
    pub shuffle_jitter: f64,
    /// Tracks averaged into an anchor vector.
    pub anchor_tracks: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            candidate_multiplier: 3,
            max_per_artist: 4,
            discovery_window_hours: 72,
            catalog_timeout_ms: 5000,
            mood_weight: 20.0,
            shuffle_jitter: 0.0,
            anchor_tracks: 20,
        }
    }
}

/// One generation call; `id` orders requests so late results can be dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub id: u64,
    pub method: GenerationMethod,
    pub limit: usize,
    pub exclude: HashSet<String>,
}

/// Where the candidates of a playlist came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateSource {
    Index,
    Catalog,
    Mixed,
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Playlist {
    pub request_id: u64,
    pub method: GenerationMethod,
    pub source: CandidateSource,
    pub tracks: Vec<ScoredTrack>,
}

impl Playlist {
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn track_ids(&self) -> Vec<&str> {
        self.tracks.iter().map(|s| s.track.id.as_str()).collect()
    }
}

/// A track proposed for ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub track: Track,
    /// Cosine similarity to the anchor vector, when known.
    pub similarity: Option<f32>,
}

/// Everything a generation pass reads.
pub struct Sources<'a> {
    pub index: &'a SimilarityIndex,
    pub features: &'a FeatureAggregator,
    pub catalog: &'a CatalogClient,
    pub profile: &'a UserProfile,
    pub model: Option<&'a dyn PredictionModel>,
    pub training_cycles: u32,
}

impl Sources<'_> {
    fn vector_of(&self, track: &Track) -> Option<Vec<f32>> {
        self.index
            .vector(&track.id)
            .map(<[f32]>::to_vec)
            .or_else(|| track.embedding.clone())
    }
}

/// Component-wise mean of the given vectors, fitted to `dimension`.
pub fn centroid<'v>(vectors: impl IntoIterator<Item = &'v [f32]>, dimension: usize) -> Option<Vec<f32>> {
    let mut sum = vec![0.0f32; dimension];
    let mut count = 0usize;
    for vector in vectors {
        for (acc, value) in sum.iter_mut().zip(fit_dimension(vector, dimension)) {
            *acc += value;
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    for value in &mut sum {
        *value /= count as f32;
    }
    Some(sum)
}

pub struct PlaylistGenerator {
    config: GeneratorConfig,
    scoring: ScoringEngine,
    requests: AtomicU64,
}

impl PlaylistGenerator {
    pub fn new(config: GeneratorConfig, scoring: ScoringEngine) -> Self {
        Self {
            config,
            scoring,
            requests: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn scoring(&self) -> &ScoringEngine {
        &self.scoring
    }

    /// Open a new request; every earlier request becomes stale.
    pub fn request(&self, method: GenerationMethod, limit: usize) -> GenerationRequest {
        let id = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        GenerationRequest {
            id,
            method,
            limit,
            exclude: HashSet::new(),
        }
    }

    pub fn latest_request(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Whether a newer request has been opened since `request_id`.
    pub fn is_stale(&self, request_id: u64) -> bool {
        request_id < self.latest_request()
    }

    /// Run the full pipeline for `request`.
    pub async fn generate<R: Rng>(
        &self,
        sources: &Sources<'_>,
        request: &GenerationRequest,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Playlist {
        let method = &request.method;
        let pool = request.limit.max(1) * self.config.candidate_multiplier.max(1);

        let (candidates, source) = self.collect_candidates(sources, method, pool, now).await;
        let candidates = self.filter_candidates(sources.profile, request, candidates, now);

        let mut context = ScoringContext::at(now).with_exploration(method.exploration());
        if let GenerationMethod::Mood { mood } = method {
            context.mood_hint = Some(mood.clone());
        }

        let mut scored = self.score_candidates(sources, candidates, &context, None).await;
        if let Some(profile) = context.mood_hint.as_deref().and_then(mood_profile) {
            for item in &mut scored {
                if let Some(fit) = item.features.as_ref().and_then(|f| profile.fit(f)) {
                    item.breakdown.add("mood", fit * self.config.mood_weight);
                }
            }
        }
        self.scoring
            .adjust_batch(&mut scored, sources.profile, &context);

        self.jitter(&mut scored, rng);
        let tracks = select_diverse(scored, request.limit, self.config.max_per_artist);

        if tracks.is_empty() {
            debug!("{}", EngineError::NoCandidates);
        }
        info!(
            "Generated {} tracks for {method} (request {}, {:?} candidates)",
            tracks.len(),
            request.id,
            source
        );
        Playlist {
            request_id: request.id,
            method: method.clone(),
            source,
            tracks,
        }
    }

    async fn collect_candidates(
        &self,
        sources: &Sources<'_>,
        method: &GenerationMethod,
        pool: usize,
        now: DateTime<Utc>,
    ) -> (Vec<Candidate>, CandidateSource) {
        let catalog_tracks = match method.seed_query() {
            Some(query) => sources.catalog.candidates_for_seed(&query, pool).await,
            None => self.profile_candidates(sources, method, pool, now).await,
        };

        let anchor = match method {
            GenerationMethod::Similar { track_id } => match sources.index.vector(track_id) {
                Some(vector) => Some(vector.to_vec()),
                None => sources
                    .catalog
                    .tracks_by_ids(std::slice::from_ref(track_id))
                    .await
                    .first()
                    .and_then(|t| t.embedding.clone()),
            },
            GenerationMethod::Personalized | GenerationMethod::Discovery => {
                let favourites = self.favourite_tracks(sources).await;
                self.anchor_from(sources, &favourites)
            }
            _ => self.anchor_from(sources, &catalog_tracks),
        };

        let mut candidates =
            self.candidates_near(sources, anchor.as_deref(), catalog_tracks, pool).await;

        if let GenerationMethod::Genre { genre } = method {
            candidates.0.retain(|c| c.track.has_genre(genre));
        }
        candidates
    }

    /// Liked tracks plus recent completed listens, newest first.
    async fn favourite_tracks(&self, sources: &Sources<'_>) -> Vec<Track> {
        let profile = sources.profile;
        let mut seen = HashSet::new();
        let ids: Vec<String> = profile
            .listen_history
            .iter()
            .rev()
            .filter(|event| event.completed)
            .map(|event| event.track_id.clone())
            .chain(profile.liked_tracks.iter().cloned())
            .filter(|id| seen.insert(id.clone()))
            .take(self.config.anchor_tracks)
            .collect();
        sources.catalog.tracks_by_ids(&ids).await
    }

    async fn profile_candidates(
        &self,
        sources: &Sources<'_>,
        method: &GenerationMethod,
        pool: usize,
        now: DateTime<Utc>,
    ) -> Vec<Track> {
        let mut tracks = Vec::new();
        if matches!(method, GenerationMethod::Personalized) {
            for (genre, score) in sources.profile.top_genres(3, now) {
                if score > 0.0 {
                    tracks.extend(
                        sources
                            .catalog
                            .candidates_for_seed(&SeedQuery::Genre(genre), pool)
                            .await,
                    );
                }
            }
            for (artist, score) in sources.profile.top_artists(3, now) {
                if score > 0.0 {
                    tracks.extend(
                        sources
                            .catalog
                            .candidates_for_seed(&SeedQuery::Artist(artist), pool)
                            .await,
                    );
                }
            }
        }
        if tracks.len() < pool {
            tracks.extend(sources.catalog.trending(pool * 2).await);
        }
        tracks
    }

    fn anchor_from(&self, sources: &Sources<'_>, tracks: &[Track]) -> Option<Vec<f32>> {
        let vectors: Vec<Vec<f32>> = tracks
            .iter()
            .take(self.config.anchor_tracks)
            .filter_map(|t| sources.vector_of(t))
            .collect();
        centroid(vectors.iter().map(Vec::as_slice), sources.index.config().dimension)
    }

    /// Index neighbors of `anchor` (when the index is ready), followed by
    /// `fallback` tracks not already proposed.
    pub async fn candidates_near(
        &self,
        sources: &Sources<'_>,
        anchor: Option<&[f32]>,
        fallback: Vec<Track>,
        pool: usize,
    ) -> (Vec<Candidate>, CandidateSource) {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut from_index = false;

        let index = sources.index;
        match anchor {
            Some(anchor) if index.is_ready() => {
                let hits = index.search_auto(anchor, pool);
                let ids: Vec<String> = hits.iter().map(|h| h.id.clone()).collect();
                for track in sources.catalog.tracks_by_ids(&ids).await {
                    if seen.insert(track.id.clone()) {
                        let similarity = index
                            .vector(&track.id)
                            .map(|v| cosine_similarity(&fit_dimension(anchor, v.len()), v));
                        candidates.push(Candidate { track, similarity });
                        from_index = true;
                    }
                }
            }
            Some(_) => debug!(
                "{}",
                EngineError::IndexNotReady {
                    size: index.len(),
                    required: index.config().min_ready_size,
                }
            ),
            None => {}
        }

        let indexed = candidates.len();
        for track in fallback {
            if seen.insert(track.id.clone()) {
                let similarity = anchor.and_then(|a| {
                    sources
                        .vector_of(&track)
                        .map(|v| cosine_similarity(&fit_dimension(a, v.len()), &v))
                });
                candidates.push(Candidate { track, similarity });
            }
        }

        let source = match (from_index, candidates.len() > indexed) {
            (true, true) => CandidateSource::Mixed,
            (true, false) => CandidateSource::Index,
            (false, true) => CandidateSource::Catalog,
            (false, false) => CandidateSource::None,
        };
        (candidates, source)
    }

    fn filter_candidates(
        &self,
        profile: &UserProfile,
        request: &GenerationRequest,
        candidates: Vec<Candidate>,
        now: DateTime<Utc>,
    ) -> Vec<Candidate> {
        let recent = match request.method {
            GenerationMethod::Discovery => profile.recently_played(
                chrono::Duration::hours(self.config.discovery_window_hours),
                now,
            ),
            _ => HashSet::new(),
        };
        let seed_track = match &request.method {
            GenerationMethod::Similar { track_id } => Some(track_id.as_str()),
            _ => None,
        };
        let discovery = matches!(request.method, GenerationMethod::Discovery);

        candidates
            .into_iter()
            .filter(|c| {
                let id = c.track.id.as_str();
                !request.exclude.contains(id)
                    && !profile.is_disliked(id)
                    && seed_track != Some(id)
                    && !recent.contains(id)
                    && !(discovery && profile.is_liked(id))
            })
            .collect()
    }

    /// Fetch features and model predictions, then score every candidate.
    ///
    /// With a seed, each score is also pulled toward seed relevance using the
    /// drift weight for `played` radio tracks.
    pub async fn score_candidates(
        &self,
        sources: &Sources<'_>,
        candidates: Vec<Candidate>,
        context: &ScoringContext,
        seed: Option<(&RadioSeed, u32)>,
    ) -> Vec<ScoredTrack> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let ids: Vec<String> = candidates.iter().map(|c| c.track.id.clone()).collect();
        let bundles = sources.features.get_batch(&ids).await;
        let predictions = self.predict(sources, &candidates, context).await;

        candidates
            .into_iter()
            .zip(bundles)
            .zip(predictions)
            .map(|((candidate, bundle), prediction)| {
                let Candidate { track, similarity } = candidate;
                let features = bundle.effective_audio().or_else(|| track.features.clone());
                let breakdown = self.scoring.rule_score(&track, sources.profile, context);
                let mut breakdown =
                    self.scoring
                        .blend_model(breakdown, prediction, sources.training_cycles);
                if let Some((seed, played)) = seed {
                    self.scoring
                        .apply_seed(&mut breakdown, seed, &track, features.as_ref(), played);
                }
                ScoredTrack {
                    track,
                    features,
                    similarity,
                    breakdown,
                }
            })
            .collect()
    }

    async fn predict(
        &self,
        sources: &Sources<'_>,
        candidates: &[Candidate],
        context: &ScoringContext,
    ) -> Vec<Option<f64>> {
        let none = vec![None; candidates.len()];
        let Some(model) = sources.model else {
            return none;
        };
        let tracks: Vec<Track> = candidates.iter().map(|c| c.track.clone()).collect();
        match model.predict_batch(&tracks, context).await {
            Ok(predictions) if predictions.len() == tracks.len() => {
                predictions.into_iter().map(Some).collect()
            }
            Ok(predictions) => {
                warn!(
                    "Model returned {} predictions for {} tracks, ignoring",
                    predictions.len(),
                    tracks.len()
                );
                none
            }
            Err(e) => {
                debug!("Falling back to rule-based scores: {e}");
                none
            }
        }
    }

    fn jitter<R: Rng>(&self, scored: &mut [ScoredTrack], rng: &mut R) {
        let amplitude = self.config.shuffle_jitter;
        if amplitude <= 0.0 {
            return;
        }
        for item in scored.iter_mut() {
            item.breakdown
                .add("jitter", rng.gen_range(-amplitude..=amplitude));
        }
        sort_by_score(scored);
    }
}

/// Take the best `limit` tracks, skipping any that would put more than
/// `max_per_artist` tracks by one primary artist in the result.
pub fn select_diverse(
    ranked: Vec<ScoredTrack>,
    limit: usize,
    max_per_artist: usize,
) -> Vec<ScoredTrack> {
    let mut per_artist: HashMap<String, usize> = HashMap::new();
    let mut selected = Vec::with_capacity(limit);
    for item in ranked {
        if selected.len() >= limit {
            break;
        }
        if item.breakdown.disliked {
            continue;
        }
        if let Some(artist) = item.track.primary_artist() {
            let count = per_artist.entry(artist.to_string()).or_insert(0);
            if *count >= max_per_artist {
                continue;
            }
            *count += 1;
        }
        selected.push(item);
    }
    selected
}
