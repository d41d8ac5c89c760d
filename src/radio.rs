//! # Radio & Auto-Queue
//!
//! [`QueueController`] decides when the play queue needs more tracks and what
//! a refill may contain. It has three modes:
//!
//! - **Manual** - never refills.
//! - **AutoQueue** - refills with tracks that follow the listening session.
//! - **Radio** - refills around a [`RadioSeed`], drifting away from it as more
//!   radio tracks play.
//!
//! Mode changes only happen on explicit user action. In both automatic modes
//! a refill is due when the remaining queue depth drops to the threshold, at
//! most once per fetch interval and never while another fetch is running.
//! Empty refills count as failures and back off exponentially.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::catalog::SeedQuery;
use crate::features::AudioFeatures;
use crate::generator::{centroid, PlaylistGenerator, Sources};
use crate::scoring::{RadioSeed, ScoredTrack, ScoringContext, SeedKind};
use crate::track::Track;

/// Exploration used for refills.
const REFILL_EXPLORATION: f64 = 0.2;
/// Session tracks averaged into the auto-queue anchor.
const SESSION_ANCHOR_TRACKS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Refill once this many tracks or fewer are left.
    pub refill_threshold: usize,
    pub batch_size: usize,
    pub min_fetch_interval_secs: u64,
    /// Failures after which the backoff jumps straight to its cap.
    pub max_consecutive_failures: u32,
    pub max_backoff_secs: u64,
    pub max_per_artist: usize,
    pub max_consecutive_same_artist: usize,
    pub session_history: usize,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            refill_threshold: 3,
            batch_size: 10,
            min_fetch_interval_secs: 10,
            max_consecutive_failures: 3,
            max_backoff_secs: 300,
            max_per_artist: 2,
            max_consecutive_same_artist: 1,
            session_history: 200,
        }
    }
}

impl RadioConfig {
    fn min_fetch_interval(&self) -> Duration {
        Duration::from_secs(self.min_fetch_interval_secs)
    }

    fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueMode {
    Manual,
    AutoQueue,
    Radio { seed: RadioSeed, played: u32 },
}

/// What the host's play queue currently holds after the playing track.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueState {
    pub upcoming: Vec<String>,
}

impl QueueState {
    pub fn new(upcoming: Vec<String>) -> Self {
        Self { upcoming }
    }

    pub fn remaining(&self) -> usize {
        self.upcoming.len()
    }
}

/// Result of a refill attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Replenishment {
    pub tracks: Vec<ScoredTrack>,
    /// Set when the caller should wait before asking again.
    pub retry_after: Option<Duration>,
}

impl Replenishment {
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SessionEntry {
    track_id: String,
    artist: Option<String>,
    genres: Vec<String>,
    features: Option<AudioFeatures>,
}

/// Inputs for one refill, captured when the fetch starts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplenishPlan {
    pub seed: Option<RadioSeed>,
    pub played: u32,
    pub count: usize,
    pub exclude: HashSet<String>,
    /// Session track ids, oldest first.
    pub session_tracks: Vec<String>,
    /// Primary artists of the session, oldest first.
    pub recent_artists: Vec<String>,
    pub session_genres: Vec<String>,
    pub recent_features: Vec<AudioFeatures>,
    pub max_per_artist: usize,
    pub max_consecutive_same_artist: usize,
}

#[derive(Debug)]
pub struct QueueController {
    config: RadioConfig,
    mode: QueueMode,
    session: VecDeque<SessionEntry>,
    fetching: bool,
    last_fetch: Option<Instant>,
    retry_at: Option<Instant>,
    consecutive_failures: u32,
}

impl QueueController {
    pub fn new(config: RadioConfig) -> Self {
        Self {
            config,
            mode: QueueMode::Manual,
            session: VecDeque::new(),
            fetching: false,
            last_fetch: None,
            retry_at: None,
            consecutive_failures: 0,
        }
    }

    pub fn config(&self) -> &RadioConfig {
        &self.config
    }

    pub fn mode(&self) -> &QueueMode {
        &self.mode
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Session track ids, oldest first.
    pub fn session_tracks(&self) -> impl Iterator<Item = &str> {
        self.session.iter().map(|e| e.track_id.as_str())
    }

    fn reset_fetch_state(&mut self) {
        self.fetching = false;
        self.last_fetch = None;
        self.retry_at = None;
        self.consecutive_failures = 0;
    }

    pub fn enable_auto_queue(&mut self) {
        info!("Auto-queue enabled");
        self.mode = QueueMode::AutoQueue;
        self.reset_fetch_state();
    }

    pub fn start_radio(&mut self, seed: RadioSeed) {
        info!("Starting radio from {:?} '{}'", seed.kind, seed.name);
        self.mode = QueueMode::Radio { seed, played: 0 };
        self.reset_fetch_state();
    }

    /// Back to manual; the session history is kept.
    pub fn stop(&mut self) {
        if self.mode != QueueMode::Manual {
            info!("Queue back to manual");
        }
        self.mode = QueueMode::Manual;
        self.reset_fetch_state();
    }

    pub fn record_played(&mut self, track: &Track, features: Option<AudioFeatures>) {
        self.session.push_back(SessionEntry {
            track_id: track.id.clone(),
            artist: track.primary_artist().map(str::to_string),
            genres: track.genres.clone(),
            features: features.or_else(|| track.features.clone()),
        });
        while self.session.len() > self.config.session_history.max(1) {
            self.session.pop_front();
        }
        if let QueueMode::Radio { played, .. } = &mut self.mode {
            *played += 1;
        }
    }

    /// Time left before another fetch is allowed, if any.
    pub fn retry_after(&self, now: Instant) -> Option<Duration> {
        let interval_end = self.last_fetch.map(|t| t + self.config.min_fetch_interval());
        let earliest = match (interval_end, self.retry_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }?;
        let wait = earliest.saturating_duration_since(now);
        (!wait.is_zero()).then_some(wait)
    }

    pub fn should_replenish(&self, remaining: usize, now: Instant) -> bool {
        self.mode != QueueMode::Manual
            && !self.fetching
            && remaining <= self.config.refill_threshold
            && self.retry_after(now).is_none()
    }

    /// Claim the single fetch slot and capture what the refill needs.
    pub fn begin_fetch(&mut self, state: &QueueState, now: Instant) -> Option<ReplenishPlan> {
        if !self.should_replenish(state.remaining(), now) {
            return None;
        }
        self.fetching = true;
        self.last_fetch = Some(now);

        let (seed, played) = match &self.mode {
            QueueMode::Radio { seed, played } => (Some(seed.clone()), *played),
            _ => (None, 0),
        };
        let mut exclude: HashSet<String> = state.upcoming.iter().cloned().collect();
        exclude.extend(self.session.iter().map(|e| e.track_id.clone()));
        if let Some(seed) = seed.as_ref().filter(|s| s.kind == SeedKind::Track) {
            exclude.insert(seed.id.clone());
        }

        Some(ReplenishPlan {
            seed,
            played,
            count: self.config.batch_size,
            exclude,
            session_tracks: self.session.iter().map(|e| e.track_id.clone()).collect(),
            recent_artists: self.session.iter().filter_map(|e| e.artist.clone()).collect(),
            session_genres: self.session.iter().flat_map(|e| e.genres.iter().cloned()).collect(),
            recent_features: self
                .session
                .iter()
                .rev()
                .filter_map(|e| e.features.clone())
                .take(SESSION_ANCHOR_TRACKS)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect(),
            max_per_artist: self.config.max_per_artist,
            max_consecutive_same_artist: self.config.max_consecutive_same_artist,
        })
    }

    /// Release the fetch slot. Returns the backoff when nothing was delivered.
    pub fn finish_fetch(&mut self, delivered: usize, now: Instant) -> Option<Duration> {
        self.fetching = false;
        if delivered > 0 {
            self.consecutive_failures = 0;
            self.retry_at = None;
            return None;
        }

        self.consecutive_failures += 1;
        let backoff = if self.consecutive_failures >= self.config.max_consecutive_failures {
            self.config.max_backoff()
        } else {
            let factor = 2u32.saturating_pow(self.consecutive_failures);
            self.config
                .min_fetch_interval()
                .saturating_mul(factor)
                .min(self.config.max_backoff())
        };
        warn!(
            "Refill produced nothing ({} in a row), retrying in {:?}",
            self.consecutive_failures, backoff
        );
        self.retry_at = Some(now + backoff);
        Some(backoff)
    }
}

fn seed_query(seed: &RadioSeed) -> SeedQuery {
    match seed.kind {
        SeedKind::Track => SeedQuery::Track(seed.id.clone()),
        SeedKind::Artist => SeedQuery::Artist(seed.id.clone()),
        SeedKind::Genre => SeedQuery::Genre(seed.id.clone()),
    }
}

/// Gather, score and diversity-filter one refill batch.
pub async fn fetch_batch(
    generator: &PlaylistGenerator,
    sources: &Sources<'_>,
    plan: &ReplenishPlan,
    now: DateTime<Utc>,
) -> Vec<ScoredTrack> {
    let pool = plan.count.max(1) * generator.config().candidate_multiplier.max(1);
    let index = sources.index;

    let seed_vector = plan
        .seed
        .as_ref()
        .filter(|s| s.kind == SeedKind::Track)
        .and_then(|s| index.vector(&s.id))
        .map(<[f32]>::to_vec);
    let anchor = seed_vector.or_else(|| {
        let recent: Vec<&[f32]> = plan
            .session_tracks
            .iter()
            .rev()
            .filter_map(|id| index.vector(id))
            .take(SESSION_ANCHOR_TRACKS)
            .collect();
        centroid(recent, index.config().dimension)
    });

    let query = match &plan.seed {
        Some(seed) => Some(seed_query(seed)),
        None => plan.session_tracks.last().cloned().map(SeedQuery::Track),
    };
    let fallback = match &query {
        Some(query) => sources.catalog.candidates_for_seed(query, pool).await,
        None => sources.catalog.trending(pool).await,
    };

    let (candidates, source) = generator
        .candidates_near(sources, anchor.as_deref(), fallback, pool)
        .await;
    let candidates: Vec<_> = candidates
        .into_iter()
        .filter(|c| !plan.exclude.contains(&c.track.id) && !sources.profile.is_disliked(&c.track.id))
        .collect();
    debug!("Refill has {} candidates ({source:?})", candidates.len());

    let mut context = ScoringContext::at(now).with_exploration(REFILL_EXPLORATION);
    context.session_track_ids = plan.session_tracks.clone();
    context.session_artists = plan.recent_artists.clone();
    context.session_genres = plan.session_genres.clone();
    context.recent_features = plan.recent_features.clone();
    context.session_energy = plan.recent_features.iter().rev().find_map(|f| f.energy);

    let seed = plan.seed.as_ref().map(|s| (s, plan.played));
    let mut scored = generator
        .score_candidates(sources, candidates, &context, seed)
        .await;
    generator
        .scoring()
        .adjust_batch(&mut scored, sources.profile, &context);

    diversify(
        scored,
        plan.count,
        plan.max_per_artist,
        plan.max_consecutive_same_artist,
        &plan.recent_artists,
    )
}

/// Pick up to `count` tracks best first, with at most `max_per_artist` per
/// primary artist and no run of the same artist longer than
/// `max_consecutive`, counting the tail of `recent_artists`.
pub fn diversify(
    ranked: Vec<ScoredTrack>,
    count: usize,
    max_per_artist: usize,
    max_consecutive: usize,
    recent_artists: &[String],
) -> Vec<ScoredTrack> {
    let max_consecutive = max_consecutive.max(1);
    let mut run_artist = recent_artists.last().cloned();
    let mut run_len = recent_artists
        .iter()
        .rev()
        .take_while(|a| Some(*a) == run_artist.as_ref())
        .count();

    let mut per_artist: HashMap<String, usize> = HashMap::new();
    let mut remaining: Vec<ScoredTrack> = ranked.into_iter().filter(|s| !s.breakdown.disliked).collect();
    let mut selected = Vec::with_capacity(count);

    while selected.len() < count {
        let pick = remaining.iter().position(|item| match item.track.primary_artist() {
            Some(artist) => {
                per_artist.get(artist).copied().unwrap_or(0) < max_per_artist
                    && !(run_artist.as_deref() == Some(artist) && run_len >= max_consecutive)
            }
            None => true,
        });
        let Some(pick) = pick else {
            break;
        };

        let item = remaining.remove(pick);
        match item.track.primary_artist() {
            Some(artist) => {
                *per_artist.entry(artist.to_string()).or_insert(0) += 1;
                if run_artist.as_deref() == Some(artist) {
                    run_len += 1;
                } else {
                    run_artist = Some(artist.to_string());
                    run_len = 1;
                }
            }
            None => {
                run_artist = None;
                run_len = 0;
            }
        }
        selected.push(item);
    }
    selected
}
