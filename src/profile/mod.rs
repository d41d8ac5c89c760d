//! # User Profile
//!
//! Learned listening preferences and the event history they are derived from.
//!
//! The profile is mutated only by explicit events (listen, skip, like,
//! dislike, reorder). Preference scores are stored undecayed and clamped to
//! `[-100, 100]`; time decay is applied when they are read, never in place, so
//! reading the profile twice at the same instant always gives the same answer.
//!
//! ## Event Effects
//!
//! | Event | Artist | Genre |
//! |---|---|---|
//! | completed listen (>= 80%) | +2 | +1 |
//! | skip (< 30 s) | -3 | -1 |
//! | like | +5 | +3 |
//! | dislike | -5 (-20 for "dislike artist") | -2 (-20 for "dislike genre") |
//! | reorder up / down | +1 / -1 | +1 / -1 |

mod store;

pub use store::{JsonProfileStore, ProfileStore, SqliteProfileStore};

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::track::{normalize_genre, Track};

pub const SCORE_MIN: f64 = -100.0;
pub const SCORE_MAX: f64 = 100.0;
/// Preference scores lose half their weight after this many days without a
/// new signal.
pub const PREFERENCE_HALF_LIFE_DAYS: f64 = 90.0;
/// A listen of at least this fraction of the track counts as completed.
pub const COMPLETION_RATIO: f64 = 0.8;
/// A listen shorter than this counts as a skip.
pub const SKIP_THRESHOLD_MS: u64 = 30_000;
/// Hourly buckets need this many samples before they influence scoring.
const MIN_HOUR_SAMPLES: u32 = 5;

const COMPLETED_ARTIST_DELTA: f64 = 2.0;
const COMPLETED_GENRE_DELTA: f64 = 1.0;
const SKIP_ARTIST_DELTA: f64 = -3.0;
const SKIP_GENRE_DELTA: f64 = -1.0;
const LIKE_ARTIST_DELTA: f64 = 5.0;
const LIKE_GENRE_DELTA: f64 = 3.0;
const DISLIKE_ARTIST_DELTA: f64 = -5.0;
const DISLIKE_GENRE_DELTA: f64 = -2.0;
const STRONG_DISLIKE_DELTA: f64 = -20.0;
const REORDER_DELTA: f64 = 1.0;

/// Accumulated preference for one artist or genre.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preference {
    /// Undecayed score in `[-100, 100]`.
    pub score: f64,
    pub play_count: u32,
    pub total_listen_time_ms: u64,
    pub like_count: u32,
    pub dislike_count: u32,
    pub last_updated: DateTime<Utc>,
}

impl Preference {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            score: 0.0,
            play_count: 0,
            total_listen_time_ms: 0,
            like_count: 0,
            dislike_count: 0,
            last_updated: at,
        }
    }

    fn apply(&mut self, delta: f64, at: DateTime<Utc>) {
        self.score = (self.score + delta).clamp(SCORE_MIN, SCORE_MAX);
        self.last_updated = self.last_updated.max(at);
    }

    /// Score with time decay applied as of `now`.
    pub fn decayed_score(&self, now: DateTime<Utc>) -> f64 {
        self.score * decay_factor(self.last_updated, now, PREFERENCE_HALF_LIFE_DAYS)
    }
}

/// Exponential half-life decay; never amplifies for timestamps in the future.
pub fn decay_factor(since: DateTime<Utc>, now: DateTime<Utc>, half_life_days: f64) -> f64 {
    let elapsed_days = (now - since).num_seconds().max(0) as f64 / 86_400.0;
    0.5f64.powf(elapsed_days / half_life_days)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenEvent {
    pub track_id: String,
    pub timestamp: DateTime<Utc>,
    pub listened_duration_ms: u64,
    pub total_duration_ms: u64,
    pub completed: bool,
    pub skipped: bool,
}

/// Why the user disliked a track. Each reason scales the dislike penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DislikeReason {
    NotMyTaste,
    TooRepetitive,
    WrongMood,
    BadQuality,
    DislikeArtist,
    DislikeGenre,
    Other,
}

impl DislikeReason {
    pub const fn multiplier(self) -> f64 {
        match self {
            Self::NotMyTaste => 1.0,
            Self::TooRepetitive => 0.8,
            Self::WrongMood => 0.6,
            Self::BadQuality => 1.2,
            Self::DislikeArtist => 1.5,
            Self::DislikeGenre => 1.3,
            Self::Other => 1.0,
        }
    }
}

impl std::str::FromStr for DislikeReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "not_my_taste" => Ok(Self::NotMyTaste),
            "too_repetitive" => Ok(Self::TooRepetitive),
            "wrong_mood" => Ok(Self::WrongMood),
            "bad_quality" => Ok(Self::BadQuality),
            "dislike_artist" => Ok(Self::DislikeArtist),
            "dislike_genre" => Ok(Self::DislikeGenre),
            "other" => Ok(Self::Other),
            other => Err(format!("Unknown dislike reason: {other}")),
        }
    }
}

/// Track metadata captured when the dislike was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub title: String,
    pub artist_ids: Vec<String>,
    pub genres: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DislikedTrack {
    pub track_id: String,
    pub reasons: HashSet<DislikeReason>,
    pub timestamp: DateTime<Utc>,
    pub metadata: TrackSnapshot,
}

impl DislikedTrack {
    /// Product of the reason multipliers; 1.0 when no reason was given.
    pub fn reason_multiplier(&self) -> f64 {
        self.reasons.iter().map(|r| r.multiplier()).product()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorderEvent {
    pub track_id: String,
    pub from_index: usize,
    pub to_index: usize,
    pub timestamp: DateTime<Utc>,
}

/// Running mean/variance of completed-listen durations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct DurationStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl DurationStats {
    fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }
}

fn default_history_capacity() -> usize {
    500
}

/// Everything the engine has learned about the listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub artist_preferences: HashMap<String, Preference>,
    pub genre_preferences: HashMap<String, Preference>,
    /// Genre play counts per hour of day (UTC), 24 buckets.
    pub time_patterns: Vec<HashMap<String, u32>>,
    pub total_listens: u64,
    pub total_skips: u64,
    pub total_listen_time_ms: u64,
    pub listen_history: VecDeque<ListenEvent>,
    pub reorder_history: VecDeque<ReorderEvent>,
    pub disliked: HashMap<String, DislikedTrack>,
    pub liked_tracks: HashSet<String>,
    pub last_played: HashMap<String, DateTime<Utc>>,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default)]
    durations: DurationStats,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self::with_history_capacity(default_history_capacity())
    }
}

impl UserProfile {
    pub fn with_history_capacity(history_capacity: usize) -> Self {
        Self {
            artist_preferences: HashMap::new(),
            genre_preferences: HashMap::new(),
            time_patterns: vec![HashMap::new(); 24],
            total_listens: 0,
            total_skips: 0,
            total_listen_time_ms: 0,
            listen_history: VecDeque::new(),
            reorder_history: VecDeque::new(),
            disliked: HashMap::new(),
            liked_tracks: HashSet::new(),
            last_played: HashMap::new(),
            history_capacity: history_capacity.max(1),
            durations: DurationStats::default(),
        }
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub fn artist_score(&self, artist_id: &str, now: DateTime<Utc>) -> f64 {
        self.artist_preferences
            .get(artist_id)
            .map_or(0.0, |p| p.decayed_score(now))
    }

    pub fn genre_score(&self, genre: &str, now: DateTime<Utc>) -> f64 {
        self.genre_preferences
            .get(&normalize_genre(genre))
            .map_or(0.0, |p| p.decayed_score(now))
    }

    pub fn is_known_artist(&self, artist_id: &str) -> bool {
        self.artist_preferences.contains_key(artist_id)
    }

    pub fn is_known_genre(&self, genre: &str) -> bool {
        self.genre_preferences.contains_key(&normalize_genre(genre))
    }

    /// Share of plays at `hour` that went to any of `genres`, or `None` while
    /// the bucket has too few samples.
    pub fn hour_genre_affinity(&self, hour: u32, genres: &[String]) -> Option<f64> {
        let bucket = self.time_patterns.get(hour as usize)?;
        let total: u32 = bucket.values().sum();
        if total < MIN_HOUR_SAMPLES {
            return None;
        }
        let wanted: HashSet<String> = genres.iter().map(|g| normalize_genre(g)).collect();
        let matching: u32 = bucket
            .iter()
            .filter(|(genre, _)| wanted.contains(*genre))
            .map(|(_, count)| count)
            .sum();
        Some(f64::from(matching) / f64::from(total))
    }

    /// Duration window (ms) around the typical completed listen: mean ± one
    /// standard deviation, at least one minute wide. Needs five samples.
    pub fn preferred_duration_range(&self) -> Option<(u64, u64)> {
        if self.durations.count < 5 {
            return None;
        }
        let half_width = self.durations.std_dev().max(30_000.0);
        let low = (self.durations.mean - half_width).max(0.0);
        let high = self.durations.mean + half_width;
        Some((low as u64, high as u64))
    }

    pub fn disliked(&self, track_id: &str) -> Option<&DislikedTrack> {
        self.disliked.get(track_id)
    }

    pub fn is_disliked(&self, track_id: &str) -> bool {
        self.disliked.contains_key(track_id)
    }

    pub fn is_liked(&self, track_id: &str) -> bool {
        self.liked_tracks.contains(track_id)
    }

    pub fn last_played(&self, track_id: &str) -> Option<DateTime<Utc>> {
        self.last_played.get(track_id).copied()
    }

    /// Tracks played within `window` before `now`.
    pub fn recently_played(&self, window: Duration, now: DateTime<Utc>) -> HashSet<String> {
        self.last_played
            .iter()
            .filter(|(_, at)| now - **at <= window)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Genres ranked by decayed score, best first.
    pub fn top_genres(&self, n: usize, now: DateTime<Utc>) -> Vec<(String, f64)> {
        top_n(&self.genre_preferences, n, now)
    }

    /// Artists ranked by decayed score, best first.
    pub fn top_artists(&self, n: usize, now: DateTime<Utc>) -> Vec<(String, f64)> {
        top_n(&self.artist_preferences, n, now)
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    /// Record a playback of `track` and update preferences.
    pub fn record_listen(
        &mut self,
        track: &Track,
        listened_duration_ms: u64,
        at: DateTime<Utc>,
    ) -> ListenEvent {
        let total_duration_ms = track.duration_ms.unwrap_or(0);
        let completed = total_duration_ms > 0
            && listened_duration_ms as f64 / total_duration_ms as f64 >= COMPLETION_RATIO;
        let skipped = !completed && listened_duration_ms < SKIP_THRESHOLD_MS;

        let event = ListenEvent {
            track_id: track.id.clone(),
            timestamp: at,
            listened_duration_ms,
            total_duration_ms,
            completed,
            skipped,
        };

        self.total_listen_time_ms += listened_duration_ms;
        self.last_played.insert(track.id.clone(), at);

        if skipped {
            self.total_skips += 1;
            self.adjust(track, SKIP_ARTIST_DELTA, SKIP_GENRE_DELTA, at, |p| p);
        } else {
            self.total_listens += 1;
            let (artist_delta, genre_delta) = if completed {
                self.durations.push(total_duration_ms as f64);
                (COMPLETED_ARTIST_DELTA, COMPLETED_GENRE_DELTA)
            } else {
                (0.0, 0.0)
            };
            self.adjust(track, artist_delta, genre_delta, at, |p| {
                p.play_count += 1;
                p.total_listen_time_ms += listened_duration_ms;
                p
            });
            if self.time_patterns.len() < 24 {
                self.time_patterns.resize(24, HashMap::new());
            }
            let bucket = &mut self.time_patterns[at.hour() as usize];
            for genre in &track.genres {
                *bucket.entry(normalize_genre(genre)).or_insert(0) += 1;
            }
        }

        self.listen_history.push_back(event.clone());
        while self.listen_history.len() > self.history_capacity {
            self.listen_history.pop_front();
        }
        event
    }

    /// Explicit skip, independent of how long the track played.
    pub fn record_skip(&mut self, track: &Track, at: DateTime<Utc>) {
        self.total_skips += 1;
        self.adjust(track, SKIP_ARTIST_DELTA, SKIP_GENRE_DELTA, at, |p| p);
    }

    pub fn record_like(&mut self, track: &Track, at: DateTime<Utc>) {
        if !self.liked_tracks.insert(track.id.clone()) {
            return;
        }
        self.disliked.remove(&track.id);
        self.adjust(track, LIKE_ARTIST_DELTA, LIKE_GENRE_DELTA, at, |p| {
            p.like_count += 1;
            p
        });
    }

    pub fn remove_like(&mut self, track_id: &str) -> bool {
        self.liked_tracks.remove(track_id)
    }

    /// Mark `track` as disliked. Re-disliking replaces the reasons.
    pub fn record_dislike(
        &mut self,
        track: &Track,
        reasons: HashSet<DislikeReason>,
        at: DateTime<Utc>,
    ) {
        let artist_delta = if reasons.contains(&DislikeReason::DislikeArtist) {
            STRONG_DISLIKE_DELTA
        } else {
            DISLIKE_ARTIST_DELTA
        };
        let genre_delta = if reasons.contains(&DislikeReason::DislikeGenre) {
            STRONG_DISLIKE_DELTA
        } else {
            DISLIKE_GENRE_DELTA
        };

        self.liked_tracks.remove(&track.id);
        self.adjust(track, artist_delta, genre_delta, at, |p| {
            p.dislike_count += 1;
            p
        });
        self.disliked.insert(
            track.id.clone(),
            DislikedTrack {
                track_id: track.id.clone(),
                reasons,
                timestamp: at,
                metadata: TrackSnapshot {
                    title: track.title.clone(),
                    artist_ids: track.artist_ids.clone(),
                    genres: track.genres.clone(),
                },
            },
        );
    }

    /// Undo a dislike. Preference adjustments already made are kept.
    pub fn remove_dislike(&mut self, track_id: &str) -> bool {
        self.disliked.remove(track_id).is_some()
    }

    /// A manual queue move: up is a mild positive signal, down a mild negative.
    pub fn record_reorder(
        &mut self,
        track: &Track,
        from_index: usize,
        to_index: usize,
        at: DateTime<Utc>,
    ) {
        let delta = match to_index.cmp(&from_index) {
            std::cmp::Ordering::Less => REORDER_DELTA,
            std::cmp::Ordering::Greater => -REORDER_DELTA,
            std::cmp::Ordering::Equal => return,
        };
        self.adjust(track, delta, delta, at, |p| p);
        self.reorder_history.push_back(ReorderEvent {
            track_id: track.id.clone(),
            from_index,
            to_index,
            timestamp: at,
        });
        while self.reorder_history.len() > self.history_capacity {
            self.reorder_history.pop_front();
        }
    }

    fn adjust(
        &mut self,
        track: &Track,
        artist_delta: f64,
        genre_delta: f64,
        at: DateTime<Utc>,
        update: impl Fn(&mut Preference) -> &mut Preference,
    ) {
        for artist in &track.artist_ids {
            let entry = self
                .artist_preferences
                .entry(artist.clone())
                .or_insert_with(|| Preference::new(at));
            update(entry).apply(artist_delta, at);
        }
        for genre in &track.genres {
            let entry = self
                .genre_preferences
                .entry(normalize_genre(genre))
                .or_insert_with(|| Preference::new(at));
            update(entry).apply(genre_delta, at);
        }
    }
}

fn top_n(prefs: &HashMap<String, Preference>, n: usize, now: DateTime<Utc>) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = prefs
        .iter()
        .map(|(key, pref)| (key.clone(), pref.decayed_score(now)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(n);
    ranked
}
