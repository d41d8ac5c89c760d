//! # Integration Tests for the Muse Engine
//!
//! End-to-end checks of the public API: similarity search, scoring,
//! playlist generation, feature aggregation, radio refills and the CLI
//! binary.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

use muse_engine::catalog::JsonCatalog;
use muse_engine::config::EngineConfig;
use muse_engine::engine::Engine;
use muse_engine::index::{IndexConfig, SimilarityIndex};
use muse_engine::scoring::ScoringContext;
use muse_engine::track::Track;

fn random_vector(rng: &mut StdRng, dimension: usize) -> Vec<f32> {
    (0..dimension).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn small_index_config(dimension: usize) -> IndexConfig {
    IndexConfig {
        dimension,
        ..IndexConfig::default()
    }
}

/// `artists` artists with `per_artist` tracks each, all with embeddings.
fn catalog_tracks(artists: usize, per_artist: usize, dimension: usize) -> Vec<Track> {
    let mut rng = StdRng::seed_from_u64(5);
    let mut tracks = Vec::new();
    for a in 0..artists {
        for t in 0..per_artist {
            let artist = format!("artist{a}");
            tracks.push(
                Track::new(format!("a{a}t{t}"), format!("Song {t}"))
                    .with_artist(artist.clone(), format!("Artist {a}"))
                    .with_genre(if a % 2 == 0 { "rock" } else { "pop" })
                    .with_duration_ms(180_000 + t as u64 * 1_000)
                    .with_embedding(random_vector(&mut rng, dimension)),
            );
        }
    }
    tracks
}

/// Test helper to write a catalog file into a temporary directory
fn create_test_catalog(tracks: &[Track]) -> Result<(TempDir, PathBuf)> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("catalog.json");
    std::fs::write(&path, serde_json::to_string(tracks)?)?;
    Ok((temp_dir, path))
}

#[cfg(test)]
mod index_tests {
    use super::*;

    #[test]
    fn test_nearest_neighbors_scenario() {
        let mut index = SimilarityIndex::with_seed(IndexConfig::default(), 1);
        let mut a = vec![0.0f32; 128];
        a[0] = 1.0;
        let mut b = vec![0.0f32; 128];
        b[0] = 0.9;
        b[1] = 0.1;
        let mut c = vec![0.0f32; 128];
        c[0] = -1.0;

        index.add("a", &a);
        index.add("b", &b);
        index.add("c", &c);

        let hits = index.search(&a, 2);
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn test_search_results_are_bounded_and_sorted() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut index = SimilarityIndex::with_seed(small_index_config(16), 21);
        let mut vectors = Vec::new();
        for i in 0..300 {
            let vector = random_vector(&mut rng, 16);
            index.add(&format!("v{i}"), &vector);
            vectors.push(vector);
        }

        for vector in vectors.iter().step_by(15) {
            for k in [1, 5, 20] {
                let hits = index.search(vector, k);
                assert!(!hits.is_empty() && hits.len() <= k);
                assert!(hits.iter().all(|h| index.contains(&h.id)));
                assert!(hits
                    .windows(2)
                    .all(|pair| pair[0].similarity >= pair[1].similarity));
            }
        }
    }

    #[test]
    fn test_approximate_search_agrees_with_exact_scan() {
        let mut rng = StdRng::seed_from_u64(99);
        let mut index = SimilarityIndex::with_seed(small_index_config(8), 99);
        for i in 0..800 {
            index.add(&format!("v{i}"), &random_vector(&mut rng, 8));
        }

        let queries = 200;
        let agreeing = (0..queries)
            .filter(|_| {
                let query = random_vector(&mut rng, 8);
                let approximate = index.search(&query, 1);
                let exact = index.brute_force_search(&query, 1);
                approximate.first().map(|h| &h.id) == exact.first().map(|h| &h.id)
            })
            .count();
        assert!(
            agreeing * 100 >= queries * 95,
            "only {agreeing}/{queries} top-1 results agree"
        );
    }

    #[test]
    fn test_removed_ids_disappear_everywhere() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut index = SimilarityIndex::with_seed(small_index_config(8), 3);
        let mut vectors = Vec::new();
        for i in 0..120 {
            let vector = random_vector(&mut rng, 8);
            index.add(&format!("v{i}"), &vector);
            vectors.push(vector);
        }

        let removed: Vec<String> = (0..120).step_by(7).map(|i| format!("v{i}")).collect();
        for id in &removed {
            assert!(index.remove(id));
        }
        // New inserts may reuse freed storage.
        for i in 0..10 {
            index.add(&format!("new{i}"), &random_vector(&mut rng, 8));
        }

        for vector in &vectors {
            for hit in index.search(vector, 30) {
                assert!(!removed.contains(&hit.id));
            }
        }
        let max_layer = index.stats().max_layer;
        let ids: Vec<String> = index.ids().map(str::to_string).collect();
        for id in &ids {
            for layer in 0..=max_layer {
                if let Some(neighbors) = index.neighbors(id, layer) {
                    assert!(neighbors.iter().all(|n| !removed.contains(n)));
                }
            }
        }
        assert!(removed.iter().all(|id| !index.contains(id)));
    }

    #[test]
    fn test_seeded_indices_are_identical() {
        let mut rng = StdRng::seed_from_u64(8);
        let vectors: Vec<Vec<f32>> = (0..200).map(|_| random_vector(&mut rng, 12)).collect();

        let build = || {
            let mut index = SimilarityIndex::with_seed(small_index_config(12), 42);
            for (i, vector) in vectors.iter().enumerate() {
                index.add(&format!("v{i}"), vector);
            }
            index
        };
        let first = build();
        let second = build();

        assert_eq!(first.stats(), second.stats());
        assert_eq!(first.search(&vectors[17], 10), second.search(&vectors[17], 10));
    }
}

#[cfg(test)]
mod scoring_tests {
    use super::*;
    use muse_engine::features::AudioFeatures;
    use muse_engine::profile::{DislikeReason, Preference, UserProfile};
    use muse_engine::scoring::{RadioSeed, ScoringConfig, ScoringEngine};
    use muse_engine::scoring::seed::seed_relevance;
    use std::collections::HashSet;

    const ALL_REASONS: [DislikeReason; 7] = [
        DislikeReason::NotMyTaste,
        DislikeReason::TooRepetitive,
        DislikeReason::WrongMood,
        DislikeReason::BadQuality,
        DislikeReason::DislikeArtist,
        DislikeReason::DislikeGenre,
        DislikeReason::Other,
    ];

    fn preference(score: f64) -> Preference {
        Preference {
            score,
            play_count: 10,
            total_listen_time_ms: 0,
            like_count: 0,
            dislike_count: 0,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn test_known_artist_outranks_unknown_artist() {
        let mut profile = UserProfile::default();
        profile.artist_preferences.insert("x".to_string(), preference(80.0));
        profile.genre_preferences.insert("pop".to_string(), preference(60.0));

        let engine = ScoringEngine::default();
        let context = ScoringContext::now();
        let favourite = Track::new("fav", "Hit").with_artist("x", "X").with_genre("pop");
        let stranger = Track::new("new", "Hit").with_artist("nobody", "Nobody").with_genre("pop");

        let favourite = engine.rule_score(&favourite, &profile, &context);
        let stranger = engine.rule_score(&stranger, &profile, &context);
        assert!(favourite.value > stranger.value);
        assert!(favourite.factor("artist").is_some());
    }

    #[test]
    fn test_disliked_scores_below_neutral_for_every_reason_combination() {
        let engine = ScoringEngine::default();
        let context = ScoringContext::now();
        let neutral_track = Track::new("neutral", "Neutral");
        let neutral = engine
            .rule_score(&neutral_track, &UserProfile::default(), &context)
            .value;

        for mask in 0u32..(1 << ALL_REASONS.len()) {
            let reasons: HashSet<DislikeReason> = ALL_REASONS
                .iter()
                .enumerate()
                .filter(|(bit, _)| mask & (1 << bit) != 0)
                .map(|(_, reason)| *reason)
                .collect();

            for age_days in [0, 45, 3650] {
                let mut profile = UserProfile::default();
                let track = Track::new("bad", "Bad").with_artist("b", "B");
                profile.record_dislike(
                    &track,
                    reasons.clone(),
                    context.now - ChronoDuration::days(age_days),
                );
                let score = engine.rule_score(&track, &profile, &context);
                assert!(score.disliked);
                assert!(
                    score.value < neutral && score.value < 50.0,
                    "{reasons:?} after {age_days} days scored {}",
                    score.value
                );
            }
        }
    }

    #[test]
    fn test_rule_score_is_deterministic() {
        let mut profile = UserProfile::default();
        let now = Utc::now();
        let track = Track::new("t", "T")
            .with_artist("a", "A")
            .with_genre("jazz")
            .with_duration_ms(200_000);
        profile.record_listen(&track, 200_000, now - ChronoDuration::days(2));
        profile.record_like(&track, now - ChronoDuration::days(1));

        let engine = ScoringEngine::default();
        let context = ScoringContext::at(now);
        let first = engine.rule_score(&track, &profile, &context);
        let second = engine.rule_score(&track, &profile, &context);
        assert_eq!(first, second);
    }

    #[test]
    fn test_seed_audio_match_beats_artist_only_match() {
        let config = ScoringConfig::default();
        let seed_features = AudioFeatures {
            tempo: Some(120.0),
            key: Some(0),
            energy: Some(0.7),
            valence: Some(0.6),
            ..AudioFeatures::default()
        };
        let seed_track = Track::new("seed", "Seed").with_artist("x", "X").with_genre("house");
        let seed = RadioSeed::from_track(&seed_track, Some(seed_features.clone()));

        let candidate = Track::new("c", "C").with_artist("x", "X").with_genre("house");
        let with_audio = seed_relevance(&config, &seed, &candidate, Some(&seed_features));
        let without_audio = seed_relevance(&config, &seed, &candidate, None);
        assert!(with_audio > without_audio);

        let artist_seed = RadioSeed::artist("x", "X").with_features(seed_features.clone());
        assert!(
            seed_relevance(&config, &artist_seed, &candidate, Some(&seed_features))
                > seed_relevance(&config, &artist_seed, &candidate, None)
        );
    }
}

#[cfg(test)]
mod generation_tests {
    use super::*;
    use muse_engine::generator::{select_diverse, GenerationMethod};
    use muse_engine::profile::UserProfile;
    use muse_engine::scoring::{ScoredTrack, ScoringEngine};
    use std::collections::HashMap;

    fn engine_for(tracks: Vec<Track>, dimension: usize) -> Engine {
        let config = EngineConfig {
            index: IndexConfig {
                dimension,
                min_ready_size: 5,
                ..IndexConfig::default()
            },
            ..EngineConfig::default()
        };
        Engine::with_seed(config, Arc::new(JsonCatalog::from_tracks(tracks)), 17)
    }

    fn per_artist(tracks: &[ScoredTrack]) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for item in tracks {
            if let Some(artist) = item.track.primary_artist() {
                *counts.entry(artist.to_string()).or_insert(0) += 1;
            }
        }
        counts
    }

    #[test]
    fn test_diversity_caps_dominant_artist_and_backfills() {
        let engine = ScoringEngine::default();
        let profile = UserProfile::default();
        let context = ScoringContext::now();

        let mut ranked: Vec<ScoredTrack> = (0..100)
            .map(|i| Track::new(format!("mono{i}"), "x").with_artist("mono", "Mono"))
            .chain((0..20).map(|i| Track::new(format!("other{i}"), "x").with_artist(format!("o{i}"), "O")))
            .map(|track| {
                let mut breakdown = engine.rule_score(&track, &profile, &context);
                if track.has_artist("mono") {
                    breakdown.add("boost", 30.0);
                }
                ScoredTrack {
                    track,
                    features: None,
                    similarity: None,
                    breakdown,
                }
            })
            .collect();
        muse_engine::scoring::sort_by_score(&mut ranked);

        let picked = select_diverse(ranked, 10, 4);
        assert_eq!(picked.len(), 10);
        assert_eq!(per_artist(&picked)["mono"], 4);
    }

    #[tokio::test]
    async fn test_generated_playlists_respect_artist_cap() {
        let mut engine = engine_for(catalog_tracks(5, 10, 8), 8);
        let tracks = catalog_tracks(5, 10, 8);
        assert_eq!(engine.index(&tracks).await, 50);

        for method in [
            GenerationMethod::Personalized,
            GenerationMethod::Discovery,
            GenerationMethod::Genre {
                genre: "rock".to_string(),
            },
            GenerationMethod::Similar {
                track_id: "a0t0".to_string(),
            },
        ] {
            let playlist = engine.generate(method.clone(), 10).await;
            assert!(!playlist.is_empty(), "{method} produced nothing");
            assert!(playlist.tracks.len() <= 10);
            let max_per_artist = engine.config().generator.max_per_artist;
            assert!(per_artist(&playlist.tracks).values().all(|&n| n <= max_per_artist));
        }
    }

    #[tokio::test]
    async fn test_later_requests_make_earlier_ones_stale() {
        let engine = engine_for(catalog_tracks(2, 3, 4), 4);
        let first = engine.generate(GenerationMethod::Personalized, 3).await;
        let second = engine.generate(GenerationMethod::Personalized, 3).await;
        assert!(engine.is_stale(first.request_id));
        assert!(!engine.is_stale(second.request_id));
    }

    #[tokio::test]
    async fn test_cold_index_falls_back_to_catalog() {
        let engine = engine_for(catalog_tracks(3, 4, 4), 4);
        let playlist = engine
            .generate(
                GenerationMethod::Genre {
                    genre: "pop".to_string(),
                },
                5,
            )
            .await;
        assert!(!playlist.is_empty());
        assert!(playlist.tracks.iter().all(|s| s.track.has_genre("pop")));
    }
}

#[cfg(test)]
mod feedback_tests {
    use super::*;
    use muse_engine::generator::GenerationMethod;
    use muse_engine::profile::DislikeReason;
    use std::collections::HashSet;

    fn engine_for(tracks: Vec<Track>) -> Engine {
        let config = EngineConfig {
            index: small_index_config(4),
            ..EngineConfig::default()
        };
        Engine::with_seed(config, Arc::new(JsonCatalog::from_tracks(tracks)), 23)
    }

    #[test]
    fn test_skip_lowers_artist_preference() {
        let tracks = catalog_tracks(2, 2, 4);
        let mut engine = engine_for(tracks.clone());
        let now = Utc::now();
        assert_eq!(engine.profile().artist_score("artist0", now), 0.0);

        engine.record_skip(&tracks[0], now);
        assert!(engine.profile().artist_score("artist0", now) < 0.0);
        assert!(engine.profile().genre_score("rock", now) < 0.0);
        assert_eq!(engine.profile().total_skips, 1);
    }

    #[test]
    fn test_reorder_direction_sets_preference_sign() {
        let tracks = catalog_tracks(2, 2, 4);
        let mut engine = engine_for(tracks.clone());
        let now = Utc::now();

        engine.record_reorder(&tracks[0], 5, 0, now);
        assert!(engine.profile().artist_score("artist0", now) > 0.0);

        engine.record_reorder(&tracks[2], 0, 5, now);
        assert!(engine.profile().artist_score("artist1", now) < 0.0);

        engine.record_reorder(&tracks[3], 2, 2, now);
        assert_eq!(engine.profile().reorder_history.len(), 2);
    }

    #[tokio::test]
    async fn test_removed_dislike_returns_track_to_playlists() {
        let tracks = catalog_tracks(3, 4, 4);
        let mut engine = engine_for(tracks.clone());
        let rock = || GenerationMethod::Genre {
            genre: "rock".to_string(),
        };
        let target = &tracks[0];
        assert!(target.has_genre("rock"));

        let reasons: HashSet<DislikeReason> = [DislikeReason::WrongMood].into_iter().collect();
        engine.record_dislike(target, reasons, Utc::now());
        let playlist = engine.generate(rock(), 10).await;
        assert!(!playlist.is_empty());
        assert!(!playlist.track_ids().contains(&target.id.as_str()));

        assert!(engine.remove_dislike(&target.id));
        assert!(!engine.remove_dislike(&target.id));
        let playlist = engine.generate(rock(), 10).await;
        assert!(playlist.track_ids().contains(&target.id.as_str()));
    }
}

#[cfg(test)]
mod aggregator_tests {
    use async_trait::async_trait;
    use muse_engine::error::EngineError;
    use muse_engine::features::{
        AggregatorConfig, AudioFeatures, Capabilities, FeatureAggregator, FeatureProvider,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct SlowAnalyzer {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FeatureProvider for SlowAnalyzer {
        fn id(&self) -> &str {
            "slow"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::AUDIO
        }

        async fn audio_features(&self, _track_id: &str) -> Result<Option<AudioFeatures>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Some(AudioFeatures {
                tempo: Some(128.0),
                ..AudioFeatures::default()
            }))
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fan_out() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut aggregator = FeatureAggregator::new(AggregatorConfig::default());
        aggregator.register(Arc::new(SlowAnalyzer {
            calls: Arc::clone(&calls),
        }));

        let (first, second) = tokio::join!(aggregator.get("fresh"), aggregator.get("fresh"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(aggregator.fan_out_count(), 1);
        assert_eq!(first, second);
        assert_eq!(first.audio.and_then(|a| a.tempo), Some(128.0));
    }
}

#[cfg(test)]
mod radio_tests {
    use super::*;
    use muse_engine::radio::{QueueMode, QueueState};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_empty_refills_back_off() {
        let mut engine = Engine::with_seed(
            EngineConfig::default(),
            Arc::new(JsonCatalog::from_tracks(Vec::new())),
            1,
        );
        engine.enable_auto_queue();
        assert_eq!(engine.mode(), &QueueMode::AutoQueue);

        let now = Instant::now();
        let refill = engine
            .replenish_at(&QueueState::default(), now, Utc::now())
            .await;
        assert!(refill.is_empty());
        assert_eq!(refill.retry_after, Some(Duration::from_secs(20)));
        assert_eq!(engine.controller().consecutive_failures(), 1);

        engine.stop();
        assert_eq!(engine.mode(), &QueueMode::Manual);
    }

    #[tokio::test]
    async fn test_auto_queue_follows_session() {
        let tracks = catalog_tracks(4, 5, 6);
        let config = EngineConfig {
            index: IndexConfig {
                dimension: 6,
                min_ready_size: 5,
                ..IndexConfig::default()
            },
            ..EngineConfig::default()
        };
        let mut engine =
            Engine::with_seed(config, Arc::new(JsonCatalog::from_tracks(tracks.clone())), 4);
        engine.index(&tracks).await;
        engine.enable_auto_queue();

        let played = &tracks[0];
        engine.record_listen(played, 180_000, Utc::now()).await;

        let refill = engine
            .replenish_at(&QueueState::new(vec!["a1t1".to_string()]), Instant::now(), Utc::now())
            .await;
        assert!(!refill.is_empty());
        assert!(refill.tracks.len() <= 10);
        assert!(refill
            .tracks
            .iter()
            .all(|s| s.track.id != played.id && s.track.id != "a1t1"));
        // The session's last artist never opens the refill.
        assert_ne!(refill.tracks[0].track.primary_artist(), played.primary_artist());
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    fn muse_engine() -> Command {
        Command::new(env!("CARGO_BIN_EXE_muse-engine"))
    }

    #[test]
    fn test_cli_help_displays_correctly() {
        let output = muse_engine()
            .arg("--help")
            .output()
            .expect("Failed to run help command");

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("muse-engine"));
        assert!(stdout.contains("generate"));
        assert!(stdout.contains("radio"));
        assert!(stdout.contains("dislike"));
    }

    #[test]
    fn test_completion_generation() {
        let output = muse_engine()
            .args(["completion", "bash"])
            .output()
            .expect("Failed to run completion command");

        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("muse-engine"));
        assert!(stdout.contains("complete"));
    }

    #[test]
    fn test_generate_and_feedback_round_trip() -> Result<()> {
        let tracks = catalog_tracks(3, 4, 128);
        let (dir, catalog) = create_test_catalog(&tracks)?;
        let profile = dir.path().join("profile.json");

        let output = muse_engine()
            .arg("--profile")
            .arg(&profile)
            .args(["generate", "genre", "--genre", "rock", "--limit", "3", "--catalog"])
            .arg(&catalog)
            .output()?;
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
        assert!(String::from_utf8_lossy(&output.stdout).contains("genre:rock"));

        let output = muse_engine()
            .arg("--profile")
            .arg(&profile)
            .args(["dislike", "a0t0", "--reason", "wrong-mood", "--catalog"])
            .arg(&catalog)
            .output()?;
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
        assert!(profile.exists());

        let output = muse_engine()
            .arg("--profile")
            .arg(&profile)
            .args(["score", "a0t0", "--catalog"])
            .arg(&catalog)
            .output()?;
        assert!(String::from_utf8_lossy(&output.stdout).contains("Disliked"));
        Ok(())
    }
}
