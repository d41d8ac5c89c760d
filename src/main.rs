//! # Muse Engine
//!
//! Command-line front end for the recommendation engine. Every command loads
//! a JSON catalog, indexes the embeddings it carries and works against the
//! persisted user profile.
//!
//! ## Usage
//!
//! ```bash
//! # Playlists
//! muse-engine generate personalized --catalog library.json
//! muse-engine generate similar --track t42 --catalog library.json --limit 10
//!
//! # Radio preview
//! muse-engine radio --catalog library.json --seed-track t42
//!
//! # Feedback
//! muse-engine listen t42 --catalog library.json --ms 180000
//! muse-engine dislike t42 --reason wrong-mood
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{CommandFactory, Parser};
use log::{debug, info};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use muse_engine::catalog::JsonCatalog;
use muse_engine::cli::{self, Method};
use muse_engine::completion;
use muse_engine::config::{self, EngineConfig};
use muse_engine::engine::Engine;
use muse_engine::generator::GenerationMethod;
use muse_engine::profile::{
    DislikeReason, JsonProfileStore, ProfileStore, SqliteProfileStore, UserProfile,
};
use muse_engine::radio::QueueState;
use muse_engine::scoring::{ScoreBreakdown, ScoredTrack, ScoringContext};
use muse_engine::track::Track;

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::load_or_default(),
    }
}

/// JSON file when a path is given, the SQLite profile database otherwise.
fn open_store(path: Option<&Path>) -> Result<Box<dyn ProfileStore>> {
    match path {
        Some(path) => Ok(Box::new(JsonProfileStore::new(path))),
        None => {
            let db_path = config::get_profile_db_path()?;
            debug!("Using profile database {}", db_path.display());
            Ok(Box::new(SqliteProfileStore::open(db_path)?))
        }
    }
}

async fn open_engine(
    config: EngineConfig,
    catalog: &Arc<JsonCatalog>,
    profile: UserProfile,
) -> Engine {
    let mut engine = Engine::new(config, catalog.clone()).with_profile(profile);
    let indexed = engine.index(catalog.tracks()).await;
    debug!("Indexed {indexed} of {} catalog tracks", catalog.len());
    engine
}

fn find_track(catalog: &JsonCatalog, id: &str) -> Result<Track> {
    catalog
        .get(id)
        .cloned()
        .with_context(|| format!("Track '{id}' is not in the catalog"))
}

fn generation_method(
    method: Method,
    mood: Option<String>,
    genre: Option<String>,
    artist: Option<String>,
    track: Option<String>,
) -> Result<GenerationMethod> {
    Ok(match method {
        Method::Personalized => GenerationMethod::Personalized,
        Method::Discovery => GenerationMethod::Discovery,
        Method::Mood => GenerationMethod::Mood {
            mood: mood.context("The mood method needs --mood")?,
        },
        Method::Genre => GenerationMethod::Genre {
            genre: genre.context("The genre method needs --genre")?,
        },
        Method::Artist => GenerationMethod::ArtistRadio {
            artist_id: artist.context("The artist method needs --artist")?,
        },
        Method::Similar => GenerationMethod::Similar {
            track_id: track.context("The similar method needs --track")?,
        },
    })
}

fn print_tracks(tracks: &[ScoredTrack], verbose: bool) {
    for (i, item) in tracks.iter().enumerate() {
        println!("  {:2}. {} ({:.1})", i + 1, item.track.display_name(), item.score());
        if verbose {
            print_factors(&item.breakdown, "        ");
        }
    }
}

fn print_factors(breakdown: &ScoreBreakdown, indent: &str) {
    for factor in &breakdown.factors {
        println!("{indent}{:<12} {:+.2}", factor.name, factor.value);
    }
    if let Some(prediction) = breakdown.model_prediction {
        println!("{indent}{:<12} {prediction:.3}", "prediction");
    }
}

/// Main entry point.
///
/// Logging is controlled via `RUST_LOG`:
/// - `RUST_LOG=debug muse-engine generate ...` - Enable debug logging
/// - `RUST_LOG=muse_engine::features=trace muse-engine ...` - Module-specific logging
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = cli::Args::parse();
    let config_path = args.config.as_deref();
    let profile_path = args.profile.as_deref();

    match args.command {
        cli::Command::Generate {
            method,
            catalog,
            mood,
            genre,
            artist,
            track,
            limit,
            verbose,
        } => {
            let method = generation_method(method, mood, genre, artist, track)?;
            let profile = open_store(profile_path)?.load_or_default()?;
            let catalog = Arc::new(JsonCatalog::load(&catalog)?);
            let engine = open_engine(load_config(config_path)?, &catalog, profile).await;

            info!("Generating {method} playlist of {limit} tracks");
            let playlist = engine.generate(method, limit).await;
            if playlist.is_empty() {
                println!("⏸️  No candidates found, try another seed or add tracks");
                return Ok(());
            }
            println!("🎵 {} ({} tracks, {:?} candidates)", playlist.method, playlist.tracks.len(), playlist.source);
            print_tracks(&playlist.tracks, verbose);
        }
        cli::Command::Score { track_id, catalog } => {
            let profile = open_store(profile_path)?.load_or_default()?;
            let catalog = Arc::new(JsonCatalog::load(&catalog)?);
            let track = find_track(&catalog, &track_id)?;
            let engine = open_engine(load_config(config_path)?, &catalog, profile).await;

            let breakdown = engine.score(&track, &ScoringContext::now()).await;
            println!("🎯 {}: {:.2}", track.display_name(), breakdown.value);
            if breakdown.disliked {
                println!("👎 Disliked");
            }
            print_factors(&breakdown, "  ");
        }
        cli::Command::Radio {
            catalog,
            seed_track,
            count,
        } => {
            let mut config = load_config(config_path)?;
            config.radio.batch_size = count.max(1);
            let profile = open_store(profile_path)?.load_or_default()?;
            let catalog = Arc::new(JsonCatalog::load(&catalog)?);
            let seed = find_track(&catalog, &seed_track)?;
            let mut engine = open_engine(config, &catalog, profile).await;

            engine.start_track_radio(&seed).await;
            let refill = engine.replenish(&QueueState::default()).await;
            if refill.is_empty() {
                println!("⏸️  Nothing to play around {}", seed.display_name());
                if let Some(wait) = refill.retry_after {
                    println!("Retry in {}s", wait.as_secs());
                }
                return Ok(());
            }
            println!("📻 Radio: {}", seed.display_name());
            print_tracks(&refill.tracks, false);
        }
        cli::Command::Listen {
            track_id,
            catalog,
            ms,
        } => {
            let store = open_store(profile_path)?;
            let mut profile = store.load_or_default()?;
            let catalog = JsonCatalog::load(&catalog)?;
            let track = find_track(&catalog, &track_id)?;

            let event = profile.record_listen(&track, ms, Utc::now());
            store.save(&profile)?;
            let outcome = if event.completed {
                "completed"
            } else if event.skipped {
                "skipped"
            } else {
                "partial"
            };
            println!("✅ Recorded {outcome} listen of {}", track.display_name());
        }
        cli::Command::Dislike {
            track_id,
            reason,
            catalog,
        } => {
            let reasons = reason
                .iter()
                .map(|r| r.parse::<DislikeReason>().map_err(anyhow::Error::msg))
                .collect::<Result<HashSet<_>>>()?;
            let track = match catalog {
                Some(path) => find_track(&JsonCatalog::load(&path)?, &track_id)?,
                None => Track::new(track_id.clone(), track_id.clone()),
            };

            let store = open_store(profile_path)?;
            let mut profile = store.load_or_default()?;
            profile.record_dislike(&track, reasons, Utc::now());
            store.save(&profile)?;
            println!("👎 Disliked {}", track.display_name());
        }
        cli::Command::Stats { catalog } => {
            let profile = open_store(profile_path)?.load_or_default()?;
            let catalog = Arc::new(JsonCatalog::load(&catalog)?);
            let engine = open_engine(load_config(config_path)?, &catalog, profile).await;
            let profile = engine.profile();
            let now = Utc::now();

            println!("📊 Profile");
            println!("═══════════");
            println!("✅ Listens: {}", profile.total_listens);
            println!("⏭️  Skips: {}", profile.total_skips);
            println!("⏱️  Listen time: {} min", profile.total_listen_time_ms / 60_000);
            println!("❤️  Liked: {}", profile.liked_tracks.len());
            println!("👎 Disliked: {}", profile.disliked.len());
            for (genre, score) in profile.top_genres(5, now) {
                println!("  genre  {genre:<20} {score:+.1}");
            }
            for (artist, score) in profile.top_artists(5, now) {
                println!("  artist {artist:<20} {score:+.1}");
            }

            let stats = engine.similarity_index().stats();
            println!();
            println!("🔗 Similarity Index");
            println!("═══════════════════");
            println!("Tracks: {} of {} in catalog", stats.len, catalog.len());
            println!("Dimension: {}", stats.dimension);
            println!("Layers: {:?}", stats.nodes_per_layer);
            println!("Mean degree: {:.1}", stats.mean_degree_layer0);
            println!(
                "Ready: {}",
                if engine.similarity_index().is_ready() { "yes" } else { "no, using catalog candidates" }
            );
        }
        cli::Command::Completion { shell } => {
            let mut cmd = cli::Args::command();
            completion::generate_completions(completion::shell_to_completion_shell(shell), &mut cmd);
        }
        cli::Command::CompleteTracks { catalog } => {
            completion::print_track_completions(&catalog)?;
        }
    }

    Ok(())
}
