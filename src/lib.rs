//! On-device recommendation and playlist engine.
//!
//! Core modules:
//! - [`index`] - Approximate nearest-neighbor search over track embeddings
//! - [`features`] - Feature aggregation across pluggable providers
//! - [`scoring`] - Rule-based, model-blended and seed-aware track scoring
//! - [`generator`] - Playlist generation methods
//! - [`radio`] - Auto-queue and radio refill controller
//! - [`engine`] - The context object tying everything together
//!
//! ### Supporting Modules
//!
//! - [`profile`] - Learned preferences, listen history and persistence
//! - [`catalog`] - Catalog access behind timeouts
//! - [`model`] - Trained-model service interface
//! - [`config`] - Configuration and data directory management
//! - [`cli`] - Command-line interface definitions with clap integration
//! - [`completion`] - Shell completion generation
//!
//! ## Quick Start Example
//!
//! ```no_run
//! use muse_engine::catalog::JsonCatalog;
//! use muse_engine::config::EngineConfig;
//! use muse_engine::engine::Engine;
//! use muse_engine::generator::GenerationMethod;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let catalog = Arc::new(JsonCatalog::load(Path::new("library.json"))?);
//! let mut engine = Engine::new(EngineConfig::load_or_default()?, catalog.clone());
//! engine.index(catalog.tracks()).await;
//!
//! let playlist = engine
//!     .generate(GenerationMethod::Mood { mood: "chill".into() }, 20)
//!     .await;
//! for item in &playlist.tracks {
//!     println!("{:6.1}  {}", item.score(), item.track.display_name());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Scoring
//!
//! Every candidate starts from a neutral 50 and collects named factors:
//! artist and genre preference, time-of-day affinity, duration fit, recency
//! and freshness. A trained model, when present, is blended in with a weight
//! that grows with each training cycle. Batch adjustments then reward novelty
//! or familiarity (depending on exploration), serendipitous similarity and
//! smooth harmonic flow, and penalize repeated artists. Disliked tracks always
//! score below the normal range.
//!
//! ## Error Handling
//!
//! Recommendation paths never fail: slow or broken providers, a cold index
//! and a missing model all degrade to smaller or rule-based results. Fallible
//! I/O (configuration, catalog files, profile stores) returns
//! `anyhow::Result` with context.

pub mod catalog;
pub mod cli;
pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod generator;
pub mod index;
pub mod model;
pub mod profile;
pub mod radio;
pub mod scoring;
pub mod track;
