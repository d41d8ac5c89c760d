//! # Command-Line Interface Module
//!
//! Command-line interface for the engine, defined with Clap derive macros.
//! Every command works on a JSON catalog file (an array of tracks) and the
//! persisted user profile.
//!
//! ## Commands
//!
//! - `generate`: Build a playlist with one of the generation methods
//! - `score`: Explain the score of a single track
//! - `radio`: Preview the first refill of a track radio
//! - `listen`: Record a playback in the profile
//! - `dislike`: Record a dislike in the profile
//! - `stats`: Show profile and index statistics
//! - `completion`: Generate shell completion scripts
//!
//! ## Examples
//!
//! ```bash
//! muse-engine generate mood --mood chill --catalog library.json
//! muse-engine radio --catalog library.json --seed-track t42 --count 15
//! muse-engine dislike t42 --reason wrong-mood
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Shell types supported for completion generation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

/// Playlist generation methods selectable from the command line.
#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum Method {
    /// Based on learned preferences (needs no seed)
    Personalized,
    /// Tracks matching a mood keyword (needs --mood)
    Mood,
    /// Tracks of one genre (needs --genre)
    Genre,
    /// Tracks around an artist (needs --artist)
    Artist,
    /// Unfamiliar tracks, skipping recent and liked ones
    Discovery,
    /// Tracks close to a seed track (needs --track)
    Similar,
}

/// Main application arguments structure.
#[derive(Parser)]
#[command(name = "muse-engine")]
#[command(about = "Muse engine: on-device recommendations, similarity search & radio queues")]
#[command(version)]
pub struct Args {
    /// Engine configuration file (TOML)
    ///
    /// Defaults to engine.toml in the platform config directory; missing
    /// keys fall back to built-in defaults.
    #[arg(long, global = true, env = "MUSE_ENGINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Store the profile in this JSON file instead of the default database
    #[arg(long, global = true, env = "MUSE_ENGINE_PROFILE")]
    pub profile: Option<PathBuf>,

    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Enumeration of all available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Generate a playlist
    ///
    /// Candidates come from the similarity index when it holds enough
    /// embeddings, otherwise from the catalog. Results are scored against
    /// the profile and capped per artist.
    Generate {
        /// Generation method
        method: Method,

        /// Catalog file (JSON array of tracks)
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        catalog: PathBuf,

        /// Mood keyword for `mood` (happy, sad, energetic, calm, focus, ...)
        #[arg(long)]
        mood: Option<String>,

        /// Genre for `genre`
        #[arg(long)]
        genre: Option<String>,

        /// Artist id for `artist`
        #[arg(long)]
        artist: Option<String>,

        /// Seed track id for `similar`
        #[arg(long)]
        track: Option<String>,

        /// Number of tracks
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Show the score factors of every track
        #[arg(short, long)]
        verbose: bool,
    },

    /// Score one track and list the factors behind it
    Score {
        /// Track id
        track_id: String,

        /// Catalog file (JSON array of tracks)
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        catalog: PathBuf,
    },

    /// Start a radio from a seed track and show the first refill
    Radio {
        /// Catalog file (JSON array of tracks)
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        catalog: PathBuf,

        /// Seed track id
        #[arg(long)]
        seed_track: String,

        /// Number of tracks to show
        #[arg(short, long, default_value = "10")]
        count: usize,
    },

    /// Record that a track was played for some time
    ///
    /// Listens of at least 80% count as completed, under 30 seconds as skips.
    Listen {
        /// Track id
        track_id: String,

        /// Catalog file (JSON array of tracks)
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        catalog: PathBuf,

        /// Milliseconds listened
        #[arg(long)]
        ms: u64,
    },

    /// Record a dislike for a track
    Dislike {
        /// Track id
        track_id: String,

        /// Reason: not-my-taste, too-repetitive, wrong-mood, bad-quality,
        /// dislike-artist, dislike-genre or other. Repeatable.
        #[arg(long, required = true)]
        reason: Vec<String>,

        /// Catalog file, to record the track's artists and genres
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        catalog: Option<PathBuf>,
    },

    /// Show profile and index statistics
    Stats {
        /// Catalog file (JSON array of tracks)
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        catalog: PathBuf,
    },

    /// Generate shell completions
    ///
    /// Usage: muse-engine completion bash > ~/.local/share/bash-completion/completions/muse-engine
    Completion {
        /// Shell to generate completions for
        shell: Shell,
    },

    /// List track ids of a catalog for completion (hidden command)
    #[command(hide = true)]
    CompleteTracks {
        #[arg(long)]
        catalog: PathBuf,
    },
}
