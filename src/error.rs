//! # Error Taxonomy
//!
//! Every failure inside the engine degrades to a smaller, correct result rather
//! than aborting the playback path. These variants exist so that degradations
//! can be logged and explained, not so that callers have to handle them.
//!
//! - **Provider errors** are treated as "no data" by the feature aggregator.
//! - **Index not ready** makes the generator fall back to catalog candidates.
//! - **Model unavailable** makes scoring fall back to the rule-based score.
//! - **No candidates** surfaces as an empty list.

use thiserror::Error;

/// Errors raised by engine collaborators.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("Provider '{provider}' timed out")]
    ProviderTimeout { provider: String },

    #[error("Provider '{provider}' failed: {message}")]
    ProviderFailure { provider: String, message: String },

    #[error("Similarity index not ready ({size} of {required} vectors)")]
    IndexNotReady { size: usize, required: usize },

    #[error("Prediction model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("No candidates available")]
    NoCandidates,

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Shorthand for a provider failure with a displayable cause.
    pub fn provider(provider: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::ProviderFailure {
            provider: provider.into(),
            message: message.to_string(),
        }
    }

    /// Whether the error should be read as "this source had no data".
    #[must_use]
    pub const fn is_no_data(&self) -> bool {
        matches!(
            self,
            Self::ProviderTimeout { .. } | Self::ProviderFailure { .. } | Self::NoCandidates
        )
    }
}
