//! Batch-level score adjustments.

use std::collections::{HashMap, HashSet};

use crate::profile::{UserProfile, SCORE_MAX};

use super::{harmony, sort_by_score, ScoredTrack, ScoringConfig, ScoringContext};

pub(super) fn adjust_batch(
    config: &ScoringConfig,
    batch: &mut [ScoredTrack],
    profile: &UserProfile,
    context: &ScoringContext,
) {
    let session_genres: HashSet<&str> = context.session_genres.iter().map(String::as_str).collect();

    for item in batch.iter_mut() {
        if item.breakdown.disliked {
            continue;
        }
        let exploration = exploration_adjustment(config, item, profile, context, &session_genres);
        item.breakdown.add("exploration", exploration);

        if let Some(similarity) = item.similarity {
            if (config.serendipity_min_similarity..=config.serendipity_max_similarity)
                .contains(&similarity)
            {
                item.breakdown.add("serendipity", config.serendipity_boost);
            }
        }

        if let Some(features) = &item.features {
            if let Some(flow) = harmony::flow_score(features, &context.recent_features) {
                item.breakdown
                    .add("flow", (flow - 0.5) * SCORE_MAX * config.flow_weight);
            }
        }
    }

    sort_by_score(batch);
    apply_diversity_penalty(config, batch);
    for item in batch.iter_mut() {
        item.breakdown.clamp_non_disliked();
    }
    sort_by_score(batch);
}

/// Novel items gain with high exploration, familiar favourites with low.
fn exploration_adjustment(
    config: &ScoringConfig,
    item: &ScoredTrack,
    profile: &UserProfile,
    context: &ScoringContext,
    session_genres: &HashSet<&str>,
) -> f64 {
    let track = &item.track;
    let mut signals = 0usize;
    let mut novel = 0usize;
    for artist in &track.artist_ids {
        signals += 1;
        if !profile.is_known_artist(artist) {
            novel += 1;
        }
    }
    for genre in &track.genres {
        signals += 1;
        if !profile.is_known_genre(genre) || !session_genres.contains(genre.as_str()) {
            novel += 1;
        }
    }
    if signals == 0 {
        return 0.0;
    }
    let novelty = novel as f64 / signals as f64;

    let familiarity = track
        .artist_ids
        .iter()
        .map(|a| profile.artist_score(a, context.now))
        .fold(0.0, f64::max)
        / SCORE_MAX;

    let exploration = context.exploration.clamp(0.0, 1.0);
    config.exploration_bonus * (exploration * novelty + (1.0 - exploration) * familiarity)
}

/// Penalize every item past the `max_per_artist`-th by the same primary artist.
fn apply_diversity_penalty(config: &ScoringConfig, batch: &mut [ScoredTrack]) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for item in batch.iter_mut() {
        let Some(artist) = item.track.primary_artist() else {
            continue;
        };
        let count = seen.entry(artist.to_string()).or_insert(0);
        *count += 1;
        if *count > config.max_per_artist {
            let excess = (*count - config.max_per_artist) as f64;
            item.breakdown
                .add("diversity", -config.diversity_penalty * excess);
        }
    }
}
