//! Rule-based affinity scoring.

use crate::profile::{decay_factor, UserProfile};
use crate::track::Track;

use super::{ScoreBreakdown, ScoringConfig, ScoringContext, DISLIKED_CEILING};

pub(super) fn rule_score(
    config: &ScoringConfig,
    track: &Track,
    profile: &UserProfile,
    context: &ScoringContext,
) -> ScoreBreakdown {
    if let Some(disliked) = profile.disliked(&track.id) {
        let mut breakdown = ScoreBreakdown::new(&track.id, 0.0);
        breakdown.disliked = true;
        let penalty = config.dislike_penalty
            * disliked.reason_multiplier()
            * decay_factor(disliked.timestamp, context.now, config.dislike_half_life_days);
        breakdown.add("dislike", -penalty);
        // Decay may shrink the penalty but never lift the track above a
        // non-disliked one.
        if breakdown.value > DISLIKED_CEILING {
            breakdown.add("dislike_floor", DISLIKED_CEILING - breakdown.value);
        }
        return breakdown;
    }

    let now = context.now;
    let mut breakdown = ScoreBreakdown::new(&track.id, config.neutral_score);

    if let Some(mean) = mean(track.artist_ids.iter().map(|a| profile.artist_score(a, now))) {
        breakdown.add("artist", mean * config.artist_weight);
    }
    if let Some(mean) = mean(track.genres.iter().map(|g| profile.genre_score(g, now))) {
        breakdown.add("genre", mean * config.genre_weight);
    }

    if !track.genres.is_empty() {
        if let Some(affinity) = profile.hour_genre_affinity(context.hour, &track.genres) {
            breakdown.add("time_of_day", affinity * config.time_of_day_bonus);
        }
    }

    if let (Some(duration), Some((low, high))) =
        (track.duration_ms, profile.preferred_duration_range())
    {
        if (low..=high).contains(&duration) {
            breakdown.add("duration", config.duration_bonus);
        }
    }

    match profile.last_played(&track.id) {
        Some(at) => {
            let elapsed = now - at;
            let penalty = if elapsed < chrono::Duration::hours(1) {
                config.recency_penalty_hour
            } else if elapsed < chrono::Duration::hours(24) {
                config.recency_penalty_day
            } else if elapsed < chrono::Duration::hours(72) {
                config.recency_penalty_three_days
            } else {
                0.0
            };
            breakdown.add("recency", -penalty);
        }
        None => breakdown.add("freshness", config.freshness_bonus),
    }

    breakdown.clamp_non_disliked();
    breakdown
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{DislikeReason, SCORE_MIN};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::collections::HashSet;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 20, 0, 0).unwrap()
    }

    fn score(track: &Track, profile: &UserProfile) -> ScoreBreakdown {
        rule_score(
            &ScoringConfig::default(),
            track,
            profile,
            &ScoringContext::at(now()),
        )
    }

    fn pop_by(artist: &str, id: &str) -> Track {
        Track::new(id, "Song")
            .with_artist(artist, artist)
            .with_genre("pop")
    }

    #[test]
    fn test_unknown_track_scores_neutral_plus_freshness() {
        let breakdown = score(&Track::new("t", "x"), &UserProfile::default());
        assert_eq!(breakdown.value, 55.0);
        assert_eq!(breakdown.factor("freshness"), Some(5.0));
    }

    #[test]
    fn test_known_artist_outranks_unknown_artist() {
        let mut profile = UserProfile::default();
        for _ in 0..16 {
            profile.record_like(&pop_by("x", "seed"), now());
            profile.remove_like("seed");
        }
        assert_eq!(profile.artist_score("x", now()), 80.0);

        let favourite = score(&pop_by("x", "t1"), &profile);
        let stranger = score(&pop_by("y", "t2"), &profile);
        assert!(favourite.value > stranger.value);
        assert!((favourite.factor("artist").unwrap() - 24.0).abs() < 1e-9);
    }

    #[test]
    fn test_recency_penalty_tiers() {
        let track = Track::new("t", "x");
        let expectations = [
            (Duration::minutes(10), -30.0),
            (Duration::hours(5), -15.0),
            (Duration::hours(48), -5.0),
        ];
        for (ago, expected) in expectations {
            let mut profile = UserProfile::default();
            profile.last_played.insert("t".into(), now() - ago);
            assert_eq!(score(&track, &profile).factor("recency"), Some(expected));
        }

        let mut profile = UserProfile::default();
        profile.last_played.insert("t".into(), now() - Duration::days(10));
        let breakdown = score(&track, &profile);
        assert_eq!(breakdown.factor("recency"), None);
        assert_eq!(breakdown.factor("freshness"), None);
    }

    #[test]
    fn test_disliked_is_below_every_baseline() {
        let track = pop_by("x", "t1");
        let mut profile = UserProfile::default();
        let reasons: HashSet<_> = [DislikeReason::WrongMood].into_iter().collect();
        profile.record_dislike(&track, reasons, now() - Duration::days(365));

        let breakdown = score(&track, &profile);
        assert!(breakdown.disliked);
        assert!(breakdown.value < SCORE_MIN);
    }

    #[test]
    fn test_fresh_dislike_carries_full_penalty() {
        let track = Track::new("t", "x");
        let mut profile = UserProfile::default();
        let reasons: HashSet<_> = [DislikeReason::DislikeArtist].into_iter().collect();
        profile.record_dislike(&track, reasons, now());
        assert_eq!(score(&track, &profile).value, -300.0);
    }

    #[test]
    fn test_duration_and_hour_bonuses() {
        let mut profile = UserProfile::default();
        let at_eight = now();
        for i in 0..5 {
            let t = Track::new(format!("h{i}"), "x")
                .with_genre("jazz")
                .with_duration_ms(200_000);
            profile.record_listen(&t, 200_000, at_eight);
        }

        let candidate = Track::new("c", "x")
            .with_genre("jazz")
            .with_duration_ms(210_000);
        let breakdown = score(&candidate, &profile);
        assert_eq!(breakdown.factor("time_of_day"), Some(10.0));
        assert_eq!(breakdown.factor("duration"), Some(5.0));
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let mut profile = UserProfile::default();
        profile.record_listen(&pop_by("x", "a"), 0, now());
        let track = pop_by("x", "b");
        assert_eq!(score(&track, &profile), score(&track, &profile));
    }
}
