//! Harmonic and rhythmic compatibility between tracks.
//!
//! Used for playlist flow (how well a candidate follows what just played) and
//! for judging a radio seed's audio fit. All scores are in `[0, 1]`.

use lazy_static::lazy_static;

use crate::features::{AudioFeatures, Mode};

lazy_static! {
    /// Position of each major key (by pitch class) on the circle of fifths.
    static ref FIFTHS_POSITION: [u8; 12] = {
        let mut positions = [0u8; 12];
        for step in 0..12u8 {
            positions[usize::from((step * 7) % 12)] = step;
        }
        positions
    };
}

/// Keys further apart than this on the circle get no credit.
const MAX_KEY_DISTANCE: u8 = 5;

fn circle_position(key: u8, mode: Option<Mode>) -> u8 {
    // Minor keys sit with their relative major.
    let major = match mode {
        Some(Mode::Minor) => (key % 12 + 3) % 12,
        _ => key % 12,
    };
    FIFTHS_POSITION[usize::from(major)]
}

/// Steps between two keys around the circle of fifths, `0..=6`.
pub fn key_distance(a: (u8, Option<Mode>), b: (u8, Option<Mode>)) -> u8 {
    let pa = circle_position(a.0, a.1);
    let pb = circle_position(b.0, b.1);
    let diff = pa.abs_diff(pb);
    diff.min(12 - diff)
}

/// Full credit for the same key, linearly less up to [`MAX_KEY_DISTANCE`].
pub fn key_compatibility(a: (u8, Option<Mode>), b: (u8, Option<Mode>)) -> f64 {
    let distance = key_distance(a, b);
    if distance >= MAX_KEY_DISTANCE {
        return 0.0;
    }
    1.0 - f64::from(distance) / f64::from(MAX_KEY_DISTANCE)
}

/// Tiered tempo match on the relative BPM difference.
pub fn tempo_compatibility(a: f64, b: f64) -> f64 {
    if a <= 0.0 || b <= 0.0 {
        return 0.0;
    }
    let relative = (a - b).abs() / a.max(b);

    if relative <= 0.10 {
        1.0
    } else if relative <= 0.20 {
        0.6
    } else if relative <= 0.30 {
        0.3
    } else {
        0.0
    }
}

/// 1.0 within `tolerance`, falling linearly to 0 over the next `falloff`.
fn closeness(a: f64, b: f64, tolerance: f64, falloff: f64) -> f64 {
    let diff = (a - b).abs();
    if diff <= tolerance {
        1.0
    } else {
        (1.0 - (diff - tolerance) / falloff).max(0.0)
    }
}

/// Mean of the compatibility terms both tracks have data for.
pub fn compatibility(a: &AudioFeatures, b: &AudioFeatures) -> Option<f64> {
    let mut terms = Vec::with_capacity(4);
    if let (Some(ta), Some(tb)) = (a.tempo, b.tempo) {
        terms.push(tempo_compatibility(ta, tb));
    }
    if let (Some(ka), Some(kb)) = (a.key, b.key) {
        terms.push(key_compatibility((ka, a.mode), (kb, b.mode)));
    }
    if let (Some(ea), Some(eb)) = (a.energy, b.energy) {
        terms.push(closeness(ea, eb, 0.15, 0.35));
    }
    if let (Some(va), Some(vb)) = (a.valence, b.valence) {
        terms.push(closeness(va, vb, 0.2, 0.4));
    }
    if terms.is_empty() {
        return None;
    }
    Some(terms.iter().sum::<f64>() / terms.len() as f64)
}

/// How well `candidate` follows the recent tracks (oldest first).
///
/// The most recent track weighs the most.
pub fn flow_score(candidate: &AudioFeatures, recent: &[AudioFeatures]) -> Option<f64> {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for (age, previous) in recent.iter().rev().enumerate() {
        if let Some(score) = compatibility(previous, candidate) {
            let weight = 1.0 / (age as f64 + 1.0);
            weighted += score * weight;
            total_weight += weight;
        }
    }
    (total_weight > 0.0).then(|| weighted / total_weight)
}
