//! Vector distance functions.
//!
//! Graph operations use Euclidean distance. Cosine similarity backs the exact
//! scan path. Both tolerate vectors of unequal length by treating missing
//! components as zero.

/// Euclidean distance between two vectors.
#[inline]
#[must_use]
pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    squared_euclidean(a, b).sqrt()
}

/// Squared Euclidean distance; cheaper when only the ordering matters.
#[must_use]
pub fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    let shared = a.len().min(b.len());
    let mut sum: f32 = a[..shared]
        .iter()
        .zip(&b[..shared])
        .map(|(x, y)| (x - y) * (x - y))
        .sum();
    sum += a[shared..].iter().map(|x| x * x).sum::<f32>();
    sum += b[shared..].iter().map(|y| y * y).sum::<f32>();
    sum
}

/// Cosine similarity in `[-1, 1]`; zero vectors have similarity 0.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|y| y * y).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Maps a distance in `[0, inf)` to a similarity in `(0, 1]`.
#[inline]
#[must_use]
pub fn similarity_from_distance(distance: f32) -> f32 {
    1.0 / (1.0 + distance)
}

/// Truncates or zero-fills `vector` to `dimension` components.
///
/// Non-finite components become zero so a single bad analysis result cannot
/// poison every distance computed against it.
#[must_use]
pub fn fit_dimension(vector: &[f32], dimension: usize) -> Vec<f32> {
    let mut fitted: Vec<f32> = vector
        .iter()
        .take(dimension)
        .map(|v| if v.is_finite() { *v } else { 0.0 })
        .collect();
    fitted.resize(dimension, 0.0);
    fitted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_basic() {
        assert_eq!(euclidean(&[0.0, 0.0], &[3.0, 4.0]), 5.0);
        assert_eq!(euclidean(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_euclidean_unequal_lengths_zero_fill() {
        assert_eq!(euclidean(&[3.0], &[0.0, 4.0]), 5.0);
        assert_eq!(euclidean(&[3.0, 4.0], &[]), 5.0);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_fit_dimension() {
        assert_eq!(fit_dimension(&[1.0, 2.0, 3.0], 2), vec![1.0, 2.0]);
        assert_eq!(fit_dimension(&[1.0], 3), vec![1.0, 0.0, 0.0]);
        assert_eq!(fit_dimension(&[f32::NAN, 1.0], 2), vec![0.0, 1.0]);
    }

    #[test]
    fn test_similarity_is_monotonic() {
        assert_eq!(similarity_from_distance(0.0), 1.0);
        assert!(similarity_from_distance(1.0) > similarity_from_distance(2.0));
    }
}
