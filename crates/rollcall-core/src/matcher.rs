//! Nearest-neighbour identity matching against the gallery.

use crate::gallery::Gallery;
use crate::types::Embedding;
use ndarray::ArrayView1;

/// Label reported for faces that match no gallery identity.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Minimum similarity (exclusive) for a positive match.
pub const DEFAULT_RECOGNITION_THRESHOLD: f32 = 0.5;

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Best similarity, clipped to [0, 1].
    pub similarity: f32,
    /// Gallery row of the best match (if any).
    pub row: Option<usize>,
    /// Identity of the matched row (if any).
    pub label: Option<String>,
}

impl MatchResult {
    fn unknown(similarity: f32) -> Self {
        Self {
            matched: false,
            similarity,
            row: None,
            label: None,
        }
    }

    /// Matched identity, or [`UNKNOWN_LABEL`].
    pub fn name(&self) -> &str {
        self.label.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

/// Strategy for comparing a probe embedding against a gallery.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult;
}

/// Dot-product matcher for unit-norm embeddings.
///
/// Scores are clipped to [0, 1]; the first row holding the maximum wins and
/// the maximum must be strictly greater than the threshold.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
        if gallery.is_empty() {
            return MatchResult::unknown(0.0);
        }
        if probe.dim() != gallery.dim() {
            tracing::warn!(
                probe_dim = probe.dim(),
                gallery_dim = gallery.dim(),
                "probe dimension does not match gallery"
            );
            return MatchResult::unknown(0.0);
        }

        let scores = gallery.matrix().dot(&ArrayView1::from(&probe.values[..]));

        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx = 0usize;
        for (i, &raw) in scores.iter().enumerate() {
            let sim = if raw.is_nan() { 0.0 } else { raw.clamp(0.0, 1.0) };
            if sim > best_sim {
                best_sim = sim;
                best_idx = i;
            }
        }

        if best_sim > threshold {
            MatchResult {
                matched: true,
                similarity: best_sim,
                row: Some(best_idx),
                label: gallery.label(best_idx).map(str::to_owned),
            }
        } else {
            MatchResult::unknown(best_sim)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, axis: usize) -> Embedding {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        Embedding::new(v)
    }

    fn gallery(rows: Vec<(&str, Embedding)>) -> Gallery {
        let dim = rows.first().map(|(_, e)| e.dim()).unwrap_or(3);
        Gallery::from_rows(dim, rows.into_iter().map(|(l, e)| (l.to_string(), e)).collect())
            .unwrap()
    }

    #[test]
    fn test_exact_probe_matches_identity() {
        let g = gallery(vec![("alice", unit(3, 0)), ("bob", unit(3, 1))]);
        let result = CosineMatcher.compare(&unit(3, 0), &g, DEFAULT_RECOGNITION_THRESHOLD);
        assert!(result.matched);
        assert_eq!(result.name(), "alice");
        assert_eq!(result.row, Some(0));
        assert!((result.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let result = CosineMatcher.compare(&unit(512, 0), &Gallery::empty(), 0.5);
        assert!(!result.matched);
        assert_eq!(result.name(), UNKNOWN_LABEL);
        assert_eq!(result.similarity, 0.0);
    }

    #[test]
    fn test_threshold_is_strict() {
        // probe · row = 0.5 exactly
        let g = gallery(vec![("alice", Embedding::new(vec![0.5, (0.75f32).sqrt()]))]);
        let probe = Embedding::new(vec![1.0, 0.0]);
        let result = CosineMatcher.compare(&probe, &g, 0.5);
        assert_eq!(result.similarity, 0.5);
        assert!(!result.matched);
        assert_eq!(result.name(), UNKNOWN_LABEL);
    }

    #[test]
    fn test_negative_similarity_clipped_to_zero() {
        let g = gallery(vec![("alice", Embedding::new(vec![-1.0, 0.0]))]);
        let result = CosineMatcher.compare(&Embedding::new(vec![1.0, 0.0]), &g, 0.5);
        assert!(!result.matched);
        assert_eq!(result.similarity, 0.0);
    }

    #[test]
    fn test_overshoot_clipped_to_one() {
        let g = gallery(vec![("alice", Embedding::new(vec![1.0001, 0.0]))]);
        let result = CosineMatcher.compare(&Embedding::new(vec![1.0, 0.0]), &g, 0.5);
        assert!(result.matched);
        assert_eq!(result.similarity, 1.0);
    }

    #[test]
    fn test_first_maximum_wins() {
        let g = gallery(vec![
            ("carol", unit(3, 2)),
            ("alice", unit(3, 0)),
            ("bob", unit(3, 0)),
        ]);
        let result = CosineMatcher.compare(&unit(3, 0), &g, 0.5);
        assert_eq!(result.row, Some(1));
        assert_eq!(result.name(), "alice");
    }

    #[test]
    fn test_best_row_among_many_for_same_identity() {
        let g = gallery(vec![
            ("alice", Embedding::normalized(vec![1.0, 1.0, 0.0])),
            ("alice", unit(3, 0)),
            ("bob", unit(3, 1)),
        ]);
        let result = CosineMatcher.compare(&unit(3, 0), &g, 0.5);
        assert_eq!(result.row, Some(1));
        assert_eq!(result.name(), "alice");
    }

    #[test]
    fn test_dimension_mismatch_is_unknown() {
        let g = gallery(vec![("alice", unit(3, 0))]);
        let result = CosineMatcher.compare(&unit(4, 0), &g, 0.5);
        assert!(!result.matched);
    }

    #[test]
    fn test_deterministic() {
        let g = gallery(vec![
            ("alice", Embedding::normalized(vec![0.9, 0.1, 0.2])),
            ("bob", Embedding::normalized(vec![0.1, 0.9, 0.3])),
        ]);
        let probe = Embedding::normalized(vec![0.7, 0.3, 0.2]);
        let first = CosineMatcher.compare(&probe, &g, 0.5);
        for _ in 0..10 {
            assert_eq!(CosineMatcher.compare(&probe, &g, 0.5), first);
        }
    }
}
