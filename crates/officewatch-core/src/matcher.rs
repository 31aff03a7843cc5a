//! Nearest-neighbor identity matching against the encoding gallery.

use crate::gallery::Gallery;
use crate::types::{Embedding, IdentityId};

/// Default acceptance tolerance, in Euclidean embedding distance.
///
/// For L2-normalized ArcFace embeddings `d = sqrt(2 - 2 cos)`, so 0.6 accepts only
/// cosine similarity >= 0.82. That is strict for this encoder; deployments usually
/// retune it (`tolerance` / `OFFICEWATCH_TOLERANCE`) against their own gallery.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Result of matching a query embedding against a gallery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    /// Identity of the closest entry, present only when its distance is within tolerance.
    pub identity_id: Option<IdentityId>,
    /// Distance to the closest entry, reported even when the match is rejected.
    /// `None` when nothing was comparable (empty gallery or dimension mismatch).
    pub distance: Option<f32>,
}

impl MatchResult {
    pub const NO_CANDIDATES: MatchResult = MatchResult {
        identity_id: None,
        distance: None,
    };

    pub fn matched(&self) -> bool {
        self.identity_id.is_some()
    }
}

/// Strategy for looking up a query embedding in the gallery.
///
/// Implementations may trade exactness for speed, but must keep the acceptance rule:
/// the closest entry is accepted iff its distance is `<= tolerance`.
pub trait Matcher {
    fn compare(&self, query: &Embedding, gallery: &Gallery, tolerance: f32) -> MatchResult;
}

/// Exact linear-scan matcher on Euclidean distance.
///
/// Ties resolve to the earliest gallery entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, query: &Embedding, gallery: &Gallery, tolerance: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;
        let mut skipped = 0usize;

        for (i, entry) in gallery.entries().iter().enumerate() {
            let Some(dist) = query.distance(&entry.embedding) else {
                skipped += 1;
                continue;
            };
            // Strict `<` keeps the first of equal minima.
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((i, dist));
            }
        }

        if skipped > 0 {
            tracing::warn!(
                skipped,
                query_dim = query.dim(),
                gallery_dim = ?gallery.dim(),
                "embedding dimension mismatch against gallery"
            );
        }

        match best {
            Some((idx, dist)) if dist <= tolerance => MatchResult {
                identity_id: Some(gallery.entries()[idx].identity_id),
                distance: Some(dist),
            },
            Some((_, dist)) => MatchResult {
                identity_id: None,
                distance: Some(dist),
            },
            None => MatchResult::NO_CANDIDATES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::GalleryEntry;

    fn entry(id: IdentityId, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry { identity_id: id, embedding: Embedding::new(values) }
    }

    fn gallery(entries: Vec<GalleryEntry>) -> Gallery {
        Gallery::new(entries, None).unwrap()
    }

    #[test]
    fn test_empty_gallery_never_matches() {
        let query = Embedding::new(vec![0.1, 0.2]);
        let result = EuclideanMatcher.compare(&query, &Gallery::empty(), 10.0);
        assert_eq!(result, MatchResult::NO_CANDIDATES);
        assert!(!result.matched());
    }

    #[test]
    fn test_exact_match_has_zero_distance() {
        let g = gallery(vec![entry(1, vec![0.5, 0.5]), entry(2, vec![0.1, 0.9])]);
        let query = Embedding::new(vec![0.1, 0.9]);
        let result = EuclideanMatcher.compare(&query, &g, 1e-6);
        assert_eq!(result.identity_id, Some(2));
        assert_eq!(result.distance, Some(0.0));
    }

    #[test]
    fn test_closest_within_tolerance_wins() {
        // Distances 0.58 and 0.61 along one axis.
        let g = gallery(vec![entry(10, vec![0.61, 0.0]), entry(20, vec![0.58, 0.0])]);
        let query = Embedding::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher.compare(&query, &g, 0.6);
        assert_eq!(result.identity_id, Some(20));
        assert!((result.distance.unwrap() - 0.58).abs() < 1e-6);
    }

    #[test]
    fn test_rejection_still_reports_distance() {
        let g = gallery(vec![entry(1, vec![0.61, 0.0])]);
        let query = Embedding::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher.compare(&query, &g, 0.6);
        assert!(!result.matched());
        assert!((result.distance.unwrap() - 0.61).abs() < 1e-6);
    }

    #[test]
    fn test_distance_equal_to_tolerance_is_accepted() {
        let g = gallery(vec![entry(4, vec![0.5, 0.0])]);
        let query = Embedding::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher.compare(&query, &g, 0.5);
        assert_eq!(result.identity_id, Some(4));
    }

    #[test]
    fn test_ties_resolve_to_first_entry() {
        let g = gallery(vec![
            entry(3, vec![0.0, 0.2]),
            entry(1, vec![0.2, 0.0]),
            entry(2, vec![0.0, -0.2]),
        ]);
        let query = Embedding::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher.compare(&query, &g, 0.6);
        assert_eq!(result.identity_id, Some(3));
    }

    #[test]
    fn test_best_match_last_in_gallery() {
        let g = gallery(vec![
            entry(1, vec![1.0, 0.0, 0.0]),
            entry(2, vec![0.0, 1.0, 0.0]),
            entry(3, vec![0.0, 0.0, 1.0]),
        ]);
        let query = Embedding::new(vec![0.0, 0.05, 0.99]);
        let result = EuclideanMatcher.compare(&query, &g, 0.6);
        assert_eq!(result.identity_id, Some(3));
    }

    #[test]
    fn test_dimension_mismatch_yields_no_candidates() {
        let g = gallery(vec![entry(1, vec![0.0, 0.0, 0.0])]);
        let query = Embedding::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher.compare(&query, &g, 0.6);
        assert_eq!(result, MatchResult::NO_CANDIDATES);
    }

    #[test]
    fn test_default_tolerance_on_unit_vectors() {
        // Unit vectors: cosine 0.83 is accepted, cosine 0.80 is not.
        let g = gallery(vec![entry(1, vec![1.0, 0.0])]);
        let near = Embedding::new(vec![0.83, (1.0f32 - 0.83 * 0.83).sqrt()]);
        let far = Embedding::new(vec![0.8, 0.6]);
        assert!(EuclideanMatcher.compare(&near, &g, DEFAULT_TOLERANCE).matched());
        let rejected = EuclideanMatcher.compare(&far, &g, DEFAULT_TOLERANCE);
        assert!(!rejected.matched());
        assert!((rejected.distance.unwrap() - 0.4f32.sqrt()).abs() < 1e-5);
    }
}
