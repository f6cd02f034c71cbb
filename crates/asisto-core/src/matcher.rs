//! Nearest-neighbour matching of a probe descriptor against enrolled identities.

use crate::types::{Embedding, EnrolledIdentity};

/// Default maximum distance still accepted as a match.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

/// Result of matching a probe embedding against the enrolled set.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance to the nearest comparable identity; infinite when none was comparable.
    pub distance: f32,
    /// `max(0, 1 - distance)` of the nearest identity, reported even without a match.
    pub confidence: f32,
    /// Gallery index of the nearest identity, whether or not it was accepted.
    pub nearest: Option<usize>,
}

impl MatchResult {
    fn no_match() -> Self {
        Self { matched: false, distance: f32::INFINITY, confidence: 0.0, nearest: None }
    }

    /// The accepted identity, if the probe matched.
    pub fn identity<'g>(&self, gallery: &'g [EnrolledIdentity]) -> Option<&'g EnrolledIdentity> {
        if !self.matched {
            return None;
        }
        self.nearest.and_then(|idx| gallery.get(idx))
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[EnrolledIdentity], threshold: f32) -> MatchResult;
}

/// Euclidean-distance matcher.
///
/// Scans the whole gallery linearly. Equidistant identities resolve to the
/// earliest one in gallery order.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[EnrolledIdentity], threshold: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, identity) in gallery.iter().enumerate() {
            if identity.embedding.len() != probe.len() {
                tracing::warn!(
                    identity = %identity.id,
                    expected = probe.len(),
                    actual = identity.embedding.len(),
                    "skipping identity with incomparable embedding length"
                );
                continue;
            }
            let dist = probe.euclidean_distance(&identity.embedding);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        if best_idx.is_none() {
            return MatchResult::no_match();
        }

        MatchResult {
            matched: best_dist < threshold,
            distance: best_dist,
            confidence: (1.0 - best_dist).max(0.0),
            nearest: best_idx,
        }
    }
}
