//! Identity matching against the enrolled gallery.

use crate::types::{Embedding, KnownIdentity, Label};

/// Default cosine similarity threshold for ArcFace embeddings.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.40;

/// Default Euclidean tolerance, the usual cut-off for 128-d dlib-style
/// encodings.
pub const DEFAULT_DISTANCE_TOLERANCE: f32 = 0.6;

/// Predicate deciding whether a probe embedding belongs to a known one.
pub trait Matcher {
    fn is_match(&self, probe: &Embedding, known: &Embedding) -> bool;
}

/// Accepts a pair when their cosine similarity reaches `threshold`.
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    pub threshold: f32,
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

impl Matcher for CosineMatcher {
    fn is_match(&self, probe: &Embedding, known: &Embedding) -> bool {
        if probe.values.len() != known.values.len() {
            return false;
        }
        probe.similarity(known) >= self.threshold
    }
}

/// Accepts a pair when their Euclidean distance is at most `tolerance`.
#[derive(Debug, Clone, Copy)]
pub struct DistanceMatcher {
    pub tolerance: f32,
}

impl Default for DistanceMatcher {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_DISTANCE_TOLERANCE,
        }
    }
}

impl Matcher for DistanceMatcher {
    fn is_match(&self, probe: &Embedding, known: &Embedding) -> bool {
        if probe.values.len() != known.values.len() {
            return false;
        }
        let distance = probe
            .values
            .iter()
            .zip(&known.values)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt();
        distance <= self.tolerance
    }
}

/// Matcher chosen at runtime from configuration.
#[derive(Debug, Clone, Copy)]
pub enum MatchPolicy {
    Cosine(CosineMatcher),
    Distance(DistanceMatcher),
}

impl Default for MatchPolicy {
    fn default() -> Self {
        MatchPolicy::Cosine(CosineMatcher::default())
    }
}

impl Matcher for MatchPolicy {
    fn is_match(&self, probe: &Embedding, known: &Embedding) -> bool {
        match self {
            MatchPolicy::Cosine(m) => m.is_match(probe, known),
            MatchPolicy::Distance(m) => m.is_match(probe, known),
        }
    }
}

/// Find the identity for `probe` by scanning `known` in stored order.
///
/// The first entry the matcher accepts wins, even when a later entry is
/// more similar: between near-duplicate identities the lower index always
/// takes the label.
pub fn match_identity<'a, M: Matcher + ?Sized>(
    probe: &Embedding,
    known: &'a [KnownIdentity],
    matcher: &M,
) -> Option<&'a str> {
    known
        .iter()
        .find(|identity| matcher.is_match(probe, &identity.embedding))
        .map(|identity| identity.name.as_str())
}

/// [`match_identity`] as a display label: the matched name or `Unknown`.
pub fn label_for<M: Matcher + ?Sized>(
    probe: &Embedding,
    known: &[KnownIdentity],
    matcher: &M,
) -> Label {
    match match_identity(probe, known, matcher) {
        Some(name) => Label::Known(name.to_string()),
        None => Label::Unknown,
    }
}
