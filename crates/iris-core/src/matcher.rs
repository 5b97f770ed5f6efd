//! Masked fractional Hamming distance with circular shift search.
//!
//! Lower scores mean more similar templates. The accept threshold is
//! calibration data supplied by the caller; [`DEFAULT_MATCH_THRESHOLD`] is
//! only an illustrative starting point.

use crate::types::{Template, TEMPLATE_WORDS};

/// Illustrative accept threshold for [`HammingMatcher`]. Accept iff distance < threshold.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.32;
/// Default half-width of the circular shift search, in template columns.
pub const DEFAULT_MAX_SHIFT: i32 = 8;
/// Default minimum jointly valid bits for a shift to count.
pub const DEFAULT_MIN_OVERLAP_BITS: usize = 1024;

/// Distance between two templates at their best alignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Distance {
    /// Fractional Hamming distance in [0, 1]; 1.0 when no shift overlapped enough.
    pub value: f32,
    /// Columns the probe was rotated by at the best alignment.
    pub shift: i32,
    /// Jointly valid bits at the best alignment.
    pub compared_bits: usize,
}

impl Distance {
    fn no_overlap() -> Self {
        Self {
            value: 1.0,
            shift: 0,
            compared_bits: 0,
        }
    }

    /// Ordering used to pick the winner: distance, then |shift|, then negative shift first.
    fn beats(&self, other: &Distance) -> bool {
        (self.value, self.shift.abs(), self.shift) < (other.value, other.shift.abs(), other.shift)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Reject,
}

/// One enrolled template offered for comparison.
#[derive(Debug, Clone, Copy)]
pub struct GalleryTemplate<'a> {
    pub identity: &'a str,
    pub template_id: &'a str,
    pub template: &'a Template,
}

/// Outcome of comparing a probe against a gallery.
///
/// `matched_identity` and `matched_template` are set only on accept.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MatchResult {
    pub score: f32,
    pub decision: Decision,
    pub matched_identity: Option<String>,
    pub matched_template: Option<String>,
    pub shift: i32,
    pub compared_bits: usize,
}

impl MatchResult {
    pub fn is_accept(&self) -> bool {
        self.decision == Decision::Accept
    }
}

pub trait Matcher: Send + Sync {
    /// Best distance between `probe` and `reference` over the shift range.
    fn distance(&self, probe: &Template, reference: &Template) -> Distance;

    /// Minimum distance over every gallery template, judged against `threshold`.
    fn compare(
        &self,
        probe: &Template,
        gallery: &[GalleryTemplate<'_>],
        threshold: f32,
    ) -> MatchResult;
}

#[derive(Debug, Clone)]
pub struct HammingMatcher {
    pub max_shift: i32,
    pub min_overlap_bits: usize,
}

impl Default for HammingMatcher {
    fn default() -> Self {
        Self {
            max_shift: DEFAULT_MAX_SHIFT,
            min_overlap_bits: DEFAULT_MIN_OVERLAP_BITS,
        }
    }
}

impl HammingMatcher {
    pub fn new(max_shift: i32, min_overlap_bits: usize) -> Self {
        Self {
            max_shift: max_shift.max(0),
            min_overlap_bits,
        }
    }

    fn rotations(&self, probe: &Template) -> Vec<(i32, Template)> {
        (-self.max_shift..=self.max_shift)
            .map(|s| (s, probe.rotated(s)))
            .collect()
    }

    fn best_over(&self, rotations: &[(i32, Template)], reference: &Template) -> Distance {
        let mut best: Option<Distance> = None;
        for (shift, rotated) in rotations {
            let Some((diff, compared)) = masked_difference(rotated, reference) else {
                continue;
            };
            if compared < self.min_overlap_bits.max(1) {
                continue;
            }
            let candidate = Distance {
                value: diff as f32 / compared as f32,
                shift: *shift,
                compared_bits: compared,
            };
            if best.map_or(true, |b| candidate.beats(&b)) {
                best = Some(candidate);
            }
        }
        best.unwrap_or_else(Distance::no_overlap)
    }
}

/// Differing and jointly valid bit counts.
fn masked_difference(a: &Template, b: &Template) -> Option<(usize, usize)> {
    let (ca, ma, cb, mb) = (a.code_words(), a.mask_words(), b.code_words(), b.mask_words());
    if ca.len() != TEMPLATE_WORDS || cb.len() != TEMPLATE_WORDS {
        return None;
    }
    let mut diff = 0usize;
    let mut compared = 0usize;
    for i in 0..TEMPLATE_WORDS {
        let joint = ma[i] & mb[i];
        diff += ((ca[i] ^ cb[i]) & joint).count_ones() as usize;
        compared += joint.count_ones() as usize;
    }
    Some((diff, compared))
}

impl Matcher for HammingMatcher {
    fn distance(&self, probe: &Template, reference: &Template) -> Distance {
        self.best_over(&self.rotations(probe), reference)
    }

    fn compare(
        &self,
        probe: &Template,
        gallery: &[GalleryTemplate<'_>],
        threshold: f32,
    ) -> MatchResult {
        let rotations = self.rotations(probe);
        let mut best: Option<(Distance, &GalleryTemplate<'_>)> = None;
        for entry in gallery {
            let d = self.best_over(&rotations, entry.template);
            if best.as_ref().map_or(true, |(b, _)| d.value < b.value) {
                best = Some((d, entry));
            }
        }

        let Some((d, entry)) = best else {
            return MatchResult {
                score: 1.0,
                decision: Decision::Reject,
                matched_identity: None,
                matched_template: None,
                shift: 0,
                compared_bits: 0,
            };
        };

        let accept = d.compared_bits > 0 && d.value < threshold;
        tracing::debug!(
            score = d.value,
            shift = d.shift,
            compared_bits = d.compared_bits,
            gallery = gallery.len(),
            accept,
            "matcher: best candidate"
        );
        MatchResult {
            score: d.value,
            decision: if accept {
                Decision::Accept
            } else {
                Decision::Reject
            },
            matched_identity: accept.then(|| entry.identity.to_string()),
            matched_template: accept.then(|| entry.template_id.to_string()),
            shift: d.shift,
            compared_bits: d.compared_bits,
        }
    }
}
