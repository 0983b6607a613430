//! Mock selection.
//!
//! Given the candidate spans recorded for one trace and a live outbound
//! request, pick the span whose recorded response should be returned. The
//! pipeline runs cheapest-first: exact package/submodule filtering, then a
//! canonical-hash fast path, then schema-reduced structural scoring with
//! package-aware tie-breaks.

mod packages;
mod similarity;

pub use packages::is_reusable;
pub use similarity::structural_similarity;

use std::collections::HashMap;
use std::sync::Arc;

use drift_protocol::GetMockRequest;
use drift_protocol::Span;
use drift_protocol::value_hash;
use tracing::trace;

use packages::Affinity;

/// Minimum score a candidate must reach; anything lower is reported as a
/// miss rather than replayed speculatively.
pub const MIN_MATCH_SCORE: f64 = 0.5;

/// One entry of the candidate set, carrying its consumption state.
#[derive(Clone, Debug)]
pub struct MatchCandidate {
    pub span: Arc<Span>,
    pub consumed: bool,
}

/// A successful selection: the index into the candidate slice plus the
/// score that chose it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatchSelection {
    pub index: usize,
    pub score: f64,
}

/// Selects the best recorded span for a live request, or `None` when no
/// candidate is acceptable.
pub fn select_mock(candidates: &[MatchCandidate], request: &GetMockRequest) -> Option<MatchSelection> {
    // Coarse filter: same package and submodule, not yet used up.
    let eligible: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, candidate)| {
            candidate.span.package_name == request.package_name
                && candidate.span.submodule_name == request.submodule_name
                && (!candidate.consumed || is_reusable(&candidate.span))
        })
        .map(|(index, _)| index)
        .collect();
    if eligible.is_empty() {
        return None;
    }

    // Exact-hash fast path over the canonical form of the live input.
    let live_hash = value_hash(&request.input_value);
    if let Some(&index) = eligible.iter().find(|&&index| {
        let hash = &candidates[index].span.input_value_hash;
        !hash.is_empty() && *hash == live_hash
    }) {
        trace!(index, "mock matched by input hash");
        return Some(MatchSelection { index, score: 1.0 });
    }

    // Structural scoring, grouped by input schema so each group's
    // importance reduction of the live input is computed once.
    let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
    for &index in &eligible {
        groups
            .entry(candidates[index].span.input_schema_hash.as_str())
            .or_default()
            .push(index);
    }

    let mut best: Option<(f64, u32, usize)> = None;
    for indices in groups.values() {
        let schema = indices
            .first()
            .and_then(|&index| candidates[index].span.input_schema.as_ref());
        let reduced_live = match schema {
            Some(schema) => schema.project(&request.input_value),
            None => request.input_value.clone(),
        };
        for &index in indices {
            let span = &candidates[index].span;
            let reduced_recorded = match span.input_schema.as_ref() {
                Some(schema) => schema.project(&span.input_value),
                None => span.input_value.clone(),
            };
            let mut score = structural_similarity(&reduced_recorded, &reduced_live);
            let rank = match packages::affinity(span, &request.input_value) {
                Affinity::Decisive(true) => {
                    score = 1.0;
                    u32::MAX
                }
                Affinity::Decisive(false) => continue,
                Affinity::Ranked(rank) => rank,
                Affinity::Neutral => 0,
            };
            let better = match &best {
                None => true,
                Some((best_score, best_rank, best_index)) => {
                    match score.total_cmp(best_score) {
                        std::cmp::Ordering::Greater => true,
                        std::cmp::Ordering::Less => false,
                        // Ties go to the higher package rank, then to the
                        // earliest span in recorded order.
                        std::cmp::Ordering::Equal => {
                            rank > *best_rank || (rank == *best_rank && index < *best_index)
                        }
                    }
                }
            };
            if better {
                best = Some((score, rank, index));
            }
        }
    }

    match best {
        Some((score, _, index)) if score >= MIN_MATCH_SCORE => {
            trace!(index, score, "mock matched by structural score");
            Some(MatchSelection { index, score })
        }
        _ => None,
    }
}
