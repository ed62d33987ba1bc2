//! Reciprocal Rank Fusion of per-tier result lists.
//!
//! RRF combines ranked lists without comparing their raw scores, which is
//! exactly what mixing cosine similarities with BM25 rankings needs. Each
//! appearance contributes `1 / (k + rank)` with 1-based ranks; appearing in
//! only one list still counts (union semantics).

use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::types::{HitSource, SearchHit};

/// Standard RRF constant from the literature; configurable at the router.
pub const DEFAULT_RRF_K: f32 = 60.0;

/// Fuse ranked lists into a single list of at most `limit` hits.
///
/// Ties on fused score break toward the newer record, then the smaller id
/// so ordering is deterministic.
pub fn reciprocal_rank_fusion(
    lists: Vec<Vec<SearchHit>>,
    k: f32,
    limit: usize,
) -> Vec<SearchHit> {
    let mut fused: HashMap<String, (SearchHit, f32)> = HashMap::new();

    for list in lists {
        for (index, hit) in list.into_iter().enumerate() {
            let contribution = 1.0 / (k + (index + 1) as f32);
            match fused.entry(hit.record.id.clone()) {
                Entry::Occupied(mut entry) => entry.get_mut().1 += contribution,
                Entry::Vacant(entry) => {
                    entry.insert((hit, contribution));
                }
            }
        }
    }

    let mut hits: Vec<SearchHit> = fused
        .into_values()
        .map(|(mut hit, score)| {
            hit.score = score;
            hit.source = HitSource::Fused;
            hit
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.record.timestamp.cmp(&a.record.timestamp))
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    hits.truncate(limit);
    hits
}
