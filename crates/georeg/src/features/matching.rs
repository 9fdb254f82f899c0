use std::collections::HashMap;

use rayon::prelude::*;

use super::describe::Descriptor;

/// Query-to-train descriptor match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureMatch {
    pub query: usize,
    pub train: usize,
    pub distance: u32,
}

/// Brute-force 2-NN Hamming matching with a best/second-best ratio test.
///
/// A query needs at least two train descriptors to pass the ratio test.
pub fn match_descriptors(query: &[Descriptor], train: &[Descriptor], ratio: f32) -> Vec<FeatureMatch> {
    if train.len() < 2 {
        return Vec::new();
    }
    query
        .par_iter()
        .enumerate()
        .filter_map(|(qi, qd)| {
            let mut best = (u32::MAX, usize::MAX);
            let mut second = u32::MAX;
            for (ti, td) in train.iter().enumerate() {
                let d = qd.hamming(td);
                if d < best.0 {
                    second = best.0;
                    best = (d, ti);
                } else if d < second {
                    second = d;
                }
            }
            ((best.0 as f32) < ratio * second as f32).then_some(FeatureMatch {
                query: qi,
                train: best.1,
                distance: best.0,
            })
        })
        .collect()
}

/// Drop matches whose query or train keypoint is shared with at least
/// `cutoff` other matches.
pub fn remove_ambiguous_matches(matches: &[FeatureMatch], cutoff: usize) -> Vec<FeatureMatch> {
    let mut query_count: HashMap<usize, usize> = HashMap::new();
    let mut train_count: HashMap<usize, usize> = HashMap::new();
    for m in matches {
        *query_count.entry(m.query).or_default() += 1;
        *train_count.entry(m.train).or_default() += 1;
    }
    matches
        .iter()
        .filter(|m| {
            let others = query_count[&m.query] - 1 + train_count[&m.train] - 1;
            others < cutoff
        })
        .copied()
        .collect()
}
