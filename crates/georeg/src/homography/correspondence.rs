//! Paired point correspondences and reprojection-error helpers.
//!
//! A correspondence set is one list of records. Filtering or remapping
//! always acts on whole pairs, so the source side and the target side can
//! never drift out of step.

use std::cmp::Ordering;

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use super::core::reprojection_error;

/// One `(source, target)` point pair.
///
/// `source` is a pixel in the image being registered. `target` is a pixel in
/// another image or a geographic coordinate, depending on the set it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    pub source: [f64; 2],
    pub target: [f64; 2],
}

impl Correspondence {
    pub fn new(source: [f64; 2], target: [f64; 2]) -> Self {
        Self { source, target }
    }

    /// Same pair with source and target exchanged.
    pub fn swapped(&self) -> Self {
        Self {
            source: self.target,
            target: self.source,
        }
    }

    fn is_finite(&self) -> bool {
        self.source.iter().chain(self.target.iter()).all(|v| v.is_finite())
    }
}

/// Ordered list of correspondences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrespondenceSet {
    pairs: Vec<Correspondence>,
}

impl CorrespondenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            pairs: Vec::with_capacity(n),
        }
    }

    /// Build from `(source, target)` tuples, dropping non-finite pairs.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = ([f64; 2], [f64; 2])>,
    {
        pairs
            .into_iter()
            .map(|(s, t)| Correspondence::new(s, t))
            .collect()
    }

    pub fn push(&mut self, source: [f64; 2], target: [f64; 2]) {
        let c = Correspondence::new(source, target);
        if c.is_finite() {
            self.pairs.push(c);
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Correspondence> {
        self.pairs.iter()
    }

    pub fn as_slice(&self) -> &[Correspondence] {
        &self.pairs
    }

    pub fn sources(&self) -> Vec<[f64; 2]> {
        self.pairs.iter().map(|c| c.source).collect()
    }

    pub fn targets(&self) -> Vec<[f64; 2]> {
        self.pairs.iter().map(|c| c.target).collect()
    }

    /// Source and target columns for the fitting routines, same order.
    pub(crate) fn columns(&self) -> (Vec<[f64; 2]>, Vec<[f64; 2]>) {
        self.pairs.iter().map(|c| (c.source, c.target)).unzip()
    }

    /// Keep the pairs whose mask entry is `true`.
    pub fn select(&self, mask: &[bool]) -> Self {
        self.pairs
            .iter()
            .zip(mask.iter())
            .filter(|(_, &keep)| keep)
            .map(|(c, _)| *c)
            .collect()
    }

    /// Keep the pairs accepted by `keep`.
    pub fn filter<F>(&self, mut keep: F) -> Self
    where
        F: FnMut(&Correspondence) -> bool,
    {
        self.pairs.iter().filter(|c| keep(c)).copied().collect()
    }

    /// Replace each target point. Pairs whose mapped target is `None` are dropped.
    pub fn map_targets<F>(&self, mut f: F) -> Self
    where
        F: FnMut([f64; 2]) -> Option<[f64; 2]>,
    {
        self.pairs
            .iter()
            .filter_map(|c| f(c.target).map(|t| Correspondence::new(c.source, t)))
            .collect()
    }

    /// Replace each source point. Pairs whose mapped source is `None` are dropped.
    pub fn map_sources<F>(&self, mut f: F) -> Self
    where
        F: FnMut([f64; 2]) -> Option<[f64; 2]>,
    {
        self.pairs
            .iter()
            .filter_map(|c| f(c.source).map(|s| Correspondence::new(s, c.target)))
            .collect()
    }

    /// Set with every pair swapped.
    pub fn swapped(&self) -> Self {
        self.pairs.iter().map(Correspondence::swapped).collect()
    }

    /// Reprojection error of each pair under `h` (source → target).
    pub fn reprojection_errors(&self, h: &Matrix3<f64>) -> Vec<f64> {
        self.pairs
            .iter()
            .map(|c| reprojection_error(h, &c.source, &c.target))
            .collect()
    }
}

impl FromIterator<Correspondence> for CorrespondenceSet {
    fn from_iter<T: IntoIterator<Item = Correspondence>>(iter: T) -> Self {
        Self {
            pairs: iter.into_iter().filter(Correspondence::is_finite).collect(),
        }
    }
}

impl<'a> IntoIterator for &'a CorrespondenceSet {
    type Item = &'a Correspondence;
    type IntoIter = std::slice::Iter<'a, Correspondence>;

    fn into_iter(self) -> Self::IntoIter {
        self.pairs.iter()
    }
}

/// Mean and 95th percentile of the given errors. Sorts in place.
pub fn mean_and_p95(errors: &mut [f64]) -> (f64, f64) {
    if errors.is_empty() {
        return (0.0, 0.0);
    }
    errors.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mean = errors.iter().sum::<f64>() / errors.len() as f64;
    let idx = ((errors.len() as f64 * 0.95) as usize).min(errors.len() - 1);
    (mean, errors[idx])
}

/// Collect masked inlier errors (`inlier_mask[i] == true`) from the RANSAC
/// error vector.
pub(crate) fn collect_masked_inlier_errors(errors: &[f64], inlier_mask: &[bool]) -> Vec<f64> {
    inlier_mask
        .iter()
        .zip(errors.iter())
        .filter_map(|(&is_inlier, &err)| if is_inlier { Some(err) } else { None })
        .collect()
}

/// Root-mean-square of the finite errors, `None` when there are none.
pub fn rms(errors: &[f64]) -> Option<f64> {
    let mut sum = 0.0f64;
    let mut n = 0usize;
    for &err in errors {
        if err.is_finite() {
            sum += err * err;
            n += 1;
        }
    }
    if n == 0 {
        None
    } else {
        Some((sum / n as f64).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> CorrespondenceSet {
        CorrespondenceSet::from_pairs([
            ([0.0, 0.0], [10.0, 20.0]),
            ([1.0, 0.0], [11.0, 20.0]),
            ([2.0, 0.0], [12.0, 20.0]),
            ([3.0, 0.0], [13.0, 20.0]),
        ])
    }

    #[test]
    fn select_keeps_pairs_together() {
        let set = sample_set();
        let kept = set.select(&[true, false, true, false]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept.as_slice()[0], Correspondence::new([0.0, 0.0], [10.0, 20.0]));
        assert_eq!(kept.as_slice()[1], Correspondence::new([2.0, 0.0], [12.0, 20.0]));
    }

    #[test]
    fn map_targets_drops_whole_pair_on_rejection() {
        let set = sample_set();
        let mapped = set.map_targets(|t| (t[0] < 12.0).then_some([t[0] * 2.0, t[1]]));
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped.sources(), vec![[0.0, 0.0], [1.0, 0.0]]);
        assert_eq!(mapped.targets(), vec![[20.0, 20.0], [22.0, 20.0]]);
    }

    #[test]
    fn non_finite_pairs_are_never_stored() {
        let mut set = CorrespondenceSet::new();
        set.push([f64::NAN, 1.0], [1.0, 1.0]);
        set.push([1.0, 1.0], [f64::INFINITY, 1.0]);
        set.push([1.0, 1.0], [2.0, 2.0]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn serializes_as_plain_list() {
        let set = CorrespondenceSet::from_pairs([([1.0, 2.0], [3.0, 4.0])]);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"[{"source":[1.0,2.0],"target":[3.0,4.0]}]"#);
        let back: CorrespondenceSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn swapped_exchanges_columns() {
        let set = sample_set().swapped();
        assert_eq!(set.as_slice()[1].source, [11.0, 20.0]);
        assert_eq!(set.as_slice()[1].target, [1.0, 0.0]);
    }

    #[test]
    fn mean_and_p95_handles_empty_and_non_empty_errors() {
        let mut empty = Vec::<f64>::new();
        assert_eq!(mean_and_p95(&mut empty), (0.0, 0.0));

        let mut values = vec![0.4, 0.1, 0.2, 0.3, 0.5];
        let (mean, p95) = mean_and_p95(&mut values);
        assert!((mean - 0.3).abs() < 1e-12);
        assert!((p95 - 0.5).abs() < 1e-12);
    }

    #[test]
    fn rms_skips_non_finite() {
        assert_eq!(rms(&[]), None);
        let r = rms(&[3.0, f64::NAN, 4.0]).unwrap();
        assert!((r - (12.5f64).sqrt()).abs() < 1e-12);
    }
}
