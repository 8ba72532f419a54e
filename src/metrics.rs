//! Agreement ratios between predicted and reference annotations.

use crate::corpus::extract_labels;

/// Share of positions where the predicted line equals the reference exactly.
pub fn equal_line_ratio<S: AsRef<str>, T: AsRef<str>>(truth: &[S], pred: &[T]) -> f64 {
    agreement(truth, pred, |t, p| t == p)
}

/// Share of positions whose label sequences match, ignoring the tagged text.
pub fn equal_labels_ratio<S: AsRef<str>, T: AsRef<str>>(truth: &[S], pred: &[T]) -> f64 {
    agreement(truth, pred, |t, p| extract_labels(t) == extract_labels(p))
}

fn agreement<S, T, F>(truth: &[S], pred: &[T], same: F) -> f64
where
    S: AsRef<str>,
    T: AsRef<str>,
    F: Fn(&str, &str) -> bool,
{
    if truth.is_empty() {
        return 0.0;
    }
    let hits = truth
        .iter()
        .zip(pred)
        .filter(|(t, p)| same(t.as_ref(), p.as_ref()))
        .count();
    hits as f64 / truth.len() as f64
}
