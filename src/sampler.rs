//! Label-balanced example selection.
//!
//! Picks a small set of annotated lines so that every label in the corpus is
//! shown in at least `min_per_label` of them, serving the rarest labels first.
//! The random generator is owned by the caller; [`select_examples`] seeds a
//! fresh `StdRng` per call so the same seed and corpus always give the same set.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::corpus::{count_labels, extract_labels};

/// Parameters for one selection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Desired number of examples.
    #[serde(default = "default_size")]
    pub size: usize,
    /// Best-effort minimum number of chosen lines containing each label.
    #[serde(default = "default_min_per_label")]
    pub min_per_label: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_size() -> usize {
    30
}

fn default_min_per_label() -> usize {
    3
}

fn default_seed() -> u64 {
    12345
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            size: default_size(),
            min_per_label: default_min_per_label(),
            seed: default_seed(),
        }
    }
}

/// Select examples with a generator seeded from `config.seed`.
pub fn select_examples(corpus: &[String], config: &SelectionConfig) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    select_examples_with_rng(corpus, config.size, config.min_per_label, &mut rng)
}

/// Select up to `size` distinct lines, covering each label `min_per_label` times
/// where the corpus allows it. Returned lines are sorted.
pub fn select_examples_with_rng<R: Rng + ?Sized>(
    corpus: &[String],
    size: usize,
    min_per_label: usize,
    rng: &mut R,
) -> Vec<String> {
    // Distinct samples in corpus order; equality is by exact text.
    let mut seen = HashSet::new();
    let samples: Vec<&str> = corpus
        .iter()
        .map(String::as_str)
        .filter(|s| seen.insert(*s))
        .collect();

    let labels = count_labels(corpus);
    let mut index: HashMap<String, Vec<&str>> = HashMap::new();
    for sample in samples.iter().copied() {
        let unique: HashSet<String> = extract_labels(sample).into_iter().collect();
        for label in unique {
            index.entry(label).or_default().push(sample);
        }
    }

    // Rarest first; among equal counts the later-seen label goes first.
    let mut order = labels.most_common();
    order.reverse();
    order.sort_by_key(|(_, count)| *count);

    let mut picked: HashMap<String, usize> = HashMap::new();
    let mut chosen: HashSet<&str> = HashSet::new();

    for (label, _) in &order {
        let candidates = index.get(label).map(Vec::as_slice).unwrap_or(&[]);
        // Only this label draws from the pool while its quota is open.
        let mut pool: Vec<&str> = candidates
            .iter()
            .copied()
            .filter(|s| !chosen.contains(s))
            .collect();
        while picked.get(label).copied().unwrap_or(0) < min_per_label && chosen.len() < size {
            if pool.is_empty() {
                debug!(
                    label = %label,
                    picked = picked.get(label).copied().unwrap_or(0),
                    min_per_label,
                    "Label quota under-satisfied"
                );
                break;
            }

            let sample = pool.swap_remove(rng.gen_range(0..pool.len()));
            chosen.insert(sample);

            let in_sample: HashSet<String> = extract_labels(sample).into_iter().collect();
            for lbl in in_sample {
                *picked.entry(lbl).or_insert(0) += 1;
            }
        }
    }

    let mut pool: Vec<&str> = samples
        .iter()
        .copied()
        .filter(|s| !chosen.contains(s))
        .collect();
    while chosen.len() < size && !pool.is_empty() {
        chosen.insert(pool.swap_remove(rng.gen_range(0..pool.len())));
    }

    let mut out: Vec<String> = chosen.into_iter().map(str::to_string).collect();
    out.sort();
    out
}

/// Number of selected lines containing each label at least once.
pub fn label_coverage(examples: &[String]) -> HashMap<String, usize> {
    let mut coverage = HashMap::new();
    for line in examples {
        let labels: HashSet<String> = extract_labels(line).into_iter().collect();
        for label in labels {
            *coverage.entry(label).or_insert(0) += 1;
        }
    }
    coverage
}
