use std::collections::HashSet;

use nametag_harness::corpus::{exclude_examples, extract_labels};
use nametag_harness::sampler::{label_coverage, select_examples, SelectionConfig};

fn corpus() -> Vec<String> {
    let mut lines = Vec::new();
    for i in 0..50 {
        lines.push(format!(
            "<GivenName>G{i}</GivenName> <Surname>S{i}</Surname>"
        ));
    }
    for i in 0..6 {
        lines.push(format!(
            "<GivenName>N{i}</GivenName> <Nickname>Nick{i}</Nickname> <Surname>T{i}</Surname>"
        ));
    }
    for i in 0..4 {
        lines.push(format!(
            "<PrefixMarital>Mrs</PrefixMarital> <Surname>P{i}</Surname>"
        ));
    }
    // Scarcer than the quota.
    lines.push("<GivenName>Al</GivenName> <Surname>Gore</Surname> <SuffixGenerational>Jr</SuffixGenerational>".to_string());
    lines.push("<Surname>King</Surname> <SuffixGenerational>III</SuffixGenerational>".to_string());
    lines
}

fn config(size: usize, min_per_label: usize, seed: u64) -> SelectionConfig {
    SelectionConfig {
        size,
        min_per_label,
        seed,
    }
}

#[test]
fn size_is_min_of_target_and_corpus_without_duplicates() {
    let corpus = corpus();
    for (size, seed) in [(0, 1), (5, 2), (30, 3), (62, 4), (500, 5)] {
        let out = select_examples(&corpus, &config(size, 3, seed));
        assert_eq!(out.len(), size.min(corpus.len()), "size={size}");

        let unique: HashSet<&String> = out.iter().collect();
        assert_eq!(unique.len(), out.len());
        assert!(out.iter().all(|line| corpus.contains(line)));
    }
}

#[test]
fn output_is_sorted() {
    let out = select_examples(&corpus(), &config(20, 3, 99));
    let mut sorted = out.clone();
    sorted.sort();
    assert_eq!(out, sorted);
}

#[test]
fn same_seed_same_selection() {
    let corpus = corpus();
    let a = select_examples(&corpus, &config(25, 3, 12345));
    let b = select_examples(&corpus, &config(25, 3, 12345));
    assert_eq!(a, b);

    let any_differs = (0..10u64)
        .map(|seed| select_examples(&corpus, &config(25, 3, seed)))
        .any(|other| other != a);
    assert!(any_differs, "seed should influence the selection");
}

#[test]
fn every_label_with_enough_candidates_is_covered() {
    let corpus = corpus();
    let k = 3;
    for seed in 0..20u64 {
        let out = select_examples(&corpus, &config(20, k, seed));
        let coverage = label_coverage(&out);
        for label in ["GivenName", "Surname", "Nickname", "PrefixMarital"] {
            assert!(
                coverage.get(label).copied().unwrap_or(0) >= k,
                "seed={seed} label={label} coverage={coverage:?}"
            );
        }
        // Only two candidates exist; both must be taken.
        assert_eq!(coverage.get("SuffixGenerational"), Some(&2), "seed={seed}");
    }
}

#[test]
fn rare_label_lines_force_inclusion() {
    let corpus: Vec<String> = ["<A>x</A> <B>y</B>", "<A>p</A>", "<A>q</A> <C>r</C>"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let out = select_examples(&corpus, &config(3, 1, 42));
    let mut expected = corpus.clone();
    expected.sort();
    assert_eq!(out, expected);
}

#[test]
fn remainder_is_disjoint_from_examples() {
    let corpus = corpus();
    let examples = select_examples(&corpus, &config(12, 2, 7));
    let test = exclude_examples(&corpus, &examples);
    assert_eq!(test.len() + examples.len(), corpus.len());
    assert!(test.iter().all(|line| !examples.contains(line)));
    assert!(test.iter().all(|line| !extract_labels(line).is_empty()));
}
