//! Corpus loading and label bookkeeping.
//!
//! The corpus is the labeled person-name XML dump flattened to one annotated
//! name per line. Everything here is pure string work; the only I/O is
//! [`load_corpus`].

use std::collections::{HashMap, HashSet};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

/// Wrapper elements that carry no label information.
const STRUCTURAL_TAGS: &[&str] = &["<NameCollection>", "</NameCollection>", "<Name>", "</Name>"];

static OPENING_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<([a-zA-Z]+)>").expect("Invalid opening tag regex"));

static ANY_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</?[a-zA-Z]+>").expect("Invalid tag regex"));

#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error("failed to read corpus {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corpus {0} contains no lines")]
    Empty(String),
}

/// Strip structural wrappers, decode `&amp;`, trim lines and drop empty ones.
pub fn clean_corpus(raw: &str) -> Vec<String> {
    let mut text = raw.to_string();
    for tag in STRUCTURAL_TAGS {
        text = text.replace(tag, "");
    }
    let text = text.replace("&amp;", "&");

    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read and clean a corpus file.
pub fn load_corpus(path: impl AsRef<Path>) -> Result<Vec<String>, CorpusError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| CorpusError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let lines = clean_corpus(&raw);
    if lines.is_empty() {
        return Err(CorpusError::Empty(path.display().to_string()));
    }
    Ok(lines)
}

/// Labels of all opening tags in `line`, in order of appearance.
///
/// Closing tags are ignored and duplicates are kept, so
/// `<GivenName>A</GivenName> <GivenName>B</GivenName>` yields two entries.
pub fn extract_labels(line: &str) -> Vec<String> {
    OPENING_TAG
        .captures_iter(line)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Remove every markup tag, leaving the raw name text.
pub fn strip_tags(line: &str) -> String {
    ANY_TAG.replace_all(line, "").into_owned()
}

/// Label frequency table over a set of lines.
#[derive(Debug, Clone, Default)]
pub struct LabelCounts {
    counts: HashMap<String, usize>,
    /// First-seen order, used to break count ties deterministically.
    order: Vec<String>,
}

impl LabelCounts {
    pub fn add(&mut self, label: &str) {
        match self.counts.get_mut(label) {
            Some(n) => *n += 1,
            None => {
                self.counts.insert(label.to_string(), 1);
                self.order.push(label.to_string());
            }
        }
    }

    pub fn get(&self, label: &str) -> usize {
        self.counts.get(label).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Labels with counts, most frequent first; ties keep first-seen order.
    pub fn most_common(&self) -> Vec<(String, usize)> {
        let mut out: Vec<(String, usize)> = self
            .order
            .iter()
            .map(|label| (label.clone(), self.get(label)))
            .collect();
        // Stable sort keeps first-seen order among equal counts.
        out.sort_by(|a, b| b.1.cmp(&a.1));
        out
    }
}

/// Count every label occurrence across `lines`.
pub fn count_labels<S: AsRef<str>>(lines: &[S]) -> LabelCounts {
    let mut counts = LabelCounts::default();
    for line in lines {
        for label in extract_labels(line.as_ref()) {
            counts.add(&label);
        }
    }
    counts
}

/// Every `stride`-th line becomes an example, the rest are test lines.
pub fn split_by_stride(lines: &[String], stride: usize) -> (Vec<String>, Vec<String>) {
    let stride = stride.max(1);
    let mut examples = Vec::new();
    let mut test = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if i % stride == 0 {
            examples.push(line.clone());
        } else {
            test.push(line.clone());
        }
    }
    (examples, test)
}

/// Lines not literally present in `examples`, in original order.
pub fn exclude_examples(lines: &[String], examples: &[String]) -> Vec<String> {
    let examples: HashSet<&str> = examples.iter().map(String::as_str).collect();
    lines
        .iter()
        .filter(|line| !examples.contains(line.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_drops_wrappers_and_decodes_ampersand() {
        let raw = "<NameCollection>\n  <Name><GivenName>Bo</GivenName> <And>&amp;</And></Name>\n\n   \n</NameCollection>\n";
        let lines = clean_corpus(raw);
        assert_eq!(lines, vec!["<GivenName>Bo</GivenName> <And>&</And>"]);
    }

    #[test]
    fn extract_labels_keeps_order_and_duplicates() {
        let line = "<GivenName>A</GivenName> <Surname>B</Surname> <GivenName>C</GivenName>";
        assert_eq!(extract_labels(line), vec!["GivenName", "Surname", "GivenName"]);
        assert!(extract_labels("John Smith").is_empty());
    }

    #[test]
    fn strip_tags_returns_raw_text() {
        let line = "<GivenName>William</GivenName> <And>&</And> <Surname>Coody</Surname>";
        assert_eq!(strip_tags(line), "William & Coody");
    }

    #[test]
    fn most_common_breaks_ties_by_first_appearance() {
        let lines = vec![
            "<B>x</B> <A>y</A>".to_string(),
            "<A>p</A> <C>q</C> <B>z</B>".to_string(),
        ];
        let counts = count_labels(&lines);
        assert_eq!(
            counts.most_common(),
            vec![("B".to_string(), 2), ("A".to_string(), 2), ("C".to_string(), 1)]
        );
        assert_eq!(counts.get("A"), 2);
    }

    #[test]
    fn stride_split_takes_every_nth_line() {
        let lines: Vec<String> = (0..7).map(|i| i.to_string()).collect();
        let (examples, test) = split_by_stride(&lines, 3);
        assert_eq!(examples, vec!["0", "3", "6"]);
        assert_eq!(test, vec!["1", "2", "4", "5"]);
    }

    #[test]
    fn exclude_examples_keeps_order() {
        let lines: Vec<String> = ["a", "b", "c", "b"].iter().map(|s| s.to_string()).collect();
        let examples = vec!["b".to_string()];
        assert_eq!(exclude_examples(&lines, &examples), vec!["a", "c"]);
    }
}
