//! Syntax gate for model output.
//!
//! A batch is rejected as a whole when too many of its lines are malformed.
//! Individual bad lines in an otherwise healthy batch pass through and show up
//! later as scoring misses.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default share of bad lines at which a batch is rejected.
pub const DEFAULT_INVALID_THRESHOLD: f64 = 0.1;

/// Labels of the person-name tagging scheme.
pub const PERSON_NAME_LABELS: &[&str] = &[
    "GivenName",
    "Surname",
    "MiddleName",
    "FirstInitial",
    "MiddleInitial",
    "LastInitial",
    "Nickname",
    "PrefixMarital",
    "PrefixOther",
    "SuffixGenerational",
    "SuffixOther",
    "And",
];

static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(/?)([a-zA-Z]+)\s*(/?)>").expect("Invalid tag scanner regex"));

/// Vocabulary of recognized labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeSet<String>);

impl LabelSet {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(labels.into_iter().map(Into::into).collect())
    }

    pub fn person_names() -> Self {
        Self::new(PERSON_NAME_LABELS.iter().copied())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.contains(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for LabelSet {
    fn default() -> Self {
        Self::person_names()
    }
}

/// Result of scanning one line for markup tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagScan {
    /// Names of opening and self-closing tags, in order.
    pub labels: Vec<String>,
    /// Names of closing tags, in order.
    pub closing: Vec<String>,
    /// A tag wraps no content: `<X/>` or `<X></X>`.
    pub has_empty_tag: bool,
    /// A closing tag does not match the innermost open element.
    pub has_mismatched_close: bool,
}

/// Scan `line` for tags, flagging elements that wrap no text and closing
/// tags that do not match what is open.
pub fn scan_tags(line: &str) -> TagScan {
    let mut scan = TagScan::default();
    // (name, end offset) of each open element.
    let mut open: Vec<(&str, usize)> = Vec::new();

    for caps in TAG.captures_iter(line) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(2)) else {
            continue;
        };
        let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
        let self_closing = caps.get(3).is_some_and(|m| !m.as_str().is_empty());

        if closing {
            scan.closing.push(name.as_str().to_string());
            match open.pop() {
                Some((opened, end)) if opened == name.as_str() => {
                    if line[end..whole.start()].trim().is_empty() {
                        scan.has_empty_tag = true;
                    }
                }
                _ => scan.has_mismatched_close = true,
            }
            continue;
        }

        scan.labels.push(name.as_str().to_string());
        if self_closing {
            scan.has_empty_tag = true;
        } else {
            open.push((name.as_str(), whole.end()));
        }
    }

    scan
}

/// A line is bad when it has no tags, an unknown tag (opening or closing),
/// an empty tag, or a closing tag that does not match its element.
pub fn is_bad_line(line: &str, valid_labels: &LabelSet) -> bool {
    let scan = scan_tags(line);
    scan.labels.is_empty()
        || scan.has_empty_tag
        || scan.has_mismatched_close
        || scan
            .labels
            .iter()
            .chain(&scan.closing)
            .any(|l| !valid_labels.contains(l))
}

/// Whether the share of bad lines reaches `threshold` (inclusive).
///
/// An empty result is never rejected here; the length check catches it.
pub fn has_invalid_syntax<S: AsRef<str>>(
    results: &[S],
    valid_labels: &LabelSet,
    threshold: f64,
) -> bool {
    if results.is_empty() {
        return false;
    }
    let bad = results
        .iter()
        .filter(|line| is_bad_line(line.as_ref(), valid_labels))
        .count();
    bad as f64 / results.len() as f64 >= threshold
}
