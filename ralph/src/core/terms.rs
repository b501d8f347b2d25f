//! Term signatures shared by the novelty trigger and knowledge retrieval.

use std::collections::BTreeSet;

/// Tokens must be longer than this many characters to count as terms.
const MIN_TERM_CHARS: usize = 2;

/// Lowercase, de-duplicated set of alphanumeric tokens longer than two chars.
pub fn term_signature<'a>(texts: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    let mut terms = BTreeSet::new();
    for text in texts {
        for token in text.split(|c: char| !c.is_alphanumeric()) {
            if token.chars().count() > MIN_TERM_CHARS {
                terms.insert(token.to_lowercase());
            }
        }
    }
    terms
}

/// `|task ∩ other| / |task|`, or `None` when the task has no terms.
pub fn overlap_ratio(task_terms: &BTreeSet<String>, other: &BTreeSet<String>) -> Option<f64> {
    if task_terms.is_empty() {
        return None;
    }
    let shared = task_terms.intersection(other).count();
    Some(shared as f64 / task_terms.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_lowercases_dedupes_and_drops_short_tokens() {
        let terms = term_signature(["Add the JQ parser; parser tests!", "ws io"]);
        let expected: BTreeSet<String> = ["add", "the", "parser", "tests"]
            .into_iter()
            .map(str::to_string)
            .collect();
        assert_eq!(terms, expected);
    }

    #[test]
    fn overlap_is_relative_to_task_terms() {
        let task = term_signature(["alpha beta gamma delta"]);
        let other = term_signature(["beta delta epsilon"]);
        assert_eq!(overlap_ratio(&task, &other), Some(0.5));
        assert_eq!(overlap_ratio(&BTreeSet::new(), &other), None);
    }
}
