//! Keyword retrieval over the markdown knowledge index.

use crate::core::terms::term_signature;
use crate::core::types::Task;

/// Category sections of the knowledge index, highest priority first.
const CATEGORIES: &[(&str, usize)] = &[
    ("constraint", 0),
    ("decision", 1),
    ("unresolved", 2),
    ("gotcha", 3),
    ("pattern", 4),
];
const UNCATEGORIZED: usize = CATEGORIES.len();

#[derive(Debug)]
struct Candidate<'a> {
    line: &'a str,
    category: usize,
    position: usize,
}

/// Select index lines relevant to `task`.
///
/// A line is relevant when it shares at least one term with the task id,
/// title, description, or libraries. Relevant lines are ordered by category
/// priority, then by their position in the document, and cut to `max_lines`.
pub fn retrieve_relevant_knowledge(task: &Task, index_md: &str, max_lines: usize) -> Vec<String> {
    let task_terms = term_signature(
        [task.id.as_str(), task.title.as_str(), task.description.as_str()]
            .into_iter()
            .chain(task.libraries.iter().map(String::as_str)),
    );
    if task_terms.is_empty() || max_lines == 0 {
        return Vec::new();
    }

    let mut category = UNCATEGORIZED;
    let mut candidates = Vec::new();
    for (position, raw) in index_md.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('#') {
            category = heading_category(line);
            continue;
        }
        let line_terms = term_signature([line]);
        if line_terms.intersection(&task_terms).next().is_some() {
            candidates.push(Candidate {
                line,
                category,
                position,
            });
        }
    }

    candidates.sort_by_key(|candidate| (candidate.category, candidate.position));
    candidates
        .into_iter()
        .take(max_lines)
        .map(|candidate| candidate.line.to_string())
        .collect()
}

fn heading_category(heading: &str) -> usize {
    let lower = heading.to_lowercase();
    CATEGORIES
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map_or(UNCATEGORIZED, |(_, rank)| *rank)
}
