//! Context budget enforcement for assembled prompts.
//!
//! Budgets are expressed in tokens and converted at a fixed
//! [`CHARS_PER_TOKEN`]. Sectioned prompts (markdown `## ` headers naming a
//! known section) lose whole sections from the lowest priority upward;
//! anything else is sliced.

/// Approximate characters per token used for budget conversion.
pub const CHARS_PER_TOKEN: usize = 4;

pub const CURRENT_TASK: &str = "Current Task";
pub const FAILURE_CONTEXT: &str = "Failure Context";
pub const RETRIEVED_MEMORY: &str = "Retrieved Memory";
pub const PREVIOUS_HANDOFF: &str = "Previous Handoff";
pub const RETRIEVED_PROJECT_MEMORY: &str = "Retrieved Project Memory";
pub const ACCUMULATED_KNOWLEDGE: &str = "Accumulated Knowledge";
pub const SKILLS: &str = "Skills";
pub const OUTPUT_INSTRUCTIONS: &str = "Output Instructions";
pub const TRUNCATION_METADATA: &str = "Context Truncation";

/// Section names from highest to lowest survival priority.
pub const SECTION_PRIORITY: &[&str] = &[
    CURRENT_TASK,
    FAILURE_CONTEXT,
    RETRIEVED_MEMORY,
    PREVIOUS_HANDOFF,
    RETRIEVED_PROJECT_MEMORY,
    ACCUMULATED_KNOWLEDGE,
    SKILLS,
    OUTPUT_INSTRUCTIONS,
];

/// Result of fitting content into a budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncated {
    pub content: String,
    /// Evicted section names, in eviction order.
    pub evicted: Vec<String>,
    /// True when unstructured text was sliced.
    pub sliced: bool,
    pub original_chars: usize,
    pub budget_chars: usize,
}

impl Truncated {
    pub fn was_truncated(&self) -> bool {
        self.sliced || !self.evicted.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Section<'a> {
    name: Option<&'a str>,
    text: &'a str,
}

/// Fit `content` into `budget_tokens`.
pub fn truncate_to_budget(content: &str, budget_tokens: usize) -> Truncated {
    let budget_chars = budget_tokens.saturating_mul(CHARS_PER_TOKEN);
    let original_chars = content.chars().count();
    if original_chars <= budget_chars {
        return Truncated {
            content: content.to_string(),
            evicted: Vec::new(),
            sliced: false,
            original_chars,
            budget_chars,
        };
    }

    let sections = split_sections(content);
    if sections.iter().any(|section| section.name.is_some()) {
        evict_sections(sections, original_chars, budget_chars)
    } else {
        slice_text(content, original_chars, budget_chars)
    }
}

fn slice_text(content: &str, original_chars: usize, budget_chars: usize) -> Truncated {
    let mut out: String = content.chars().take(budget_chars).collect();
    out.push_str(&format!(
        "\n\n[truncated: {original_chars} chars exceeded limit of {budget_chars} chars]"
    ));
    Truncated {
        content: out,
        evicted: Vec::new(),
        sliced: true,
        original_chars,
        budget_chars,
    }
}

fn evict_sections(
    mut sections: Vec<Section<'_>>,
    original_chars: usize,
    budget_chars: usize,
) -> Truncated {
    let mut evicted: Vec<String> = Vec::new();
    loop {
        let rendered = render(&sections, &evicted, original_chars, budget_chars);
        if rendered.chars().count() <= budget_chars {
            return done(rendered, evicted, original_chars, budget_chars);
        }
        let Some(victim) = lowest_priority_evictable(&sections) else {
            return done(rendered, evicted, original_chars, budget_chars);
        };
        let removed = sections.remove(victim);
        if let Some(name) = removed.name {
            evicted.push(name.to_string());
        }
    }
}

fn done(
    content: String,
    evicted: Vec<String>,
    original_chars: usize,
    budget_chars: usize,
) -> Truncated {
    Truncated {
        content,
        evicted,
        sliced: false,
        original_chars,
        budget_chars,
    }
}

/// Index of the lowest-priority section still present. The preamble and
/// Current Task stay.
fn lowest_priority_evictable(sections: &[Section<'_>]) -> Option<usize> {
    sections
        .iter()
        .enumerate()
        .filter_map(|(i, section)| {
            let name = section.name.filter(|name| *name != CURRENT_TASK)?;
            let rank = SECTION_PRIORITY.iter().position(|known| *known == name)?;
            Some((rank, i))
        })
        .max()
        .map(|(_, i)| i)
}

fn render(
    sections: &[Section<'_>],
    evicted: &[String],
    original_chars: usize,
    budget_chars: usize,
) -> String {
    let mut parts: Vec<String> = sections
        .iter()
        .map(|section| section.text.trim_end().to_string())
        .filter(|text| !text.is_empty())
        .collect();
    if !evicted.is_empty() {
        parts.push(format!(
            "## {TRUNCATION_METADATA}\nContext exceeded the budget ({original_chars} chars, limit {budget_chars} chars). Evicted sections: {}.",
            evicted.join(", ")
        ));
    }
    let mut out = parts.join("\n\n");
    out.push('\n');
    out
}

/// Split on `## ` headers naming a known section, first occurrence only.
/// Text before the first header is an unnamed preamble; any other `## `
/// line belongs to the section it appears in.
fn split_sections(content: &str) -> Vec<Section<'_>> {
    let mut starts: Vec<(usize, &str)> = Vec::new();
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        if let Some(name) = line.strip_prefix("## ").map(str::trim)
            && SECTION_PRIORITY.contains(&name)
            && !starts.iter().any(|(_, seen)| *seen == name)
        {
            starts.push((offset, name));
        }
        offset += line.len();
    }

    let mut sections = Vec::new();
    let first = starts.first().map_or(content.len(), |(start, _)| *start);
    if first > 0 {
        sections.push(Section {
            name: None,
            text: &content[..first],
        });
    }
    for (i, (start, name)) in starts.iter().enumerate() {
        let end = starts.get(i + 1).map_or(content.len(), |(next, _)| *next);
        sections.push(Section {
            name: Some(name),
            text: &content[*start..end],
        });
    }
    sections
}

/// Push `## ` lines in embedded text down a level so they cannot pose as
/// prompt sections.
pub fn demote_headings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        if line.starts_with("## ") {
            out.push('#');
        }
        out.push_str(line);
    }
    out
}
