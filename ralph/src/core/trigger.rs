//! Compaction trigger evaluation.
//!
//! Triggers are checked in fixed priority order and the first match wins:
//! task metadata, novelty, byte threshold, then the periodic interval.

use serde::Serialize;

use crate::core::terms::{overlap_ratio, term_signature};
use crate::core::types::Task;

/// Thresholds for the trigger rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerThresholds {
    /// Novelty fires when overlap falls below this ratio.
    pub novelty_threshold: f64,
    /// Byte trigger fires when handoff bytes since compaction exceed this.
    pub threshold_bytes: u64,
    /// Periodic trigger fires when coding iterations reach this count.
    pub interval: u32,
}

impl Default for TriggerThresholds {
    fn default() -> Self {
        Self {
            novelty_threshold: 0.25,
            threshold_bytes: 32_000,
            interval: 5,
        }
    }
}

/// History the trigger rules look at.
#[derive(Debug, Clone, Copy)]
pub struct TriggerInputs<'a> {
    pub next_task: &'a Task,
    /// Summaries of the most recent handoffs (novelty window).
    pub recent_summaries: &'a [String],
    pub handoff_bytes_since_compaction: u64,
    pub coding_iterations_since_compaction: u32,
}

/// Which rule fired.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum CompactionTrigger {
    TaskMetadata,
    Novelty { overlap: f64 },
    ByteThreshold { bytes: u64 },
    Periodic { iterations: u32 },
}

impl CompactionTrigger {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskMetadata => "task_metadata",
            Self::Novelty { .. } => "novelty",
            Self::ByteThreshold { .. } => "byte_threshold",
            Self::Periodic { .. } => "periodic",
        }
    }
}

/// Return the first trigger that fires, if any.
pub fn evaluate_trigger(
    inputs: &TriggerInputs<'_>,
    thresholds: &TriggerThresholds,
) -> Option<CompactionTrigger> {
    let task = inputs.next_task;
    if task.needs_docs || !task.libraries.is_empty() {
        return Some(CompactionTrigger::TaskMetadata);
    }

    if let Some(overlap) = novelty_overlap(task, inputs.recent_summaries)
        && overlap < thresholds.novelty_threshold
    {
        return Some(CompactionTrigger::Novelty { overlap });
    }

    if inputs.handoff_bytes_since_compaction > thresholds.threshold_bytes {
        return Some(CompactionTrigger::ByteThreshold {
            bytes: inputs.handoff_bytes_since_compaction,
        });
    }

    if thresholds.interval > 0 && inputs.coding_iterations_since_compaction >= thresholds.interval {
        return Some(CompactionTrigger::Periodic {
            iterations: inputs.coding_iterations_since_compaction,
        });
    }

    None
}

/// Overlap between the task's terms and the recent handoff terms.
///
/// `None` when the task yields no terms, so an empty signature never fires.
pub fn novelty_overlap(task: &Task, recent_summaries: &[String]) -> Option<f64> {
    let task_terms = term_signature(
        [task.title.as_str(), task.description.as_str()]
            .into_iter()
            .chain(task.libraries.iter().map(String::as_str)),
    );
    let recent_terms = term_signature(recent_summaries.iter().map(String::as_str));
    overlap_ratio(&task_terms, &recent_terms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::task;

    fn inputs<'a>(task: &'a Task, recent: &'a [String]) -> TriggerInputs<'a> {
        TriggerInputs {
            next_task: task,
            recent_summaries: recent,
            handoff_bytes_since_compaction: 0,
            coding_iterations_since_compaction: 1,
        }
    }

    fn titled(title: &str) -> Task {
        let mut t = task("t");
        t.title = title.to_string();
        t.description = String::new();
        t
    }

    #[test]
    fn zero_overlap_fires_novelty() {
        let next = titled("jq parser websocket");
        let recent = vec!["git rollback checkpoint".to_string()];
        let fired = evaluate_trigger(&inputs(&next, &recent), &TriggerThresholds::default());
        assert_eq!(fired, Some(CompactionTrigger::Novelty { overlap: 0.0 }));
    }

    #[test]
    fn identical_terms_do_not_fire() {
        let next = titled("git rollback checkpoint");
        let recent = vec!["checkpoint rollback git".to_string()];
        let fired = evaluate_trigger(&inputs(&next, &recent), &TriggerThresholds::default());
        assert_eq!(fired, None);
    }

    #[test]
    fn task_metadata_wins_over_everything() {
        let mut next = titled("jq parser websocket");
        next.libraries = vec!["serde".to_string()];
        let recent = Vec::new();
        let mut input = inputs(&next, &recent);
        input.handoff_bytes_since_compaction = 1_000_000;
        input.coding_iterations_since_compaction = 99;
        let fired = evaluate_trigger(&input, &TriggerThresholds::default());
        assert_eq!(fired, Some(CompactionTrigger::TaskMetadata));
    }

    #[test]
    fn byte_threshold_precedes_periodic() {
        let next = titled("git rollback");
        let recent = vec!["git rollback".to_string()];
        let mut input = inputs(&next, &recent);
        input.handoff_bytes_since_compaction = 32_001;
        input.coding_iterations_since_compaction = 5;
        assert_eq!(
            evaluate_trigger(&input, &TriggerThresholds::default()),
            Some(CompactionTrigger::ByteThreshold { bytes: 32_001 })
        );

        input.handoff_bytes_since_compaction = 32_000;
        assert_eq!(
            evaluate_trigger(&input, &TriggerThresholds::default()),
            Some(CompactionTrigger::Periodic { iterations: 5 })
        );
    }

    #[test]
    fn task_without_terms_never_fires_novelty() {
        let next = titled("do it");
        let recent = vec!["completely unrelated".to_string()];
        assert_eq!(novelty_overlap(&next, &recent), None);
        assert_eq!(
            evaluate_trigger(&inputs(&next, &recent), &TriggerThresholds::default()),
            None
        );
    }
}
