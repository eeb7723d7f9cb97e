//! Progress normalization against a loaded definition.

use crate::types::{normalize_page_num, page_num, FlowDefinition, FlowProgress};

/// Reconcile raw progress with the definition it belongs to.
///
/// A composite `M<step>:<page>` token in `module_page_num` replaces the step
/// index and page; then the step index is clamped into the step range.
/// Fields other than step and page are carried over.
pub fn normalize_progress(progress: Option<FlowProgress>, definition: &FlowDefinition) -> FlowProgress {
    let mut normalized = progress.unwrap_or_default();
    let mut step_index = normalized.step_index;
    let mut module_page_num = normalize_page_num(normalized.module_page_num.as_deref());

    if let Some(composite) = module_page_num.as_deref().and_then(page_num::decode) {
        step_index = i64::try_from(composite.step_index).unwrap_or(i64::MAX);
        module_page_num = Some(composite.sub_page_num);
    }

    normalized.step_index = definition.clamp_step_index(step_index) as i64;
    normalized.module_page_num = module_page_num;
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn five_steps() -> FlowDefinition {
        FlowDefinition::from_submodules("f", ["a", "b", "c", "d", "e"])
    }

    #[test]
    fn test_composite_page_is_decomposed() {
        let normalized = normalize_progress(Some(FlowProgress::at(0, Some("M2:7"))), &five_steps());
        assert_eq!(normalized.step_index, 2);
        assert_eq!(normalized.module_page_num.as_deref(), Some("7"));
    }

    #[test]
    fn test_composite_step_is_clamped() {
        let normalized = normalize_progress(Some(FlowProgress::at(1, Some("M40:3"))), &five_steps());
        assert_eq!(normalized.step_index, 4);
        assert_eq!(normalized.module_page_num.as_deref(), Some("3"));
    }

    #[test]
    fn test_plain_page_is_trimmed_and_kept() {
        let normalized = normalize_progress(Some(FlowProgress::at(-3, Some(" 5 "))), &five_steps());
        assert_eq!(normalized.step_index, 0);
        assert_eq!(normalized.module_page_num.as_deref(), Some("5"));
    }

    #[test]
    fn test_missing_progress_starts_at_zero() {
        let normalized = normalize_progress(None, &five_steps());
        assert_eq!(normalized.step_index, 0);
        assert_eq!(normalized.module_page_num, None);
    }

    #[test]
    fn test_completion_flag_survives() {
        let mut progress = FlowProgress::at(9, Some(""));
        progress.completed = Some(true);
        let normalized = normalize_progress(Some(progress), &five_steps());
        assert_eq!(normalized.step_index, 4);
        assert_eq!(normalized.module_page_num, None);
        assert!(normalized.is_completed());
    }
}
