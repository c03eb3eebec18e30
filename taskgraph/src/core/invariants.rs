//! Plan invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::core::types::{MAIN_RESULT, Subtask};

/// Check plan invariants:
/// - No empty or duplicate ids
/// - Every subtask declares a `main_result` output
pub fn validate_plan(subtasks: &[Subtask]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for (index, subtask) in subtasks.iter().enumerate() {
        if subtask.id.trim().is_empty() {
            errors.push(format!("subtask at position {index} has an empty id"));
        } else if !seen.insert(subtask.id.as_str()) {
            errors.push(format!("duplicate id '{}'", subtask.id));
        }
        if !subtask.output_files.contains_key(MAIN_RESULT) {
            errors.push(format!("{}: missing {MAIN_RESULT} output", subtask.id));
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::subtask;

    #[test]
    fn valid_plan_has_no_errors() {
        assert!(validate_plan(&[subtask("a"), subtask("b")]).is_empty());
    }

    #[test]
    fn reports_duplicates_and_missing_main_result() {
        let mut broken = subtask("a");
        broken.output_files.clear();
        let errors = validate_plan(&[subtask("a"), broken, subtask("")]);

        assert!(errors.iter().any(|e| e.contains("duplicate id 'a'")));
        assert!(errors.iter().any(|e| e.contains("missing main_result")));
        assert!(errors.iter().any(|e| e.contains("empty id")));
    }
}
