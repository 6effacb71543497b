//! Task-id extraction from free text (prompts, transcripts).

use std::sync::LazyLock;

use regex::Regex;

/// Ordered from most to least specific; the first pattern that matches wins.
static PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\*\*Task ID:\*\* ?(T\d+)",
        r"(?i)Task ID:? ?(T\d+)",
        r"(?i)Task:? ?(T\d+)",
        r"^(T\d+)[: -]",
        r"(?i)(?:implement|fix|complete|execute|run|start|do|work on|working on) (T\d+)",
        r"(T\d+) [A-Z]",
        r"\b(T\d+)\b",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

static CANONICAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*Task ID:\*\* ?T\d+").unwrap());

pub fn extract_task_id(text: &str) -> Option<String> {
    PATTERNS.iter().find_map(|re| {
        re.captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    })
}

/// True when the prompt uses the `**Task ID:** T<n>` form.
pub fn is_canonical_format(text: &str) -> bool {
    CANONICAL_RE.is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_marker_wins_over_earlier_mentions() {
        let text = "Depends on T1.\n**Task ID:** T7\nImplement the parser";
        assert_eq!(extract_task_id(text).as_deref(), Some("T7"));
        assert!(is_canonical_format(text));
    }

    #[test]
    fn loose_forms_are_recognized() {
        assert_eq!(extract_task_id("Task T12 please").as_deref(), Some("T12"));
        assert_eq!(extract_task_id("T4: wire config").as_deref(), Some("T4"));
        assert_eq!(extract_task_id("please implement T9 now").as_deref(), Some("T9"));
        assert_eq!(extract_task_id("then T5 Adds things").as_deref(), Some("T5"));
        assert_eq!(extract_task_id("see (T2)").as_deref(), Some("T2"));
    }

    #[test]
    fn no_task_id_returns_none() {
        assert_eq!(extract_task_id("refactor the module"), None);
        assert_eq!(extract_task_id("T1000x"), None);
    }
}
