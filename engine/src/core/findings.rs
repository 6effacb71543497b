//! Review and spec-check findings extracted from agent output.
//!
//! Structured markers are authoritative; when a transcript contains several
//! marker blocks (a template example followed by real output), the last block
//! carrying a numeric count wins. A missing count is an evidence-capture
//! failure, reported as [`Capture::Missing`].

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::Capture;
use crate::graph::{ReviewStatus, SpecCheck, Task};

const MACHINE_SUMMARY: &str = "### Machine Summary";
const SPEC_CHECK_COUNT_MARKER: &str = "SPEC_CHECK_CRITICAL_COUNT:";
const SPEC_CHECK_WAVE_MARKER: &str = "SPEC_CHECK_WAVE:";

pub const EVIDENCE_CAPTURE_FAILED: &str = "EVIDENCE_CAPTURE_FAILED";

static SUMMARY_CRITICAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\s\-*]*\*{0,2}CRITICAL(?::\*{0,2}|\*{0,2}:)\s*(.*)").unwrap()
});
static SUMMARY_ADVISORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\s\-*]*\*{0,2}ADVISORY(?::\*{0,2}|\*{0,2}:)\s*(.*)").unwrap()
});
static CRITICAL_COUNT_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^CRITICAL_COUNT:\s*(\d+)").unwrap());
static CRITICAL_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CRITICAL_COUNT:\s*(\d+)").unwrap());
static LEGACY_CRITICAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"### Critical Findings[\s\S]*?(?:### |\z)").unwrap());
static LEGACY_ADVISORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"### Advisory Findings[\s\S]*?(?:### |\z)").unwrap());
static LEGACY_BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^- (?:\*\*)?(.+?)(?:\*\*)?$").unwrap());

static MARKER_CRITICAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^CRITICAL:\s*(.*)").unwrap());
static MARKER_ADVISORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ADVISORY:\s*(.*)").unwrap());
static MARKER_HIGH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^HIGH:\s*(.*)").unwrap());
static MARKER_MEDIUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^MEDIUM:\s*(.*)").unwrap());

static SPEC_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"SPEC_CHECK_CRITICAL_COUNT:\s*(\d+)").unwrap());
static SPEC_HIGH_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"SPEC_CHECK_HIGH_COUNT:\s*(\d+)").unwrap());
static SPEC_VERDICT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"SPEC_CHECK_VERDICT:\s*(PASSED|BLOCKED)").unwrap());
static SPEC_WAVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"SPEC_CHECK_WAVE:\s*(\d+)").unwrap());

/// Findings from one review sub-agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewFindings {
    pub critical: Vec<String>,
    pub advisory: Vec<String>,
    pub critical_count: u32,
}

impl ReviewFindings {
    pub fn status(&self) -> ReviewStatus {
        if self.critical_count > 0 {
            ReviewStatus::Blocked
        } else {
            ReviewStatus::Passed
        }
    }
}

#[derive(Debug, Default)]
struct RawFindings {
    critical: Vec<String>,
    advisory: Vec<String>,
    critical_count: Option<u32>,
}

fn capture_number(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn capture_text(re: &Regex, line: &str) -> Option<String> {
    re.captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|text| !text.is_empty())
}

/// Each `### Machine Summary` block, trimmed at the next `###` heading.
fn summary_blocks(output: &str) -> Vec<&str> {
    output
        .match_indices(MACHINE_SUMMARY)
        .map(|(idx, _)| {
            let block = &output[idx..];
            match block[1..].find("\n###") {
                Some(end) => &block[..end + 1],
                None => block,
            }
        })
        .collect()
}

fn parse_machine_summary(output: &str) -> Option<RawFindings> {
    let blocks = summary_blocks(output);
    let block = blocks
        .iter()
        .rev()
        .find(|block| CRITICAL_COUNT_LINE_RE.is_match(block))
        .or_else(|| blocks.last())?;

    let mut findings = RawFindings {
        critical_count: capture_number(&CRITICAL_COUNT_LINE_RE, block),
        ..RawFindings::default()
    };
    for line in block.lines() {
        if let Some(text) = capture_text(&SUMMARY_CRITICAL_RE, line) {
            findings.critical.push(text);
        } else if let Some(text) = capture_text(&SUMMARY_ADVISORY_RE, line) {
            findings.advisory.push(text);
        }
    }
    Some(findings)
}

fn legacy_section(re: &Regex, output: &str) -> Vec<String> {
    let Some(section) = re.find(output) else {
        return Vec::new();
    };
    LEGACY_BULLET_RE
        .captures_iter(section.as_str())
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|text| text != "None")
        .collect()
}

fn parse_legacy_findings(output: &str) -> RawFindings {
    RawFindings {
        critical: legacy_section(&LEGACY_CRITICAL_RE, output),
        advisory: legacy_section(&LEGACY_ADVISORY_RE, output),
        critical_count: capture_number(&CRITICAL_COUNT_RE, output),
    }
}

/// Parse review output: Machine Summary first, free-text sections as fallback.
///
/// A positive count with no captured lines gets a synthesized finding so the
/// wave cannot pass on a parsing gap.
pub fn parse_review_findings(output: &str) -> Capture<ReviewFindings> {
    let raw = parse_machine_summary(output).unwrap_or_else(|| parse_legacy_findings(output));
    let Some(critical_count) = raw.critical_count else {
        return Capture::Missing;
    };

    let mut critical = raw.critical;
    if critical_count > 0 && critical.is_empty() {
        critical.push(format!(
            "Review output parsing failed - {critical_count} findings not captured"
        ));
    }
    Capture::Found(ReviewFindings {
        critical,
        advisory: raw.advisory,
        critical_count,
    })
}

/// Accumulate findings from one reviewer into a task. `blocked` is never demoted.
pub fn merge_findings(task: &mut Task, findings: &ReviewFindings) {
    if task.review_status != ReviewStatus::Blocked {
        task.review_status = findings.status();
    }
    task.critical_findings.extend(findings.critical.iter().cloned());
    task.advisory_findings.extend(findings.advisory.iter().cloned());
}

pub const REVIEW_CAPTURE_ERROR: &str = "CRITICAL_COUNT marker not found in agent output";

/// Record a review whose markers were not found. `blocked` is kept.
pub fn mark_review_capture_failed(task: &mut Task) {
    if task.review_status != ReviewStatus::Blocked {
        task.review_status = ReviewStatus::EvidenceCaptureFailed;
    }
    task.review_error = Some(REVIEW_CAPTURE_ERROR.to_string());
}

/// `CRITICAL:` / `ADVISORY:` lines supplied by hand.
pub fn parse_marker_lines(input: &str) -> (Vec<String>, Vec<String>) {
    let mut critical = Vec::new();
    let mut advisory = Vec::new();
    for line in input.lines() {
        if let Some(text) = capture_text(&MARKER_CRITICAL_RE, line) {
            critical.push(text);
        } else if let Some(text) = capture_text(&MARKER_ADVISORY_RE, line) {
            advisory.push(text);
        }
    }
    (critical, advisory)
}

/// Replace a task's critical findings with a manual review; existing
/// advisories are kept when none are supplied.
pub fn apply_manual_findings(task: &mut Task, critical: Vec<String>, advisory: Vec<String>) {
    task.review_status = if critical.is_empty() {
        ReviewStatus::Passed
    } else {
        ReviewStatus::Blocked
    };
    task.critical_findings = critical;
    if !advisory.is_empty() {
        task.advisory_findings = advisory;
    }
}

/// Parsed spec-alignment output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecCheckFindings {
    pub critical: Vec<String>,
    pub high: Vec<String>,
    pub medium: Vec<String>,
    pub critical_count: Option<u32>,
    pub high_count: Option<u32>,
    pub verdict: Option<String>,
    pub wave: Option<u32>,
}

/// Start of the authoritative spec-check block: the last numeric count marker
/// (or, failing that, the last textual one), widened back to the preceding
/// wave marker.
fn spec_check_block(output: &str) -> &str {
    let count_idx = SPEC_COUNT_RE
        .find_iter(output)
        .last()
        .map(|m| m.start())
        .or_else(|| output.rfind(SPEC_CHECK_COUNT_MARKER));
    let Some(count_idx) = count_idx else {
        return output;
    };
    let start = output[..count_idx]
        .rfind(SPEC_CHECK_WAVE_MARKER)
        .unwrap_or(0);
    &output[start..]
}

pub fn parse_spec_check_output(output: &str) -> SpecCheckFindings {
    let block = spec_check_block(output);
    let mut findings = SpecCheckFindings::default();

    for line in block.lines() {
        if let Some(text) = capture_text(&MARKER_CRITICAL_RE, line) {
            findings.critical.push(text);
        } else if let Some(text) = capture_text(&MARKER_HIGH_RE, line) {
            findings.high.push(text);
        } else if let Some(text) = capture_text(&MARKER_MEDIUM_RE, line) {
            findings.medium.push(text);
        }
    }

    findings.critical_count = capture_number(&SPEC_COUNT_RE, block);
    findings.high_count = capture_number(&SPEC_HIGH_COUNT_RE, block);
    findings.verdict = SPEC_VERDICT_RE
        .captures(block)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());
    findings.wave = capture_number(&SPEC_WAVE_RE, block);
    findings
}

pub const SPEC_CHECK_CAPTURE_ERROR: &str =
    "SPEC_CHECK_CRITICAL_COUNT marker not found - re-run /wave-gate";

/// Build the spec-check record. A missing count records a capture failure
/// instead of a verdict.
pub fn spec_check_record(
    findings: SpecCheckFindings,
    default_wave: u32,
    run_at: String,
) -> SpecCheck {
    let wave = findings.wave.unwrap_or(default_wave);
    match findings.critical_count {
        None => SpecCheck {
            wave,
            run_at,
            critical_count: None,
            high_count: None,
            critical_findings: Vec::new(),
            high_findings: Vec::new(),
            medium_findings: Vec::new(),
            verdict: EVIDENCE_CAPTURE_FAILED.to_string(),
            error: Some(SPEC_CHECK_CAPTURE_ERROR.to_string()),
        },
        Some(count) => SpecCheck {
            wave,
            run_at,
            critical_count: Some(count),
            high_count: Some(findings.high_count.unwrap_or(0)),
            critical_findings: findings.critical,
            high_findings: findings.high,
            medium_findings: findings.medium,
            verdict: findings.verdict.unwrap_or_else(|| "UNKNOWN".to_string()),
            error: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE_THEN_REAL: &str = "\
Respond using this template:
### Machine Summary
CRITICAL_COUNT: N
CRITICAL: <description>
ADVISORY: <description>

Reviewing T3...
### Machine Summary
CRITICAL_COUNT: 1
- **CRITICAL:** null check missing in parser.rs:40
ADVISORY: rename helper
### Notes
CRITICAL: outside the block
";

    /// The template block (non-numeric count) must not leak into results.
    #[test]
    fn last_numeric_machine_summary_wins() {
        let findings = parse_review_findings(TEMPLATE_THEN_REAL)
            .found()
            .expect("found");
        assert_eq!(findings.critical_count, 1);
        assert_eq!(findings.critical, vec!["null check missing in parser.rs:40"]);
        assert_eq!(findings.advisory, vec!["rename helper"]);
        assert_eq!(findings.status(), ReviewStatus::Blocked);
    }

    #[test]
    fn count_line_is_not_a_finding() {
        let output = "### Machine Summary\nCRITICAL_COUNT: 0\nADVISORY_COUNT: 0\n";
        let findings = parse_review_findings(output).found().expect("found");
        assert!(findings.critical.is_empty());
        assert!(findings.advisory.is_empty());
    }

    #[test]
    fn missing_count_is_capture_failure() {
        let output = "### Machine Summary\nCRITICAL: something\n";
        assert!(parse_review_findings(output).is_missing());
        assert!(parse_review_findings("looks good to me").is_missing());
    }

    #[test]
    fn positive_count_without_lines_is_synthesized() {
        let output = "### Machine Summary\nCRITICAL_COUNT: 2\n";
        let findings = parse_review_findings(output).found().expect("found");
        assert_eq!(
            findings.critical,
            vec!["Review output parsing failed - 2 findings not captured"]
        );
    }

    #[test]
    fn legacy_sections_are_fallback() {
        let output = "\
### Critical Findings
- **Unchecked unwrap in main**
### Advisory Findings
- None
- Consider splitting module
CRITICAL_COUNT: 1
";
        let findings = parse_review_findings(output).found().expect("found");
        assert_eq!(findings.critical, vec!["Unchecked unwrap in main"]);
        assert_eq!(findings.advisory, vec!["Consider splitting module"]);
    }

    #[test]
    fn merge_never_demotes_blocked() {
        let mut task = Task::new("T1", 1);
        merge_findings(
            &mut task,
            &ReviewFindings {
                critical: vec!["bad".into()],
                advisory: Vec::new(),
                critical_count: 1,
            },
        );
        merge_findings(
            &mut task,
            &ReviewFindings {
                critical: Vec::new(),
                advisory: vec!["nit".into()],
                critical_count: 0,
            },
        );
        assert_eq!(task.review_status, ReviewStatus::Blocked);
        assert_eq!(task.critical_findings, vec!["bad"]);
        assert_eq!(task.advisory_findings, vec!["nit"]);
    }

    #[test]
    fn capture_failure_keeps_blocked_review() {
        let mut task = Task::new("T1", 1);
        task.review_status = ReviewStatus::Blocked;
        mark_review_capture_failed(&mut task);
        assert_eq!(task.review_status, ReviewStatus::Blocked);
        assert_eq!(task.review_error.as_deref(), Some(REVIEW_CAPTURE_ERROR));

        let mut pending = Task::new("T2", 1);
        mark_review_capture_failed(&mut pending);
        assert_eq!(pending.review_status, ReviewStatus::EvidenceCaptureFailed);
    }

    #[test]
    fn manual_findings_keep_advisories_when_none_given() {
        let mut task = Task::new("T1", 1);
        task.advisory_findings = vec!["keep".into()];
        task.critical_findings = vec!["old".into()];
        let (critical, advisory) = parse_marker_lines("CRITICAL:   \nnoise\n");
        apply_manual_findings(&mut task, critical, advisory);
        assert_eq!(task.review_status, ReviewStatus::Passed);
        assert!(task.critical_findings.is_empty());
        assert_eq!(task.advisory_findings, vec!["keep"]);
    }

    #[test]
    fn spec_check_uses_last_numeric_block() {
        let output = "\
Template:
SPEC_CHECK_WAVE: N
SPEC_CHECK_CRITICAL_COUNT: N
CRITICAL: example
Real:
SPEC_CHECK_WAVE: 2
HIGH: missing retry budget
MEDIUM: naming drift
SPEC_CHECK_CRITICAL_COUNT: 0
SPEC_CHECK_HIGH_COUNT: 1
SPEC_CHECK_VERDICT: PASSED
";
        let findings = parse_spec_check_output(output);
        assert_eq!(findings.wave, Some(2));
        assert_eq!(findings.critical_count, Some(0));
        assert!(findings.critical.is_empty());
        assert_eq!(findings.high, vec!["missing retry budget"]);
        assert_eq!(findings.medium, vec!["naming drift"]);
        assert_eq!(findings.verdict.as_deref(), Some("PASSED"));
    }

    #[test]
    fn spec_check_without_count_records_capture_failure() {
        let findings = parse_spec_check_output("SPEC_CHECK_VERDICT: PASSED");
        let record = spec_check_record(findings, 3, "now".into());
        assert_eq!(record.wave, 3);
        assert_eq!(record.verdict, EVIDENCE_CAPTURE_FAILED);
        assert_eq!(record.error.as_deref(), Some(SPEC_CHECK_CAPTURE_ERROR));
        assert_eq!(record.critical_count, None);
    }
}
