//! Pass/fail classification of test-runner output and new-test detection in diffs.
//!
//! Output may contain several runs of the same command; for every pattern only
//! the last match by position is considered, so later runs supersede earlier ones.

use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Classified test-runner output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestEvidence {
    pub passed: bool,
    pub evidence: String,
}

impl TestEvidence {
    fn pass(evidence: String) -> Self {
        Self {
            passed: true,
            evidence,
        }
    }
}

static MAVEN_RUN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Tests run: (\d+), Failures: (\d+), Errors: (\d+)").unwrap()
});
static NODE_PASS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) passing").unwrap());
static NODE_FAIL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) failing").unwrap());
static VITEST_PASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Tests?\s+(\d+) passed").unwrap());
static VITEST_FAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Tests?\s+(\d+) failed").unwrap());
static CARGO_PASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"test result: ok\. (\d+) passed").unwrap());
static CARGO_FAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"test result:.*?(\d+) failed").unwrap());
static PYTEST_PASS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) passed").unwrap());
static PYTEST_FAIL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) failed").unwrap());
static BUN_PASS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) pass\b").unwrap());
static BUN_FAIL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) fail\b").unwrap());

fn last_match<'t>(re: &Regex, text: &'t str) -> Option<Captures<'t>> {
    re.captures_iter(text).last()
}

fn start(caps: &Captures<'_>) -> usize {
    caps.get(0).map_or(0, |m| m.start())
}

fn group<'t>(caps: &Captures<'t>, index: usize) -> &'t str {
    caps.get(index).map_or("", |m| m.as_str())
}

fn whole<'t>(caps: &Captures<'t>) -> &'t str {
    group(caps, 0)
}

/// A pass match stands unless a later failure match reports a non-zero count.
fn passes_against(pass: &Captures<'_>, fail: Option<&Captures<'_>>) -> bool {
    match fail {
        None => true,
        Some(fail) => group(fail, 1) == "0" || start(fail) < start(pass),
    }
}

fn ecosystem(
    output: &str,
    pass_re: &Regex,
    fail_re: &Regex,
    describe: impl Fn(&Captures<'_>) -> String,
) -> Option<TestEvidence> {
    let pass = last_match(pass_re, output)?;
    let fail = last_match(fail_re, output);
    passes_against(&pass, fail.as_ref()).then(|| TestEvidence::pass(describe(&pass)))
}

/// Classify concatenated test output, trying each ecosystem in turn.
pub fn extract_test_evidence(output: &str) -> TestEvidence {
    if output.contains("BUILD SUCCESS") {
        let cleaned = output.replace("**", "");
        if let Some(run) = last_match(&MAVEN_RUN_RE, &cleaned)
            && group(&run, 2) == "0"
            && group(&run, 3) == "0"
        {
            return TestEvidence::pass(format!("maven: {}", whole(&run)));
        }
    }

    let attempts: [(&Regex, &Regex, fn(&Captures<'_>) -> String); 5] = [
        (&*NODE_PASS_RE, &*NODE_FAIL_RE, |c| format!("node: {}", whole(c))),
        (&*VITEST_PASS_RE, &*VITEST_FAIL_RE, |c| {
            format!("vitest: {}", whole(c))
        }),
        (&*CARGO_PASS_RE, &*CARGO_FAIL_RE, |c| {
            format!("cargo: {} passed", group(c, 1))
        }),
        (&*PYTEST_PASS_RE, &*PYTEST_FAIL_RE, |c| {
            format!("pytest: {}", whole(c))
        }),
        (&*BUN_PASS_RE, &*BUN_FAIL_RE, |c| format!("bun: {}", whole(c))),
    ];

    attempts
        .into_iter()
        .find_map(|(pass_re, fail_re, describe)| ecosystem(output, pass_re, fail_re, describe))
        .unwrap_or_default()
}

/// Test declarations added by a diff, per idiom.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestCount {
    pub java: usize,
    pub ts: usize,
    pub python: usize,
    pub rust: usize,
}

impl TestCount {
    pub fn total(&self) -> usize {
        self.java + self.ts + self.python + self.rust
    }
}

static JAVA_TEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@(Test|Property|ParameterizedTest)\b").unwrap());
static TS_TEST_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s(it|test|describe)\(").unwrap());
static PYTHON_TEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(def test_|class Test)").unwrap());
static RUST_TEST_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#\[test\]").unwrap());

static ASSERTION_RES: LazyLock<[Regex; 4]> = LazyLock::new(|| {
    [
        Regex::new(r"(assertThat|assertEquals|assertNotNull|assertThrows|verify\()").unwrap(),
        Regex::new(r"(expect\(|toEqual|toBe|toHaveBeenCalled|toThrow|\.should\.)").unwrap(),
        Regex::new(r"(assert\w*\(|assert [^=]|self\.assert|pytest\.raises)").unwrap(),
        Regex::new(r"(assert(_eq)?!|assert_ne!)").unwrap(),
    ]
});

/// Added lines of a unified diff (`+` prefix, excluding `+++` file headers).
fn added_lines(diff: &str) -> impl Iterator<Item = &str> {
    diff.lines()
        .filter(|line| line.starts_with('+') && !line.starts_with("+++"))
}

/// Count test declarations on added lines, at most one per line.
pub fn count_new_tests(diff: &str) -> TestCount {
    let mut count = TestCount::default();
    for line in added_lines(diff) {
        if JAVA_TEST_RE.is_match(line) {
            count.java += 1;
        } else if TS_TEST_RE.is_match(line) {
            count.ts += 1;
        } else if PYTHON_TEST_RE.is_match(line) {
            count.python += 1;
        } else if RUST_TEST_RE.is_match(line) {
            count.rust += 1;
        }
    }
    count
}

/// Count assertions on added lines, at most one per line.
pub fn count_assertions(diff: &str) -> usize {
    added_lines(diff)
        .filter(|line| ASSERTION_RES.iter().any(|re| re.is_match(line)))
        .count()
}

/// Outcome of new-test analysis for one task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTestEvidence {
    pub written: bool,
    pub evidence: String,
}

/// Decide whether a diff adds real tests. Declarations without assertions are
/// treated as empty stubs.
pub fn analyze_new_tests(diff: &str, new_tests_required: Option<bool>) -> NewTestEvidence {
    if new_tests_required == Some(false) {
        return NewTestEvidence {
            written: false,
            evidence: "new_tests_required=false (skipped)".to_string(),
        };
    }

    let tests = count_new_tests(diff);
    let total = tests.total();
    if total == 0 {
        return NewTestEvidence::default();
    }

    let assertions = count_assertions(diff);
    if assertions == 0 {
        return NewTestEvidence {
            written: false,
            evidence: format!("{total} test methods but 0 assertions (empty stubs?)"),
        };
    }

    let details: Vec<String> = [
        (tests.java, "java", "@Test/@Property"),
        (tests.ts, "ts", "it/test/describe"),
        (tests.python, "python", "test functions"),
        (tests.rust, "rust", "#[test]"),
    ]
    .into_iter()
    .filter(|(n, _, _)| *n > 0)
    .map(|(n, lang, idiom)| format!("{lang}: {n} {idiom}"))
    .collect();

    NewTestEvidence {
        written: true,
        evidence: format!(
            "{total} new test methods, {assertions} assertions ({})",
            details.join("; ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maven_requires_build_success_and_zero_failures() {
        let output = "Tests run: 4, Failures: 1, Errors: 0\nBUILD FAILURE";
        assert!(!extract_test_evidence(output).passed);

        let output = "[INFO] **Tests run: 12, Failures: 0, Errors: 0**\n[INFO] BUILD SUCCESS";
        let evidence = extract_test_evidence(output);
        assert!(evidence.passed);
        assert_eq!(evidence.evidence, "maven: Tests run: 12, Failures: 0, Errors: 0");
    }

    #[test]
    fn mocha_failing_after_passing_is_a_failure() {
        assert!(!extract_test_evidence("10 passing\n2 failing").passed);
        let evidence = extract_test_evidence("2 failing\n...\n10 passing");
        assert_eq!(evidence.evidence, "node: 10 passing");
    }

    #[test]
    fn vitest_summary_is_recognized() {
        let evidence = extract_test_evidence(" Test Files  3 passed (3)\n      Tests  21 passed (21)");
        assert!(evidence.passed);
        assert_eq!(evidence.evidence, "vitest: Tests  21 passed");
    }

    #[test]
    fn cargo_reports_passed_count() {
        let output = "test result: ok. 7 passed; 0 failed; 0 ignored";
        assert_eq!(extract_test_evidence(output).evidence, "cargo: 7 passed");
    }

    #[test]
    fn cargo_failure_count_is_read_in_full() {
        let output = "test result: ok. 7 passed; 0 failed\ntest result: FAILED. 2 passed; 10 failed";
        assert!(!extract_test_evidence(output).passed);
    }

    /// A rerun that fixes the failures supersedes the earlier failing run.
    #[test]
    fn later_run_supersedes_earlier_run() {
        let output = "=== 3 failed, 5 passed ===\n=== 8 passed in 0.2s ===";
        let evidence = extract_test_evidence(output);
        assert!(evidence.passed);
        assert_eq!(evidence.evidence, "pytest: 8 passed");
    }

    #[test]
    fn bun_pass_does_not_match_passed() {
        let evidence = extract_test_evidence(" 14 pass\n 0 fail\n");
        assert_eq!(evidence.evidence, "bun: 14 pass");
    }

    #[test]
    fn unrecognized_output_is_not_a_pass() {
        assert_eq!(extract_test_evidence("everything is fine"), TestEvidence::default());
    }

    const RUST_DIFF: &str = "\
+++ b/src/lib.rs
+#[test]
+fn parses() {
+    assert_eq!(parse(\"a\"), 1);
+}
 #[test]
-fn old() { assert!(true); }
";

    #[test]
    fn counts_only_added_lines() {
        let tests = count_new_tests(RUST_DIFF);
        assert_eq!(tests.rust, 1);
        assert_eq!(tests.total(), 1);
        assert_eq!(count_assertions(RUST_DIFF), 1);
    }

    #[test]
    fn mixed_idioms_count_once_per_line() {
        let diff = "+  @Test void it(x) { assertThat(y); expect(z); }";
        assert_eq!(count_new_tests(diff).total(), 1);
        assert_eq!(count_assertions(diff), 1);
    }

    #[test]
    fn analyze_reports_written_tests() {
        let result = analyze_new_tests(RUST_DIFF, None);
        assert!(result.written);
        assert_eq!(
            result.evidence,
            "1 new test methods, 1 assertions (rust: 1 #[test])"
        );
    }

    #[test]
    fn analyze_rejects_empty_stubs() {
        let diff = "+def test_nothing():\n+    pass\n";
        let result = analyze_new_tests(diff, Some(true));
        assert!(!result.written);
        assert_eq!(result.evidence, "1 test methods but 0 assertions (empty stubs?)");
    }

    #[test]
    fn analyze_honors_exemption() {
        let result = analyze_new_tests(RUST_DIFF, Some(false));
        assert!(!result.written);
        assert_eq!(result.evidence, "new_tests_required=false (skipped)");
    }
}
