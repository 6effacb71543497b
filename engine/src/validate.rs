//! Validation of decompose output and minimal phase-tracking documents.
//!
//! Full validation is schema conformance (Draft 2020-12) followed by the
//! semantic invariants in [`crate::core::invariants`]. The `--fix` path only
//! repairs structural defaults; semantic violations are still reported.

use anyhow::{Context, Result};
use jsonschema::Draft;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::core::invariants::{suspicious_test_exemptions, validate_tasks};
use crate::graph::{Phase, Task};

pub const DECOMPOSE_SCHEMA: &str = include_str!("../schemas/decompose.v1.schema.json");

/// Violations found in a document. Warnings never make it invalid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Bulleted error list, one violation per line.
    pub fn bullets(&self) -> String {
        self.errors
            .iter()
            .map(|err| format!("  - {err}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Validate JSON instance against a JSON Schema (Draft 2020-12).
fn schema_errors(instance: &Value, schema_raw: &str) -> Result<Vec<String>> {
    let schema: Value = serde_json::from_str(schema_raw).context("parse schema json")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    Ok(compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect())
}

/// Typed view of the task array, when it is well-formed enough to check.
fn typed_tasks(json: &Value) -> Option<Vec<Task>> {
    let tasks = json.get("tasks")?.clone();
    serde_json::from_value(tasks).ok()
}

/// Validate decompose output: schema, then semantic invariants.
pub fn validate_full(json: &Value) -> Result<ValidationReport> {
    let mut report = ValidationReport {
        errors: schema_errors(json, DECOMPOSE_SCHEMA)?,
        warnings: Vec::new(),
    };
    if let Some(tasks) = typed_tasks(json) {
        report.errors.extend(validate_tasks(&tasks));
        report.warnings.extend(suspicious_test_exemptions(&tasks));
    }
    Ok(report)
}

/// Add missing per-task structural defaults.
pub fn fix_full(json: &Value) -> Value {
    let mut fixed = json.as_object().cloned().unwrap_or_default();
    let tasks: Vec<Value> = json
        .get("tasks")
        .and_then(Value::as_array)
        .map(|tasks| tasks.iter().map(fix_task).collect())
        .unwrap_or_default();
    fixed.insert("tasks".to_string(), Value::Array(tasks));
    Value::Object(fixed)
}

fn fix_task(task: &Value) -> Value {
    let Some(task) = task.as_object() else {
        return task.clone();
    };
    let mut fixed = task.clone();
    for key in ["depends_on", "critical_findings", "advisory_findings"] {
        if !fixed.get(key).is_some_and(Value::is_array) {
            fixed.insert(key.to_string(), json!([]));
        }
    }
    for key in ["status", "review_status"] {
        if fixed.get(key).is_none_or(Value::is_null) {
            fixed.insert(key.to_string(), json!("pending"));
        }
    }
    Value::Object(fixed)
}

fn is_phase(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_str)
        .is_some_and(|phase| phase.parse::<Phase>().is_ok())
}

/// Validate a phase-tracking document that has no tasks yet.
pub fn validate_minimal(json: &Value) -> ValidationReport {
    let mut errors = Vec::new();
    match json.get("current_phase").and_then(Value::as_str) {
        None => errors.push("Missing required field: current_phase".to_string()),
        Some(phase) if phase.parse::<Phase>().is_err() => {
            errors.push(format!("current_phase '{phase}' not a valid phase"));
        }
        Some(_) => {}
    }
    if !json.get("phase_artifacts").is_some_and(Value::is_object) {
        errors.push("phase_artifacts must be object".to_string());
    }
    if !json.get("skipped_phases").is_some_and(Value::is_array) {
        errors.push("skipped_phases must be array".to_string());
    }
    for field in ["spec_file", "plan_file"] {
        if json.get(field).is_none() {
            errors.push(format!("Missing required field: {field}"));
        }
    }
    ValidationReport {
        errors,
        warnings: Vec::new(),
    }
}

/// Keep valid minimal fields and default the rest.
pub fn fix_minimal(json: &Value) -> Value {
    let field = |key: &str, valid: fn(&Value) -> bool, default: Value| {
        json.get(key).filter(|value| valid(value)).cloned().unwrap_or(default)
    };
    let mut fixed = Map::new();
    fixed.insert(
        "current_phase".to_string(),
        if is_phase(json.get("current_phase")) {
            json["current_phase"].clone()
        } else {
            json!(Phase::Init.as_str())
        },
    );
    fixed.insert(
        "phase_artifacts".to_string(),
        field("phase_artifacts", Value::is_object, json!({})),
    );
    fixed.insert(
        "skipped_phases".to_string(),
        field("skipped_phases", Value::is_array, json!([])),
    );
    for key in ["spec_file", "plan_file"] {
        fixed.insert(
            key.to_string(),
            json.get(key).cloned().unwrap_or(Value::Null),
        );
    }
    Value::Object(fixed)
}

/// Decompose-agent output merged into the task graph.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Decompose {
    #[serde(default)]
    pub plan_title: Option<String>,
    #[serde(default)]
    pub plan_file: Option<String>,
    #[serde(default)]
    pub spec_file: Option<String>,
    pub tasks: Vec<Task>,
}

impl Decompose {
    pub fn from_value(json: Value) -> Result<Self> {
        serde_json::from_value(json).context("parse decompose output")
    }

    /// Distinct wave numbers in ascending order.
    pub fn waves(&self) -> Vec<u32> {
        let mut waves: Vec<u32> = self.tasks.iter().map(|task| task.wave).collect();
        waves.sort_unstable();
        waves.dedup();
        waves
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decompose() -> Value {
        json!({
            "plan_title": "Auth",
            "plan_file": ".claude/plans/plan.md",
            "spec_file": ".claude/specs/auth/spec.md",
            "tasks": [
                {"id": "T1", "description": "Add model", "agent": "code-implementer-agent", "wave": 1},
                {"id": "T2", "description": "Add api", "agent": "code-implementer-agent", "wave": 2, "depends_on": ["T1"]}
            ]
        })
    }

    #[test]
    fn well_formed_decompose_is_valid() {
        let report = validate_full(&decompose()).expect("validate");
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn schema_violations_are_reported() {
        let mut doc = decompose();
        doc["tasks"][0]["id"] = json!("task-1");
        doc["tasks"][1]["wave"] = json!(0);
        doc.as_object_mut().expect("object").remove("plan_title");
        let report = validate_full(&doc).expect("validate");
        assert!(report.errors.len() >= 3, "{:?}", report.errors);
    }

    #[test]
    fn semantic_violations_follow_schema_checks() {
        let mut doc = decompose();
        doc["tasks"][1]["wave"] = json!(3);
        let report = validate_full(&doc).expect("validate");
        assert_eq!(
            report.errors,
            vec!["Wave gap: 1 → 3 (waves must be contiguous)".to_string()]
        );
    }

    #[test]
    fn fix_full_adds_structural_defaults_only() {
        let mut doc = decompose();
        doc["tasks"][0]["status"] = Value::Null;
        let fixed = fix_full(&doc);
        let task = &fixed["tasks"][0];
        assert_eq!(task["depends_on"], json!([]));
        assert_eq!(task["status"], "pending");
        assert_eq!(task["review_status"], "pending");
        assert_eq!(fixed["tasks"][1]["depends_on"], json!(["T1"]));
        assert_eq!(fixed["plan_title"], "Auth");
    }

    #[test]
    fn minimal_document_checks() {
        let report = validate_minimal(&json!({"current_phase": "deploy", "phase_artifacts": []}));
        assert_eq!(
            report.errors,
            vec![
                "current_phase 'deploy' not a valid phase".to_string(),
                "phase_artifacts must be object".to_string(),
                "skipped_phases must be array".to_string(),
                "Missing required field: spec_file".to_string(),
                "Missing required field: plan_file".to_string(),
            ]
        );
    }

    #[test]
    fn fix_minimal_preserves_valid_fields() {
        let fixed = fix_minimal(&json!({"current_phase": "specify", "skipped_phases": "x"}));
        assert_eq!(
            fixed,
            json!({
                "current_phase": "specify",
                "phase_artifacts": {},
                "skipped_phases": [],
                "spec_file": null,
                "plan_file": null
            })
        );
        assert!(validate_minimal(&fixed).is_valid());
    }

    #[test]
    fn decompose_waves_are_sorted_and_distinct() {
        let parsed = Decompose::from_value(decompose()).expect("parse");
        assert_eq!(parsed.waves(), vec![1, 2]);
    }
}
