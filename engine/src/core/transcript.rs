//! Parsing of agent transcripts (newline-delimited JSON event records).
//!
//! Each record may carry `message.content` as a plain string or as a list of
//! content blocks (`text`, `tool_use`, `tool_result`). Malformed lines and
//! malformed blocks are skipped individually.

use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

/// Test-runner command signatures across ecosystems (matched as lowercase substrings).
pub const TEST_COMMAND_PATTERNS: [&str; 25] = [
    "mvn test",
    "mvn verify",
    "mvn -pl",
    "mvnw test",
    "mvnw verify",
    "./gradlew test",
    "./gradlew check",
    "gradle test",
    "gradle check",
    "npm test",
    "npm run test",
    "npx vitest",
    "npx jest",
    "yarn test",
    "pnpm test",
    "bun test",
    "pytest",
    "python -m pytest",
    "python3 -m pytest",
    "cargo test",
    "go test",
    "dotnet test",
    "mix test",
    "make test",
    "make check",
];

/// Tools whose `file_path` input names a modified file.
pub const FILE_MODIFYING_TOOLS: [&str; 3] = ["Write", "Edit", "MultiEdit"];

static SIDE_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Full output saved to:\s*(\S+)").unwrap());

#[derive(Debug, Default, Deserialize)]
struct Record {
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Default, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<Value>,
}

/// One content block of a transcript record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Value,
    },
    #[serde(other)]
    Other,
}

impl ContentBlock {
    /// Text payloads of a tool result (string content or nested `text` blocks).
    fn result_texts(content: &Value) -> Vec<String> {
        match content {
            Value::String(text) => vec![text.clone()],
            Value::Array(items) => items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .filter(|text| !text.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// A parsed record: either string content or a list of blocks.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Parse transcript content, skipping blank and invalid lines.
pub fn parse_entries(content: &str) -> Vec<Entry> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<Record>(line).ok())
        .filter_map(|record| record.message.and_then(|message| message.content))
        .filter_map(|content| match content {
            Value::String(text) => Some(Entry::Text(text)),
            Value::Array(items) => Some(Entry::Blocks(
                items
                    .into_iter()
                    .filter_map(|item| serde_json::from_value(item).ok())
                    .collect(),
            )),
            _ => None,
        })
        .collect()
}

fn blocks(entries: &[Entry]) -> impl Iterator<Item = &ContentBlock> {
    entries.iter().flat_map(|entry| match entry {
        Entry::Blocks(blocks) => blocks.as_slice(),
        Entry::Text(_) => &[][..],
    })
}

/// Flatten a transcript to plain text: string messages, text blocks, and tool
/// results, in event order.
pub fn flatten_text(content: &str) -> String {
    let mut texts = Vec::new();
    for entry in parse_entries(content) {
        match entry {
            Entry::Text(text) => texts.push(text),
            Entry::Blocks(blocks) => {
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } if !text.is_empty() => texts.push(text),
                        ContentBlock::ToolResult { content, .. } => {
                            texts.extend(ContentBlock::result_texts(&content));
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    texts.join("\n")
}

pub fn is_test_command(command: &str) -> bool {
    let lowered = command.trim().to_lowercase();
    TEST_COMMAND_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

/// Output of recognized test-runner invocations only.
///
/// Collects the results of `Bash` tool calls whose command matches a test
/// runner signature, concatenated in event order. Assistant narration is never
/// included. `read_side_file` resolves results that were spilled to a file
/// because they exceeded the inline size limit.
pub fn bash_test_output<F>(content: &str, read_side_file: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let entries = parse_entries(content);
    let mut pending: HashSet<&str> = HashSet::new();
    let mut results = Vec::new();

    for block in blocks(&entries) {
        match block {
            ContentBlock::ToolUse {
                id: Some(id),
                name,
                input,
            } if name == "Bash" => {
                let command = input.get("command").and_then(Value::as_str).unwrap_or("");
                if is_test_command(command) {
                    pending.insert(id.as_str());
                }
            }
            ContentBlock::ToolResult {
                tool_use_id: Some(tool_use_id),
                content,
            } if pending.contains(tool_use_id.as_str()) => {
                for text in ContentBlock::result_texts(content) {
                    results.push(resolve_side_file(&text, &read_side_file));
                }
            }
            _ => {}
        }
    }

    results.join("\n")
}

/// Substitute the full side-file content when `text` points at one and the file
/// is readable; otherwise keep `text`.
pub fn resolve_side_file<F>(text: &str, read_side_file: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    SIDE_FILE_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|path| read_side_file(path.as_str()))
        .unwrap_or_else(|| text.to_string())
}

/// Paths written or edited by the agent, deduplicated and sorted.
pub fn files_modified(content: &str) -> Vec<String> {
    let entries = parse_entries(content);
    let files: BTreeSet<String> = blocks(&entries)
        .filter_map(|block| match block {
            ContentBlock::ToolUse { name, input, .. }
                if FILE_MODIFYING_TOOLS.contains(&name.as_str()) =>
            {
                input
                    .get("file_path")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }
            _ => None,
        })
        .collect();
    files.into_iter().collect()
}

/// Spec and plan documents written by a phase agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseArtifacts {
    pub spec_file: Option<String>,
    pub plan_file: Option<String>,
}

/// Extract spec/plan documents from `Write` calls.
///
/// A spec is `<specs_dir>/…/spec.md` (the deepest path wins), optionally
/// restricted to paths containing `spec_dir`. A plan is any `.md` under
/// `<plans_dir>/`, preferring `plan.md`, then the longest path.
pub fn phase_artifacts(
    content: &str,
    specs_dir: &str,
    plans_dir: &str,
    spec_dir: Option<&str>,
) -> PhaseArtifacts {
    let specs_marker = dir_marker(specs_dir);
    let plans_marker = dir_marker(plans_dir);
    let entries = parse_entries(content);
    let mut artifacts = PhaseArtifacts::default();

    for block in blocks(&entries) {
        let ContentBlock::ToolUse { name, input, .. } = block else {
            continue;
        };
        if name != "Write" {
            continue;
        }
        let Some(path) = input
            .get("file_path")
            .or_else(|| input.get("filePath"))
            .and_then(Value::as_str)
        else {
            continue;
        };

        if path.contains(&specs_marker)
            && path.ends_with("/spec.md")
            && spec_dir.is_none_or(|dir| path.contains(dir))
            && artifacts
                .spec_file
                .as_ref()
                .is_none_or(|current| path.len() > current.len())
        {
            artifacts.spec_file = Some(path.to_string());
        }

        if path.contains(&plans_marker) && path.ends_with(".md") {
            let is_plan = path.ends_with("/plan.md");
            let replace = match &artifacts.plan_file {
                None => true,
                Some(current) => {
                    let current_is_plan = current.ends_with("/plan.md");
                    (is_plan && !current_is_plan)
                        || (is_plan == current_is_plan && path.len() > current.len())
                }
            };
            if replace {
                artifacts.plan_file = Some(path.to_string());
            }
        }
    }

    artifacts
}

fn dir_marker(dir: &str) -> String {
    format!("{}/", dir.trim_end_matches('/'))
}
