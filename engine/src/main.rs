//! Hook and helper entry point for phased, wave-scheduled agent workflows.
//!
//! The coding assistant runs `loom <event> <handler>` at each lifecycle
//! checkpoint with a JSON payload on stdin; the orchestrator runs
//! `loom helper <command>` directly. Messages go to stderr and the exit code
//! carries the decision (0 allow, 2 block, 1 error).

use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use loom_engine::core::phase::SkipFlags;
use loom_engine::graph::Phase;
use loom_engine::hooks::helpers::{self, InitOptions, PopulateOptions, ValidateOptions};
use loom_engine::hooks::{
    HookContext, HookOutcome, pre_tool_use, session_start, subagent_start, subagent_stop,
};
use loom_engine::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "loom",
    version,
    about = "Phase and wave state engine for orchestrated agent workflows"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Checks run before a tool is used.
    #[command(subcommand)]
    PreToolUse(PreToolUse),
    /// Bookkeeping when a subagent finishes.
    #[command(subcommand)]
    SubagentStop(SubagentStop),
    /// Bookkeeping when a subagent starts.
    #[command(subcommand)]
    SubagentStart(SubagentStart),
    /// Housekeeping when a session starts.
    #[command(subcommand)]
    SessionStart(SessionStart),
    /// Commands the orchestrator runs directly.
    #[command(subcommand)]
    Helper(Helper),
}

#[derive(Subcommand)]
enum PreToolUse {
    /// Block phase agents spawned out of order or without prerequisites.
    ValidatePhaseOrder,
    /// Block tasks from future waves or with unfinished dependencies.
    ValidateTaskExecution,
}

#[derive(Subcommand)]
enum SubagentStop {
    /// Route the stop event to every matching handler.
    Dispatch,
    AdvancePhase,
    UpdateTaskStatus,
    StoreReviewerFindings,
    StoreSpecCheckFindings,
    CleanupSubagentFlag,
}

#[derive(Subcommand)]
enum SubagentStart {
    /// Track the agent and map its session to the task graph.
    MarkSubagentActive,
}

#[derive(Subcommand)]
enum SessionStart {
    /// Remove tracking files left by old sessions.
    CleanupStaleSubagents,
}

#[derive(Subcommand)]
enum Helper {
    /// Create the task graph for a new run.
    Init(InitArgs),
    /// Verify a wave and advance to the next one.
    CompleteWaveGate {
        /// Wave to verify (default: current wave).
        #[arg(long)]
        wave: Option<u32>,
    },
    /// Install decompose output (JSON on stdin) as the task graph.
    PopulateTaskGraph {
        /// Tracking issue number.
        #[arg(long)]
        issue: Option<u64>,
        /// Repository owning the tracking issue (owner/name).
        #[arg(long)]
        repo: Option<String>,
        /// Repair structural defaults before validating.
        #[arg(long)]
        fix: bool,
        /// Overwrite tasks that already started.
        #[arg(long)]
        force: bool,
    },
    /// Validate decompose output or a phase-tracking document.
    ValidateTaskGraph {
        /// File to validate (`-` for stdin).
        file: Option<PathBuf>,
        /// Validate a document without tasks.
        #[arg(long)]
        minimal: bool,
        /// Print the document with structural defaults repaired.
        #[arg(long)]
        fix: bool,
    },
    /// Replace a task's review findings with CRITICAL:/ADVISORY: lines from stdin.
    StoreReviewFindings {
        #[arg(long)]
        task: String,
    },
    /// Record spec-check markers from stdin.
    StoreSpecCheck,
    /// Record TEST_PASSED:/TEST_EVIDENCE: markers from stdin for a task.
    StoreTestEvidence {
        #[arg(long)]
        task: String,
    },
    /// Report which tasks in a wave lack test evidence.
    MarkTestsPassed {
        #[arg(long)]
        wave: Option<u32>,
    },
    /// Move the workflow to a phase.
    SetPhase {
        phase: Phase,
        /// Forget the artifact recorded for this phase.
        #[arg(long)]
        clear_artifact: Option<Phase>,
    },
    /// Delete the task graph.
    CleanupState,
    /// Print the task id found in stdin.
    ExtractTaskId,
}

#[derive(Args)]
struct InitArgs {
    /// Start at architecture using an existing spec.md.
    #[arg(long)]
    skip_specify: bool,
    #[arg(long)]
    skip_brainstorm: bool,
    #[arg(long)]
    skip_clarify: bool,
    #[arg(long)]
    skip_plan_alignment: bool,
    /// Directory scoping spec discovery for this run.
    #[arg(long)]
    spec_dir: Option<String>,
    /// Replace an existing task graph.
    #[arg(long)]
    force: bool,
}

impl InitArgs {
    fn options(self) -> InitOptions {
        InitOptions {
            skip: SkipFlags {
                specify: self.skip_specify,
                brainstorm: self.skip_brainstorm,
                clarify: self.skip_clarify,
                plan_alignment: self.skip_plan_alignment,
            },
            spec_dir: self.spec_dir,
            force: self.force,
        }
    }
}

fn main() -> ExitCode {
    // Usage errors must not exit 2, which the assistant reads as a block.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                exit_codes::ERROR
            } else {
                exit_codes::ALLOW
            };
            if let Err(print_err) = err.print() {
                eprintln!("{print_err}");
            }
            return exit(code);
        }
    };

    logging::init();
    match run(cli) {
        Ok(outcome) => {
            if let Some(message) = outcome.message() {
                eprintln!("{message}");
            }
            exit(outcome.exit_code())
        }
        Err(err) => {
            eprintln!("{:#}", err);
            exit(exit_codes::ERROR)
        }
    }
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Hook payload on stdin; empty when stdin is a terminal.
fn read_stdin() -> Result<String> {
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(String::new());
    }
    let mut buf = String::new();
    stdin.read_to_string(&mut buf).context("read stdin")?;
    Ok(buf)
}

fn run(cli: Cli) -> Result<HookOutcome> {
    let root = std::env::current_dir().context("resolve current directory")?;
    let ctx = HookContext::load(root)?;

    match cli.command {
        Command::PreToolUse(handler) => run_pre_tool_use(&ctx, handler),
        Command::SubagentStop(handler) => run_subagent_stop(&ctx, handler),
        Command::SubagentStart(SubagentStart::MarkSubagentActive) => {
            subagent_start::mark_subagent_active(&ctx, &read_stdin()?)
        }
        Command::SessionStart(SessionStart::CleanupStaleSubagents) => {
            session_start::cleanup_stale_subagents(&ctx)
        }
        Command::Helper(helper) => run_helper(&ctx, helper),
    }
}

fn run_pre_tool_use(ctx: &HookContext, handler: PreToolUse) -> Result<HookOutcome> {
    let stdin = read_stdin()?;
    match handler {
        PreToolUse::ValidatePhaseOrder => pre_tool_use::validate_phase_order(ctx, &stdin),
        PreToolUse::ValidateTaskExecution => {
            pre_tool_use::validate_task_execution(ctx, &stdin, &ctx.git())
        }
    }
}

fn run_subagent_stop(ctx: &HookContext, handler: SubagentStop) -> Result<HookOutcome> {
    let stdin = read_stdin()?;
    match handler {
        SubagentStop::Dispatch => subagent_stop::dispatch(ctx, &stdin, &ctx.git()),
        SubagentStop::AdvancePhase => subagent_stop::advance_phase(ctx, &stdin),
        SubagentStop::UpdateTaskStatus => {
            subagent_stop::update_task_status(ctx, &stdin, &ctx.git())
        }
        SubagentStop::StoreReviewerFindings => subagent_stop::store_reviewer_findings(ctx, &stdin),
        SubagentStop::StoreSpecCheckFindings => {
            subagent_stop::store_spec_check_findings(ctx, &stdin)
        }
        SubagentStop::CleanupSubagentFlag => subagent_stop::cleanup_subagent_flag(ctx, &stdin),
    }
}

fn run_helper(ctx: &HookContext, helper: Helper) -> Result<HookOutcome> {
    match helper {
        Helper::Init(args) => helpers::init(ctx, &args.options()),
        Helper::CompleteWaveGate { wave } => helpers::complete_wave_gate(ctx, wave),
        Helper::PopulateTaskGraph {
            issue,
            repo,
            fix,
            force,
        } => helpers::populate_task_graph(ctx, &read_stdin()?, &PopulateOptions {
            issue,
            repo,
            fix,
            force,
        }),
        Helper::ValidateTaskGraph { file, minimal, fix } => {
            let from_stdin = file.as_ref().is_none_or(|path| path.as_os_str() == "-");
            let stdin = if from_stdin {
                read_stdin()?
            } else {
                String::new()
            };
            helpers::validate_task_graph(&stdin, &ValidateOptions { minimal, fix, file })
        }
        Helper::StoreReviewFindings { task } => {
            helpers::store_review_findings(ctx, &read_stdin()?, &task)
        }
        Helper::StoreSpecCheck => helpers::store_spec_check(ctx, &read_stdin()?),
        Helper::StoreTestEvidence { task } => {
            helpers::store_test_evidence(ctx, &read_stdin()?, &task)
        }
        Helper::MarkTestsPassed { wave } => helpers::mark_tests_passed(ctx, wave),
        Helper::SetPhase {
            phase,
            clear_artifact,
        } => helpers::set_phase(ctx, phase, clear_artifact),
        Helper::CleanupState => helpers::cleanup_state(ctx),
        Helper::ExtractTaskId => helpers::extract_task_id(&read_stdin()?),
    }
}
