//! `ralph-mode`: keep an AI coding agent iterating until its work is done.
//!
//! Every command operates on the loop stored in `.ralph-mode/` under the
//! workspace root. `hook` is the entry point registered with the agent
//! runtime; it always exits 0 and reports its decision as JSON on stdout.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::warn;

use ralph_mode::controller::{CompleteOutcome, LoopController, StatusReport};
use ralph_mode::core::cycle::{CycleOutcome, TaskTransition};
use ralph_mode::core::decision::{AllowReason, ExitDecision};
use ralph_mode::core::types::LoopState;
use ralph_mode::error::{LoopError, LoopResult};
use ralph_mode::exit_codes;
use ralph_mode::intercept::ExitInterceptor;
use ralph_mode::io::agent::CommandAgent;
use ralph_mode::io::config::{ALLOW_NO_CHANGE_ENV, EnvOverrides, RalphConfig, load_config};
use ralph_mode::io::connectivity::{SystemProbe, TcpProbe};
use ralph_mode::io::paths::RalphPaths;
use ralph_mode::io::tasks_file::load_tasks_file;
use ralph_mode::io::transcript::HookInput;
use ralph_mode::logging;
use ralph_mode::looping::{LoopStop, RunSettings, run_loop};
use ralph_mode::outage::{OutageGuard, StderrNotifier};

#[derive(Parser)]
#[command(
    name = "ralph-mode",
    version,
    about = "Keep an AI coding agent iterating on a task until it is genuinely done"
)]
struct Cli {
    /// Workspace root (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a loop that re-feeds one prompt.
    Enable {
        /// Task prompt (words are joined with spaces).
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,
        /// Stop after this many iterations (0 = unlimited).
        #[arg(long, default_value_t = 0)]
        max_iterations: u32,
        /// Text the agent outputs inside <promise></promise> when done.
        #[arg(long)]
        completion_promise: Option<String>,
    },
    /// Start a loop over a queue of tasks from a JSON file.
    BatchInit {
        #[arg(long)]
        tasks_file: PathBuf,
        /// Iteration budget per task (default from ralph-mode.toml).
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Global iteration limit across all tasks (0 = unlimited).
        #[arg(long, default_value_t = 0)]
        max_total_iterations: u32,
        #[arg(long)]
        completion_promise: Option<String>,
    },
    /// Remove the loop and everything it stored.
    Disable,
    /// Show the loop state.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print the prompt for the current iteration.
    Prompt,
    /// Count one more iteration.
    Iterate,
    /// Skip the current batch task.
    NextTask,
    /// Check agent output (argument or stdin) for the completion promise.
    Complete { output: Vec<String> },
    /// Show the loop history.
    History {
        #[arg(long)]
        json: bool,
    },
    /// Look up a batch task by id or title.
    Task {
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
    },
    /// Exit-interception hook: reads hook JSON on stdin, prints the decision.
    Hook,
    /// Run the configured agent command until the loop ends.
    Run,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Enable { .. } => "enable",
            Command::BatchInit { .. } => "batch-init",
            Command::Disable => "disable",
            Command::Status { .. } => "status",
            Command::Prompt => "prompt",
            Command::Iterate => "iterate",
            Command::NextTask => "next-task",
            Command::Complete { .. } => "complete",
            Command::History { .. } => "history",
            Command::Task { .. } => "task",
            Command::Hook => "hook",
            Command::Run => "run",
        }
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let name = cli.command.name();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{name}: {}", describe(&err));
            err.exit_code()
        }
    };
    std::process::exit(code);
}

fn describe(err: &LoopError) -> String {
    match err {
        LoopError::Other(inner) => format!("{inner:#}"),
        other => other.to_string(),
    }
}

fn run(cli: Cli) -> LoopResult<i32> {
    if let Command::Hook = cli.command {
        return Ok(cmd_hook(cli.root));
    }
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let config = load_config(&RalphPaths::new(&root).config_path)?;
    let env = EnvOverrides::from_env();
    let controller = LoopController::open(&root, &config, &env);

    match cli.command {
        Command::Enable {
            prompt,
            max_iterations,
            completion_promise,
        } => cmd_enable(&controller, &prompt.join(" "), max_iterations, completion_promise),
        Command::BatchInit {
            tasks_file,
            max_iterations,
            max_total_iterations,
            completion_promise,
        } => cmd_batch_init(
            &controller,
            &tasks_file,
            max_iterations.unwrap_or(config.default_batch_max_iterations),
            max_total_iterations,
            completion_promise,
        ),
        Command::Disable => cmd_disable(&controller),
        Command::Status { json } => cmd_status(&controller, json),
        Command::Prompt => {
            println!("{}", controller.current_prompt()?);
            Ok(exit_codes::OK)
        }
        Command::Iterate => cmd_iterate(&controller),
        Command::NextTask => cmd_next_task(&controller),
        Command::Complete { output } => cmd_complete(&controller, output),
        Command::History { json } => cmd_history(&controller, json),
        Command::Task { query } => cmd_task(&controller, &query.join(" ")),
        Command::Run => cmd_run(&controller, &config, &env),
        Command::Hook => unreachable!("hook handled above"),
    }
}

fn cmd_enable(
    controller: &LoopController,
    prompt: &str,
    max_iterations: u32,
    completion_promise: Option<String>,
) -> LoopResult<i32> {
    let state = controller.enable(prompt, max_iterations, completion_promise)?;
    println!("🔄 Ralph mode enabled");
    print_limits(&state);
    println!(
        "Instructions: {}",
        controller.store().paths().instructions_path.display()
    );
    Ok(exit_codes::OK)
}

fn cmd_batch_init(
    controller: &LoopController,
    tasks_file: &Path,
    max_iterations: u32,
    max_total_iterations: u32,
    completion_promise: Option<String>,
) -> LoopResult<i32> {
    let tasks = load_tasks_file(tasks_file)?;
    let state = controller.batch_init(tasks, max_iterations, max_total_iterations, completion_promise)?;
    let total = state.batch.as_ref().map_or(0, |progress| progress.tasks_total);
    println!("🔄 Ralph batch mode enabled: {total} tasks");
    println!(
        "Current task: 1/{total} {}",
        state.current_task_id.as_deref().unwrap_or_default()
    );
    println!("Per-task budget: {}", limit_text(max_iterations));
    print_limits(&state);
    Ok(exit_codes::OK)
}

fn cmd_disable(controller: &LoopController) -> LoopResult<i32> {
    let disabled = controller.disable()?;
    match (&disabled.previous, disabled.removed) {
        (Some(state), _) => println!("Ralph mode disabled (was at iteration {})", state.iteration),
        (None, true) => println!("Ralph mode disabled (state was unreadable)"),
        (None, false) => println!("No Ralph loop to disable"),
    }
    Ok(exit_codes::OK)
}

fn cmd_status(controller: &LoopController, json: bool) -> LoopResult<i32> {
    let report = controller.status()?;
    if json {
        let text = serde_json::to_string_pretty(&report).context("serialize status")?;
        println!("{text}");
        return Ok(exit_codes::OK);
    }
    match report {
        Some(report) => print_status(&report),
        None => println!("No Ralph loop in this workspace"),
    }
    Ok(exit_codes::OK)
}

fn print_status(report: &StatusReport) {
    let state = &report.state;
    let status = if state.active { "active" } else { "finished" };
    println!("Ralph mode: {status} ({})", state.mode.as_str());
    print_limits(state);
    println!("Started: {}", state.started_at.to_rfc3339());
    if let (Some(task), Some(number), Some(progress)) =
        (&report.current_task, report.task_number, &state.batch)
    {
        println!(
            "Task: {number}/{} {} — {} (task iteration {}/{})",
            progress.tasks_total,
            task.id,
            task.title,
            progress.task_iteration,
            limit_text(progress.task_max_iterations)
        );
    }
    println!("History entries: {}", report.history_entries);
    if let Some(prompt) = &report.prompt {
        println!("\nPrompt:\n{prompt}");
    }
}

fn cmd_iterate(controller: &LoopController) -> LoopResult<i32> {
    match controller.iterate()? {
        CycleOutcome::Continued { iteration } => {
            println!("Iteration {iteration}");
            Ok(exit_codes::OK)
        }
        CycleOutcome::TaskAdvanced { iteration, task_id } => {
            println!("Iteration {iteration}: task budget spent, now on task {task_id}");
            Ok(exit_codes::OK)
        }
        CycleOutcome::FinalIteration {
            iteration,
            max_iterations,
        }
        | CycleOutcome::LimitReached {
            iteration,
            max_iterations,
        } => {
            eprintln!(
                "iterate: max iterations ({max_iterations}) reached at iteration {iteration}; loop finished"
            );
            Ok(exit_codes::NOT_APPLICABLE)
        }
        CycleOutcome::BatchComplete { iteration } => {
            eprintln!("iterate: last task used its budget at iteration {iteration}; batch finished");
            Ok(exit_codes::NOT_APPLICABLE)
        }
    }
}

fn cmd_next_task(controller: &LoopController) -> LoopResult<i32> {
    match controller.next_task()? {
        TaskTransition::NextTask { task_id, position } => {
            println!("Now on task {}: {task_id}", position + 1);
        }
        TaskTransition::BatchFinished | TaskTransition::LoopFinished => {
            println!("That was the last task; batch finished");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_complete(controller: &LoopController, output: Vec<String>) -> LoopResult<i32> {
    let output = if output.is_empty() {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("read agent output from stdin")?;
        buf
    } else {
        output.join(" ")
    };
    match controller.complete(&output)? {
        CompleteOutcome::Completed { iteration } => {
            println!("✅ Completion promise detected at iteration {iteration}; loop finished");
            Ok(exit_codes::OK)
        }
        CompleteOutcome::TaskCompleted {
            task_id,
            next_task_id,
        } => {
            println!("✅ Task {task_id} complete; now on task {next_task_id}");
            Ok(exit_codes::OK)
        }
        CompleteOutcome::BatchCompleted { task_id } => {
            println!("✅ Task {task_id} complete; batch finished");
            Ok(exit_codes::OK)
        }
        CompleteOutcome::NotComplete => {
            eprintln!("complete: completion promise not found");
            Ok(exit_codes::INCOMPLETE)
        }
        CompleteOutcome::NoObservableChange => {
            eprintln!(
                "complete: refused, nothing changed in the workspace since the task started \
                 (set {ALLOW_NO_CHANGE_ENV}=1 for read-only tasks)"
            );
            Ok(exit_codes::INCOMPLETE)
        }
        CompleteOutcome::AlreadyFinished => {
            eprintln!("complete: the loop has already finished");
            Ok(exit_codes::NOT_APPLICABLE)
        }
    }
}

fn cmd_history(controller: &LoopController, json: bool) -> LoopResult<i32> {
    let entries = controller.history()?;
    if json {
        let text = serde_json::to_string_pretty(&entries).context("serialize history")?;
        println!("{text}");
        return Ok(exit_codes::OK);
    }
    if entries.is_empty() {
        println!("No history");
    }
    for entry in entries {
        let notes = entry.notes.as_deref().unwrap_or_default();
        println!(
            "{} #{} {} {notes}",
            entry.timestamp.to_rfc3339(),
            entry.iteration,
            entry.event.as_str()
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_task(controller: &LoopController, query: &str) -> LoopResult<i32> {
    match controller.find_task(query)? {
        Some(task) => {
            println!("{} — {}\n\n{}", task.id, task.title, task.prompt);
            Ok(exit_codes::OK)
        }
        None => Err(LoopError::InvalidArgument(format!(
            "no task matches '{query}'"
        ))),
    }
}

/// Never fails: any problem is logged and the exit is allowed.
fn cmd_hook(root: Option<PathBuf>) -> i32 {
    let mut raw = String::new();
    if let Err(err) = io::stdin().read_to_string(&mut raw) {
        warn!(err = %err, "failed to read hook input");
    }
    let input = HookInput::parse(&raw);
    let root = root
        .or_else(|| input.cwd.clone())
        .or_else(|| std::env::current_dir().ok());

    let decision = match root {
        Some(root) => {
            let config = load_config(&RalphPaths::new(&root).config_path).unwrap_or_else(|err| {
                warn!(err = %format!("{err:#}"), "invalid config; using defaults");
                RalphConfig::default()
            });
            let controller = LoopController::open(&root, &config, &EnvOverrides::from_env());
            ExitInterceptor::new(&controller).intercept(input.agent_output().as_deref())
        }
        None => {
            warn!("no workspace root; allowing exit");
            ExitDecision::allow(AllowReason::NoLoop, None)
        }
    };
    match serde_json::to_string(&decision.to_response()) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            warn!(err = %err, "failed to serialize hook response");
            println!("{{}}");
        }
    }
    exit_codes::OK
}

fn cmd_run(controller: &LoopController, config: &RalphConfig, env: &EnvOverrides) -> LoopResult<i32> {
    let agent = CommandAgent::new(config.agent.command.clone())?;
    let tcp = config.outage.enabled.then(|| {
        TcpProbe::new(
            config.outage.probe_addr.clone(),
            Duration::from_millis(config.outage.probe_timeout_ms),
        )
    });
    let guard = OutageGuard::new(
        controller.store(),
        SystemProbe::new(tcp, env.simulate_offline),
        StderrNotifier,
        Duration::from_secs(config.outage.poll_interval_secs),
    )
    .with_max_wait(Duration::from_secs(config.outage.max_wait_secs));
    let settings = RunSettings {
        timeout: Duration::from_secs(config.agent.timeout_secs),
        output_limit_bytes: config.agent.output_limit_bytes,
    };

    let outcome = run_loop(controller, &agent, &guard, &settings, |report| {
        let verdict = match report.decision {
            ExitDecision::Block { banner, .. } => banner.clone(),
            ExitDecision::Allow { message, .. } => {
                message.clone().unwrap_or_else(|| "exit allowed".to_string())
            }
        };
        eprintln!("cycle {} (agent exit {:?}): {verdict}", report.cycle, report.run.exit_code);
    })?;

    let cycles = outcome.cycles;
    match outcome.stop {
        LoopStop::Completed => {
            println!("✅ Loop complete after {cycles} cycles");
            Ok(exit_codes::OK)
        }
        LoopStop::BatchComplete => {
            println!("✅ Batch complete after {cycles} cycles");
            Ok(exit_codes::OK)
        }
        LoopStop::LimitReached => {
            println!("🛑 Iteration limit reached after {cycles} cycles");
            Ok(exit_codes::INCOMPLETE)
        }
        LoopStop::Inactive => {
            println!("Loop is no longer active after {cycles} cycles");
            Ok(exit_codes::OK)
        }
        LoopStop::Unavailable { message } => {
            eprintln!(
                "run: {}",
                message.unwrap_or_else(|| "loop state unavailable".to_string())
            );
            Ok(exit_codes::FAILURE)
        }
    }
}

fn print_limits(state: &LoopState) {
    println!(
        "Iteration: {}/{}",
        state.iteration,
        limit_text(state.max_iterations)
    );
    println!(
        "Completion promise: {}",
        state.completion_promise.as_deref().unwrap_or("none")
    );
}

fn limit_text(limit: u32) -> String {
    if limit == 0 {
        "∞".to_string()
    } else {
        limit.to_string()
    }
}
