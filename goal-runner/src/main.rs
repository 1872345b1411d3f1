//! Autonomous goal-execution agent.
//!
//! Producers queue goals with `add`, `cancel`, `tier` and `answer`; `run`
//! drives the single orchestrator loop over the shared data directory
//! (`.goal-runner/` by default).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use goal_runner::agents::monitor::GeneratorAssessor;
use goal_runner::agents::planner::{
    GeneratorPlanner, InvalidPlanError, PlanOutcome, parse_plan_response,
};
use goal_runner::agents::selector::GeneratorSelector;
use goal_runner::core::types::{Goal, StepStatus};
use goal_runner::cycle::{Collaborators, CycleOutcome, Orchestrator};
use goal_runner::exit_codes;
use goal_runner::io::config::RunnerConfig;
use goal_runner::io::db::Database;
use goal_runner::io::generator::{CommandGenerator, Generator, RateLimitedGenerator};
use goal_runner::io::goal_store::GoalStore;
use goal_runner::io::init::{DEFAULT_DATA_DIR, DataPaths, InitOptions, init_data_dir};
use goal_runner::io::rate_limiter::RateLimiter;
use goal_runner::io::wake::WakeSignal;
use goal_runner::logging;
use goal_runner::looping::{IdleGate, LoopOptions, run_loop};
use goal_runner::producer::{GoalNotActive, Producer, TierChange};
use goal_runner::react::ThreadSleeper;

/// How often the wake file is polled for touches from other processes.
const WAKE_POLL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(
    name = "goal-runner",
    version,
    about = "Autonomous goal-execution agent with tiered rate limits"
)]
struct Cli {
    /// Data directory holding config.toml, the goal database and the wake file.
    #[arg(long, global = true, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the data directory with a default config.toml.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Queue a new goal and print its id.
    Add {
        text: String,
        /// Tier to run the goal on (defaults to `default_tier`).
        #[arg(long)]
        tier: Option<String>,
    },
    /// Cancel an active goal.
    Cancel { id: String },
    /// Change a goal's tier. Resumes goals waiting for a tier decision.
    Tier { id: String, tier: String },
    /// Answer a goal that is waiting for user input.
    Answer { id: String, text: String },
    /// List active goals, oldest first.
    Status,
    /// List archived goals, newest first.
    Archive {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        per_page: u32,
    },
    /// Run the orchestrator loop.
    Run {
        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,
        /// Exit once no runnable goal is left.
        #[arg(long)]
        until_idle: bool,
    },
    /// Print per-tier request usage and daily surplus.
    Usage,
    /// Read or write user profile entries passed to the planner.
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
    /// Check a planner response file against the plan schema and structure.
    Validate { file: PathBuf },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Print one value, or every entry when no key is given.
    Get { key: Option<String> },
    Set { key: String, value: String },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("{err:#}");
        std::process::exit(exit_code(&err));
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<InvalidPlanError>().is_some() {
        exit_codes::INVALID_PLAN
    } else if err.downcast_ref::<GoalNotActive>().is_some() {
        exit_codes::NOT_ACTIVE
    } else {
        exit_codes::INVALID
    }
}

fn run(cli: Cli) -> Result<()> {
    let paths = DataPaths::new(&cli.data_dir);
    match cli.command {
        Command::Init { force } => cmd_init(&cli.data_dir, force),
        Command::Add { text, tier } => {
            let goal = producer(&paths)?.submit_goal(&text, tier.as_deref())?;
            println!("{}", goal.id);
            Ok(())
        }
        Command::Cancel { id } => producer(&paths)?.cancel_goal(&id),
        Command::Tier { id, tier } => match producer(&paths)?.set_tier(&id, &tier)? {
            TierChange::Updated => Ok(()),
            TierChange::Superseded { new_goal_id } => {
                println!("{new_goal_id}");
                Ok(())
            }
        },
        Command::Answer { id, text } => {
            let goal = producer(&paths)?.provide_input(&id, &text)?;
            println!("{}", goal.id);
            Ok(())
        }
        Command::Status => cmd_status(&paths),
        Command::Archive { page, per_page } => cmd_archive(&paths, page, per_page),
        Command::Run { once, until_idle } => cmd_run(&paths, once, until_idle),
        Command::Usage => cmd_usage(&paths),
        Command::Profile { action } => cmd_profile(&paths, action),
        Command::Validate { file } => cmd_validate(&file),
    }
}

fn cmd_init(data_dir: &Path, force: bool) -> Result<()> {
    let paths = init_data_dir(data_dir, &InitOptions { force })?;
    println!("initialized {}", paths.root.display());
    Ok(())
}

fn open_database(paths: &DataPaths) -> Result<(RunnerConfig, Database)> {
    let config = paths
        .load_config()
        .with_context(|| format!("load {}", paths.config_path.display()))?;
    let db = Database::open(&paths.db_path, &config.store)?;
    Ok((config, db))
}

fn producer(paths: &DataPaths) -> Result<Producer> {
    let (config, db) = open_database(paths)?;
    Ok(Producer::new(GoalStore::new(db), &config).with_wake_file(&paths.wake_path))
}

fn cmd_status(paths: &DataPaths) -> Result<()> {
    let goals = producer(paths)?.list_active()?;
    if goals.is_empty() {
        println!("no active goals");
    }
    for goal in &goals {
        println!("{}", describe_goal(goal));
    }
    Ok(())
}

fn cmd_archive(paths: &DataPaths, page: u32, per_page: u32) -> Result<()> {
    let archived = producer(paths)?.list_archived(page, per_page)?;
    println!(
        "page {} ({} per page, {} archived)",
        archived.page, archived.per_page, archived.total
    );
    for goal in &archived.goals {
        println!("{}", describe_goal(goal));
    }
    Ok(())
}

fn describe_goal(goal: &Goal) -> String {
    let done = goal
        .plan
        .iter()
        .filter(|step| step.status == StepStatus::Complete)
        .count();
    format!(
        "{}  {:<22}  {}  {}/{} steps  {}",
        goal.id,
        goal.status.as_str(),
        goal.preferred_tier,
        done,
        goal.plan.len(),
        goal.text
    )
}

fn cmd_run(paths: &DataPaths, once: bool, until_idle: bool) -> Result<()> {
    let (config, db) = open_database(paths)?;
    let store = GoalStore::new(db.clone());
    let generator: Arc<dyn Generator> = Arc::new(RateLimitedGenerator::new(
        CommandGenerator::new(&config),
        RateLimiter::new(db.clone(), &config),
    ));
    let collaborators = Collaborators {
        generator: generator.clone(),
        planner: Arc::new(
            GeneratorPlanner::new(generator.clone(), &config).with_profile(store.clone()),
        ),
        selector: Arc::new(GeneratorSelector::new(generator.clone(), &config)),
        assessor: Arc::new(GeneratorAssessor::new(generator, &config)),
        sleeper: Arc::new(ThreadSleeper),
    };
    let output_dir = paths.output_dir(&config);
    let mut idle = IdleGate::new(RateLimiter::new(db, &config), &config.idle);
    let orchestrator = Orchestrator::new(store, config, output_dir, collaborators);

    let (_waker, wake) = WakeSignal::watching(&paths.wake_path, WAKE_POLL)?;
    let options = LoopOptions {
        max_cycles: once.then_some(1),
        stop_when_idle: until_idle,
    };
    let outcome = run_loop(
        &orchestrator,
        &wake,
        &mut idle,
        &options,
        |cycle| {
            if let Some(line) = describe_cycle(cycle) {
                println!("{line}");
            }
        },
        |report| {
            let surplus: Vec<String> = report
                .usage
                .iter()
                .map(|tier| format!("{} {:+.1}", tier.tier, tier.surplus))
                .collect();
            println!(
                "idle for {}s; quota surplus available ({})",
                report.idle_for.as_secs(),
                surplus.join(", ")
            );
        },
    )?;
    eprintln!("stopped after {} cycles ({:?})", outcome.cycles, outcome.stop);
    Ok(())
}

fn describe_cycle(outcome: &CycleOutcome) -> Option<String> {
    match outcome {
        CycleOutcome::Idle => None,
        CycleOutcome::NoProgress { goal_id } => Some(format!("{goal_id}: no eligible step")),
        CycleOutcome::Advanced { goal_id, completed } => {
            let ids: Vec<String> = completed.iter().map(u32::to_string).collect();
            Some(format!("{goal_id}: completed steps [{}]", ids.join(", ")))
        }
        CycleOutcome::Deferred { goal_id, wait } => Some(format!(
            "{goal_id}: rate limited; retrying in {}s",
            wait.as_secs()
        )),
        CycleOutcome::Stopped { goal_id, status } => Some(format!("{goal_id}: {status}")),
        CycleOutcome::Replanned {
            old_goal_id,
            new_goal_id,
        } => Some(format!("{old_goal_id}: re-planned as {new_goal_id}")),
    }
}

fn cmd_usage(paths: &DataPaths) -> Result<()> {
    let (config, db) = open_database(paths)?;
    let limiter = RateLimiter::new(db, &config);
    println!("day elapsed: {:.1}%", limiter.elapsed_day_pct());
    println!(
        "{:<8} {:>10} {:>10} {:>8} {:>8}",
        "tier", "minute", "day", "usage%", "surplus"
    );
    for tier in limiter.report()? {
        println!(
            "{:<8} {:>10} {:>10} {:>8.1} {:>+8.1}",
            tier.tier,
            format!("{}/{}", tier.last_minute, tier.rpm),
            format!("{}/{}", tier.last_day, tier.rpd),
            tier.usage_pct,
            tier.surplus
        );
    }
    Ok(())
}

fn cmd_profile(paths: &DataPaths, action: ProfileAction) -> Result<()> {
    let (_, db) = open_database(paths)?;
    let store = GoalStore::new(db);
    match action {
        ProfileAction::Get { key: Some(key) } => {
            let value = store
                .profile_get(&key)?
                .ok_or_else(|| anyhow!("profile key '{key}' is not set"))?;
            println!("{value}");
        }
        ProfileAction::Get { key: None } => {
            for (key, value) in store.profile_list()? {
                println!("{key}={value}");
            }
        }
        ProfileAction::Set { key, value } => store.profile_set(&key, &value)?,
    }
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<()> {
    let raw = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    match parse_plan_response(&raw).map_err(|errors| InvalidPlanError { errors })? {
        PlanOutcome::Plan { steps, .. } => println!("ok: {} steps", steps.len()),
        PlanOutcome::Clarify { question, .. } => println!("ok: clarification: {question}"),
    }
    Ok(())
}
