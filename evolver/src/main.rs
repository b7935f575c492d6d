//! Self-evolving project loop.
//!
//! Each cycle asks a proposer for a small change to the project, validates
//! it against the engine, and commits it or rolls it back.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use evolver::core::diagnostics::parse_output;
use evolver::core::strategy::choose;
use evolver::cycle::{Collaborators, run_cycle};
use evolver::exit_codes;
use evolver::io::capabilities::scan_capabilities;
use evolver::io::config::{CONFIG_RELATIVE_PATH, EvolverConfig, load_config};
use evolver::io::cycle_log::CycleLog;
use evolver::io::git::Git;
use evolver::io::init::{InitOptions, init_workspace};
use evolver::io::static_check::check_written_files;
use evolver::io::workspace::normalize_path;
use evolver::logging;
use evolver::looping::{LoopOptions, run_loop};

#[derive(Parser)]
#[command(
    name = "evolver",
    version,
    about = "Propose, validate and commit-or-rollback changes to a project, one cycle at a time"
)]
struct Cli {
    /// Repository root containing `.evolver/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.evolver/config.toml`, the narrative files and an empty project.
    Init {
        /// Overwrite existing evolver-owned files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run cycles until `max_cycles` (forever when unset).
    Run {
        #[arg(long)]
        max_cycles: Option<u64>,
        /// Override the configured pause between cycles.
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Run exactly one cycle.
    Cycle,
    /// Run the static pre-check on project files.
    Check {
        /// Paths relative to the project dir (or prefixed with it).
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Parse engine output into diagnostics (stdin when FILE is omitted).
    Parse { file: Option<PathBuf> },
    /// Print the strategy the next cycle would use.
    Strategy,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Run {
            max_cycles,
            interval_secs,
        } => cmd_run(root, max_cycles, interval_secs),
        Command::Cycle => cmd_cycle(root),
        Command::Check { files } => cmd_check(root, &files),
        Command::Parse { file } => cmd_parse(file.as_deref()),
        Command::Strategy => cmd_strategy(root),
    }
}

fn load(root: &Path) -> Result<EvolverConfig> {
    let path = root.join(CONFIG_RELATIVE_PATH);
    load_config(&path).with_context(|| format!("load {}", path.display()))
}

fn require_repo(root: &Path) -> Result<()> {
    if !Git::new(root).is_repo() {
        return Err(anyhow!("{} is not a git work tree", root.display()));
    }
    Ok(())
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let layout = init_workspace(root, &InitOptions { force })?;
    println!("initialized {}", layout.config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, max_cycles: Option<u64>, interval_secs: Option<u64>) -> Result<i32> {
    require_repo(root)?;
    let options = LoopOptions {
        max_cycles,
        interval: interval_secs.map(std::time::Duration::from_secs),
    };
    let outcome = run_loop(
        root,
        &options,
        |cfg| {
            let collaborators = Collaborators::from_config(root, cfg);
            run_cycle(root, cfg, &collaborators.deps())
        },
        thread::sleep,
    )?;
    println!(
        "cycles: {} committed: {} failed: {} faults: {}",
        outcome.cycles_run, outcome.committed, outcome.failed, outcome.faults
    );
    Ok(exit_codes::OK)
}

fn cmd_cycle(root: &Path) -> Result<i32> {
    require_repo(root)?;
    let cfg = load(root)?;
    let collaborators = Collaborators::from_config(root, &cfg);
    let report = run_cycle(root, &cfg, &collaborators.deps())?;
    println!("{}", serde_json::to_string_pretty(&report.record)?);
    if report.committed() {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::DIAGNOSTICS)
    }
}

fn cmd_check(root: &Path, files: &[String]) -> Result<i32> {
    let cfg = load(root)?;
    let layout = cfg.layout(root);
    let rels = files
        .iter()
        .map(|file| normalize_path(&layout.project_rel, file).map_err(|e| anyhow!("{e}")))
        .collect::<Result<Vec<_>>>()?;
    let records = check_written_files(
        &layout.project_dir,
        &rels,
        cfg.validation.scene_ref_check,
    );
    for record in &records {
        println!("{record}");
    }
    if records.is_empty() {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::DIAGNOSTICS)
    }
}

fn cmd_parse(file: Option<&Path>) -> Result<i32> {
    let text = match file {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
        }
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin")?;
            buf
        }
    };
    let records = parse_output(&text);
    for record in &records {
        println!("{record}");
    }
    if records.is_empty() {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::DIAGNOSTICS)
    }
}

fn cmd_strategy(root: &Path) -> Result<i32> {
    let cfg = load(root)?;
    let layout = cfg.layout(root);
    let history = CycleLog::from_layout(&layout, cfg.cycle.active_log_limit).read_active()?;
    let caps = scan_capabilities(&layout.project_dir);
    let decision = choose(&history, Some(&caps));
    println!("{}", decision.strategy.as_str().to_uppercase());
    println!("{}", decision.explanation);
    println!("capabilities: {}", caps.summary());
    Ok(exit_codes::OK)
}
