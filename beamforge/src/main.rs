//! Beam-search code generation engine.
//!
//! Keeps its config in `.beamforge/config.toml` and the session checkpoint in
//! `.beamforge/state/checkpoint.json`, so `generate` can be suspended (for a
//! clarifying question or after a failure) and continued with `resume`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use beamforge::actor::ActorError;
use beamforge::diff::{apply_diff, unified_diff};
use beamforge::exit_codes;
use beamforge::io::config::{EngineConfig, load_config};
use beamforge::io::events::{ProgressEvent, channel};
use beamforge::io::init::{FORGE_DIR_NAME, ForgePaths, InitOptions, init_forge};
use beamforge::io::model::clients_from_config;
use beamforge::io::prompt::PromptRegistry;
use beamforge::io::sandbox::SandboxRuntime;
use beamforge::io::workspace::{read_tree, write_tree};
use beamforge::session::{Session, SessionOutcome, SessionState};
use beamforge::stage::StageMachine;
use beamforge::tree::FileMap;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser)]
#[command(
    name = "beamforge",
    version,
    about = "Beam-search code generation with sandboxed validation"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.beamforge/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a new session from a request.
    Generate {
        /// What to build.
        #[arg(short, long)]
        prompt: String,
        /// Existing project to start from.
        #[arg(long)]
        from: Option<PathBuf>,
        /// Where to write the result (defaults to `--from`, else the current directory).
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Continue the checkpointed session with an answer, edit request or retry hint.
    Resume {
        #[arg(short, long)]
        feedback: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print the unified diff between two directories.
    Diff { before: PathBuf, after: PathBuf },
    /// Apply a unified diff to a directory.
    Apply { dir: PathBuf, patch: PathBuf },
}

fn main() {
    beamforge::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ActorError>().is_some() {
        exit_codes::EXHAUSTED
    } else {
        exit_codes::INVALID
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = ForgePaths::new(std::env::current_dir().context("resolve current directory")?);
    match cli.command {
        Command::Init { force } => {
            let paths = init_forge(&paths.root, &InitOptions { force })?;
            println!("{}", paths.config_path.display());
            Ok(exit_codes::OK)
        }
        Command::Generate { prompt, from, out } => {
            let config = load_config(&paths.config_path)?;
            let files = match &from {
                Some(dir) => read_tree(dir, &project_ignore(&config))?,
                None => FileMap::new(),
            };
            let out = out.or(from).unwrap_or_else(|| paths.root.clone());
            let state = SessionState::new(prompt, files);
            drive(&paths, config, state, None, &out)
        }
        Command::Resume { feedback, out } => {
            let config = load_config(&paths.config_path)?;
            let state = Session::load(&paths.checkpoint_path)?;
            let out = out.unwrap_or_else(|| paths.root.clone());
            drive(&paths, config, state, Some(feedback), &out)
        }
        Command::Diff { before, after } => {
            let config = load_config(&paths.config_path)?;
            let before = read_tree(&before, &project_ignore(&config))?;
            let after = read_tree(&after, &project_ignore(&config))?;
            print!("{}", unified_diff(&before, &after));
            Ok(exit_codes::OK)
        }
        Command::Apply { dir, patch } => {
            let config = load_config(&paths.config_path)?;
            let patch = fs::read_to_string(&patch)
                .with_context(|| format!("read {}", patch.display()))?;
            let before = read_tree(&dir, &project_ignore(&config))?;
            let after = apply_diff(&before, &patch)?;
            write_tree(&dir, &before, &after)?;
            Ok(exit_codes::OK)
        }
    }
}

/// Directories skipped when reading a project tree: sync ignores plus engine state.
fn project_ignore(config: &EngineConfig) -> Vec<String> {
    let mut ignore = config.sandbox.sync_ignore.clone();
    ignore.push(FORGE_DIR_NAME.to_string());
    ignore
}

fn drive(
    paths: &ForgePaths,
    config: EngineConfig,
    mut state: SessionState,
    input: Option<String>,
    out: &Path,
) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    runtime.block_on(async move {
        let prompts = Arc::new(PromptRegistry::load(config.prompts_dir.as_deref())?);
        let (model, vision) = clients_from_config(&config.model);
        let sandbox = Arc::new(SandboxRuntime::from_config(&config.sandbox));
        let (events, rx) = channel();
        let printer = tokio::spawn(print_events(rx));

        let machine = StageMachine::new(Arc::new(config), prompts, model, vision, sandbox)
            .with_events(events);
        let session = Session::new(machine).with_checkpoint(&paths.checkpoint_path);
        let outcome = match input {
            Some(input) => session.resume(&mut state, input).await,
            None => session.run(&mut state).await,
        };
        drop(session);
        printer.await.context("join event printer")?;

        match outcome? {
            SessionOutcome::Complete { files, .. } => {
                write_tree(out, &state.stage.baseline, &files)?;
                Ok(exit_codes::OK)
            }
            SessionOutcome::NeedsInput { question } => {
                eprintln!("{question}");
                Ok(exit_codes::NEEDS_INPUT)
            }
        }
    })
}

async fn print_events(mut rx: UnboundedReceiver<ProgressEvent>) {
    while let Some(event) = rx.recv().await {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::warn!(%err, "progress event not serializable"),
        }
    }
}
