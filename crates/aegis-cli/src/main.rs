//! Aegis CLI
//!
//! Command-line interface for PGD adversarial training.
//!
//! # Commands
//!
//! - `aegis train --config <file>` - Train a classifier, optionally resuming
//! - `aegis eval --config <file>` - Natural and adversarial accuracy of a checkpoint
//! - `aegis init-config <file>` - Write a default configuration

use std::path::{Path, PathBuf};

use aegis_train::{evaluate_checkpoint, TrainConfig, Trainer};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "aegis")]
#[command(about = "Adversarial training with L-infinity projected gradient descent")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run adversarial training
    Train {
        /// Training configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Continue from the newest checkpoint in model_dir
        #[arg(long)]
        resume: bool,
        /// Print the training report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Evaluate a checkpoint on natural and PGD inputs
    Eval {
        /// Training configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Checkpoint file (default: newest in model_dir)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Print the evaluation report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write a default configuration file
    InitConfig {
        /// Destination path
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

fn init_logging(verbose: u8) -> anyhow::Result<()> {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<TrainConfig> {
    TrainConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn train(config_path: &Path, resume: bool, json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let model_dir = config.model_dir.clone();
    let mut trainer = Trainer::new(config)
        .with_context(|| format!("Failed to set up training in {}", model_dir.display()))?;

    if resume {
        match trainer.resume().context("Failed to resume")? {
            Some(step) => info!("Continuing at step {}", step + 1),
            None => info!("No checkpoint in {}, starting fresh", model_dir.display()),
        }
    }

    let report = trainer.run().context("Training failed")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Trained steps {}..{} in {}",
            report.start_step,
            report.final_step,
            model_dir.display()
        );
        if let Some(path) = &report.last_checkpoint {
            println!("Last checkpoint: {}", path.display());
        }
        if let Some(eval) = &report.last_eval {
            println!("{eval}");
        }
    }
    Ok(())
}

fn eval(config_path: &Path, checkpoint: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let (step, report) = evaluate_checkpoint(&config, checkpoint).context("Evaluation failed")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Checkpoint at step {step}, {} examples", report.num_examples);
        println!("{report}");
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    TrainConfig::default()
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Train {
            config,
            resume,
            json,
        } => train(&config, resume, json),
        Commands::Eval {
            config,
            checkpoint,
            json,
        } => eval(&config, checkpoint.as_deref(), json),
        Commands::InitConfig { path, force } => init_config(&path, force),
    }
}
