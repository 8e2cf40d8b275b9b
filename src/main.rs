//! elk-rs CLI: train and evaluate probes on cached hidden states

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use elk_rs::{
    CachedHiddenStates, DataConfig, Elicit, ElicitConfig, Eval, EvalConfig, Normalization,
    PromptEnsembling, Run, RunConfig, SupervisedMode, SupervisedOptions,
};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "elk-rs")]
#[command(about = "Eliciting latent knowledge from transformer hidden states")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Train supervised probes on every layer
    Elicit {
        #[command(flatten)]
        run: RunArgs,

        /// Supervised mode: single, cv, inlp or none
        #[arg(long, default_value = "single")]
        supervised: String,

        /// Number of INLP iterations
        #[arg(long, default_value_t = 4)]
        inlp_iterations: usize,

        /// Folds used by cross-validation
        #[arg(long, default_value_t = 5)]
        cv_folds: usize,
    },

    /// Evaluate the reporters of a finished run
    Eval {
        /// Experiment directory with `reporters/` (relative to $ELK_DIR)
        source: PathBuf,

        #[command(flatten)]
        run: RunArgs,

        /// Do not evaluate supervised probes
        #[arg(long)]
        skip_supervised: bool,

        /// Reporters were trained one per prompt template
        #[arg(long)]
        probe_per_prompt: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Datasets to use (sub-directories of the cache directory)
    #[arg(required = true)]
    datasets: Vec<String>,

    /// Directory with extracted hidden states
    #[arg(long, default_value = "hidden_states")]
    cache_dir: PathBuf,

    /// Output directory (a fresh one is created when omitted)
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Normalization: none, elementwise or meanonly
    #[arg(long, default_value = "none")]
    normalization: Normalization,

    /// Number of GPUs to use (-1 for all)
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    num_gpus: i64,

    /// Worker count when running on CPU
    #[arg(long, default_value_t = 1)]
    cpu_workers: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Write debug.log next to the results
    #[arg(long)]
    debug: bool,
}

impl From<RunArgs> for RunConfig {
    fn from(args: RunArgs) -> Self {
        Self {
            data: DataConfig {
                datasets: args.datasets,
                cache_dir: args.cache_dir,
            },
            normalization: args.normalization,
            num_gpus: args.num_gpus,
            cpu_workers: args.cpu_workers,
            seed: args.seed,
            debug: args.debug,
            out_dir: args.out_dir,
        }
    }
}

fn parse_supervised(mode: &str) -> Result<Option<SupervisedMode>> {
    match mode {
        "none" => Ok(None),
        other => Ok(Some(other.parse()?)),
    }
}

/// Stop the sweep on Ctrl-C; finished layers are still written
fn stop_on_ctrl_c(run: &Run) -> Result<()> {
    let flag = run.interrupt_flag();
    ctrlc::set_handler(move || {
        warn!("Ctrl-C received, stopping after the layers in progress");
        flag.store(true, Ordering::SeqCst);
    })?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let results = match cli.command {
        Command::Elicit {
            run,
            supervised,
            inlp_iterations,
            cv_folds,
        } => {
            let cfg = ElicitConfig {
                run: run.into(),
                supervised: parse_supervised(&supervised)?,
                supervised_options: SupervisedOptions {
                    inlp_iterations,
                    cv_folds,
                    ..Default::default()
                },
            };
            let elicit = Elicit::new(cfg, &CachedHiddenStates)?;
            stop_on_ctrl_c(elicit.run())?;
            let results = elicit.execute()?;
            info!("Results written to {}", elicit.run().out_dir().display());
            results
        }
        Command::Eval {
            source,
            run,
            skip_supervised,
            probe_per_prompt,
        } => {
            let cfg = EvalConfig {
                run: run.into(),
                source,
                skip_supervised,
                probe_per_prompt,
            };
            let eval = Eval::new(cfg, &CachedHiddenStates)?;
            stop_on_ctrl_c(eval.run())?;
            let results = eval.execute()?;
            info!("Results written to {}", eval.run().out_dir().display());
            results
        }
    };

    println!("\n=== Results ===");
    for applied in &results {
        for (table, rows) in &applied.tables {
            let full = rows
                .iter()
                .filter(|r| r.prompt_ensembling == PromptEnsembling::Full)
                .map(|r| r.eval.accuracy.estimate)
                .collect::<Vec<_>>();
            if full.is_empty() {
                continue;
            }
            let mean = full.iter().sum::<f64>() / full.len() as f64;
            println!("Layer {:2} {table:>8}: {:.1}%", applied.layer, mean * 100.0);
        }
    }

    Ok(())
}
