//! typegate CLI
//!
//! Entry point for the `typegate` command-line tool. Exit codes for
//! `check`: 0 all partitions clean, 1 type errors reported, 2 the checker
//! itself could not run (crash, timeout, environment resolution error).

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use typegate::cache::ResultCache;
use typegate::cancel::{install_signal_handler, CancelToken};
use typegate::pipeline::{Pipeline, PipelineConfig};

#[derive(Parser)]
#[command(name = "typegate")]
#[command(about = "Partitioned, cached runs of an external type checker", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the type checker over the selected files
    Check {
        /// Glob patterns selecting files (default: everything configured)
        patterns: Vec<String>,

        /// Path to repo config file (default: typegate.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Concurrent partition executions
        #[arg(long, short = 'j')]
        jobs: Option<usize>,

        /// Per-partition timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Skip the result cache for this run
        #[arg(long)]
        no_cache: bool,

        /// Output the report as JSON
        #[arg(long)]
        json: bool,

        /// Verbose progress output
        #[arg(long, short = 'v')]
        verbose: bool,
    },

    /// Print the partition plan without executing
    Plan {
        /// Glob patterns selecting files (default: everything configured)
        patterns: Vec<String>,

        /// Path to repo config file (default: typegate.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// List configured locked environments
    Environments {
        /// Path to repo config file (default: typegate.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove all cached checker results
    Clean {
        /// Path to repo config file (default: typegate.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check {
            patterns,
            config,
            jobs,
            timeout,
            no_cache,
            json,
            verbose,
        } => run_command_check(patterns, config, jobs, timeout, no_cache, json, verbose),
        Commands::Plan { patterns, config } => run_command_plan(patterns, config),
        Commands::Environments { config, json } => run_command_environments(config, json),
        Commands::Clean { config } => run_command_clean(config),
    }
}

fn pipeline_settings(config: Option<PathBuf>) -> PipelineConfig {
    PipelineConfig {
        config_path: config.unwrap_or_else(|| PathBuf::from("typegate.toml")),
        ..PipelineConfig::default()
    }
}

#[allow(clippy::too_many_arguments)]
fn run_command_check(
    patterns: Vec<String>,
    config: Option<PathBuf>,
    jobs: Option<usize>,
    timeout: Option<u64>,
    no_cache: bool,
    json: bool,
    verbose: bool,
) {
    let mut settings = pipeline_settings(config);
    settings.jobs = jobs;
    settings.timeout_seconds = timeout;
    settings.no_cache = no_cache;
    settings.verbose = verbose;

    let cancel = CancelToken::new();
    if let Err(e) = install_signal_handler(cancel.clone()) {
        eprintln!("Warning: failed to install signal handler: {e}");
    }

    let pipeline = match Pipeline::load(settings) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(e.exit_code());
        }
    };

    match pipeline.run(&patterns, &cancel) {
        Ok(report) => {
            if json {
                match report.to_json() {
                    Ok(out) => println!("{out}"),
                    Err(e) => {
                        eprintln!("Error serializing report: {e}");
                        process::exit(2);
                    }
                }
            } else {
                println!("{}", report.human_summary());
            }
            process::exit(report.exit_class.as_i32());
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(e.exit_code());
        }
    }
}

fn run_command_plan(patterns: Vec<String>, config: Option<PathBuf>) {
    let pipeline = match Pipeline::load(pipeline_settings(config)) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(e.exit_code());
        }
    };

    match pipeline.plan(&patterns) {
        Ok(plan) => {
            if plan.is_empty() {
                println!("No files selected");
                return;
            }
            for partition in &plan {
                println!(
                    "{} [{} via {}]",
                    partition.label(),
                    partition.environment.tool_identity(),
                    partition.environment.name
                );
                for file in &partition.files {
                    println!("  {}", file.display());
                }
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(e.exit_code());
        }
    }
}

fn run_command_clean(config: Option<PathBuf>) {
    let settings = pipeline_settings(config);
    let pipeline = match Pipeline::load(settings.clone()) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(e.exit_code());
        }
    };

    let cache_dir = settings.project_root.join(&pipeline.repo_config().cache.dir);
    let result = ResultCache::open(&cache_dir).and_then(|cache| cache.clear());
    match result {
        Ok(()) => println!("Cleared result cache at {}", cache_dir.display()),
        Err(e) => {
            eprintln!("Error clearing cache: {e}");
            process::exit(2);
        }
    }
}

fn run_command_environments(config: Option<PathBuf>, json: bool) {
    let pipeline = match Pipeline::load(pipeline_settings(config)) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(e.exit_code());
        }
    };

    if json {
        let environments: Vec<serde_json::Value> = pipeline
            .store()
            .environments()
            .map(|env| {
                serde_json::json!({
                    "name": env.name,
                    "tool": env.tool_identity(),
                    "pins": env.pins.len(),
                    "precedence": env.precedence,
                    "hash": env.content_hash,
                    "lockfile": env.path.display().to_string(),
                })
            })
            .collect();
        match serde_json::to_string_pretty(&environments) {
            Ok(out) => println!("{out}"),
            Err(e) => {
                eprintln!("Error serializing environments: {e}");
                process::exit(2);
            }
        }
    } else {
        for env in pipeline.store().environments() {
            println!(
                "{}: {} ({} pin(s), precedence {}, hash {})",
                env.name,
                env.tool_identity(),
                env.pins.len(),
                env.precedence,
                &env.content_hash[..12]
            );
        }
    }
}
