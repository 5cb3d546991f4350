//! axonflow CLI - content-addressed pipeline runner

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;

use axonflow::config::RunConfig;
use axonflow::error::{EngineError, FixSuggestion};
use axonflow::pipeline_file;
use axonflow::report::NodeOutcome;

#[derive(Parser)]
#[command(name = "axonflow")]
#[command(about = "axonflow - content-addressed DAG pipeline runner")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline file
    Run {
        /// Path to pipeline .yaml file
        file: PathBuf,

        /// Execution plugin (serial, pool, batch)
        #[arg(short, long, default_value = "pool")]
        plugin: String,

        /// Base directory for work/, cache/ and crash/ output
        #[arg(short, long, default_value = "axonflow-out")]
        base_dir: PathBuf,

        /// Worker bound for the pool plugin
        #[arg(short, long)]
        workers: Option<usize>,

        /// Plugin-specific arguments as inline JSON
        #[arg(long)]
        plugin_args: Option<String>,
    },

    /// Validate a pipeline file (parse, schema-check and flatten only)
    Validate {
        /// Path to pipeline .yaml file
        file: PathBuf,
    },

    /// Print the flattened dependency graph as Graphviz DOT
    Graph {
        /// Path to pipeline .yaml file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            file,
            plugin,
            base_dir,
            workers,
            plugin_args,
        } => run_pipeline(&file, &plugin, base_dir, workers, plugin_args).await,
        Commands::Validate { file } => validate_pipeline(&file),
        Commands::Graph { file } => print_graph(&file),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

async fn run_pipeline(
    file: &Path,
    plugin: &str,
    base_dir: PathBuf,
    workers: Option<usize>,
    plugin_args: Option<String>,
) -> Result<(), EngineError> {
    let workflow = pipeline_file::load(file)?;

    let mut config = RunConfig::new(base_dir);
    if let Some(workers) = workers {
        config = config.with_max_workers(workers);
    }
    if let Some(raw) = plugin_args {
        let args = serde_json::from_str(&raw).map_err(|e| EngineError::PluginArgs {
            plugin: plugin.to_string(),
            details: e.to_string(),
        })?;
        config = config.with_plugin_args(args);
    }

    // Ctrl-C stops new submissions; running nodes finish first
    let abort = config.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} stopping after running nodes finish", "Interrupted:".yellow().bold());
            abort.abort();
        }
    });

    println!(
        "{} Running '{}' with plugin: {}",
        "→".cyan(),
        workflow.name().cyan().bold(),
        plugin.cyan()
    );

    let report = workflow.run(plugin, config).await?;

    for (node, outcome) in report.outcomes() {
        match outcome {
            NodeOutcome::Done => println!("  {} {}", "✓".green(), node),
            NodeOutcome::Cached => println!("  {} {} {}", "✓".green(), node, "(cached)".dimmed()),
            NodeOutcome::Failed { error, propagated } => {
                let tag = if *propagated { "(upstream)" } else { "" };
                println!("  {} {} {}", "✗".red(), node, tag.dimmed());
                if !propagated {
                    println!("      {}", error.red());
                }
            }
        }
    }

    if report.aborted {
        println!("{} Run aborted", "!".yellow().bold());
    }
    println!(
        "{} {} completed, {} failed in {:.1}s",
        if report.success() { "✓".green().bold() } else { "✗".red().bold() },
        report.completed(),
        report.failed(),
        report.duration.as_secs_f64()
    );

    if !report.success() {
        std::process::exit(1);
    }
    Ok(())
}

fn validate_pipeline(file: &Path) -> Result<(), EngineError> {
    let workflow = pipeline_file::load(file)?;
    let name = workflow.name().to_string();
    let flat = workflow.flatten()?;

    println!("{} Pipeline '{}' is valid", "✓".green(), name);
    println!("  Nodes: {}", flat.dag.len());
    println!("  Roots: {}", flat.dag.roots().len());
    Ok(())
}

fn print_graph(file: &Path) -> Result<(), EngineError> {
    let workflow = pipeline_file::load(file)?;
    let flat = workflow.flatten()?;
    print!("{}", flat.to_dot());
    Ok(())
}
