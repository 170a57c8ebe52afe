#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use coherence_context::{
    config::Config, create_default_engine, telemetry, ContextEngine, ContextScope,
    GeneratorOptions, InMemoryGraph, StrategyId,
};
#[cfg(feature = "cli")]
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "coherence-context", about = "Build coherence-check context over a design graph")]
struct Cli {
    /// Graph snapshot (JSON)
    #[arg(long, global = true, default_value = "graph.json")]
    graph: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Build context for one node
    Context {
        #[arg(long, default_value = "hierarchical_graph")]
        strategy: String,
        #[arg(long)]
        node: i64,
        #[arg(long)]
        chart: i64,
        #[arg(long, default_value_t = 1)]
        depth: usize,
        #[arg(long)]
        query: Option<String>,
    },
    /// Generate structural memory for a chart
    Generate {
        #[arg(long)]
        chart: i64,
        /// Regenerate unchanged nodes too
        #[arg(long)]
        force: bool,
    },
    /// Precompute strategy state for a chart, or for one node of it
    Precompute {
        #[arg(long)]
        chart: i64,
        #[arg(long, default_value = "hmem")]
        strategy: String,
        #[arg(long)]
        node: Option<i64>,
    },
    /// List strategy identifiers
    Strategies,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let output = match cli.command {
        Command::Strategies => serde_json::to_string_pretty(&StrategyId::valid_ids())?,
        Command::Context { strategy, node, chart, depth, query } => {
            let (_, engine) = open_engine(&cli.graph)?;
            let scope = ContextScope::new(node, chart).with_depth(depth);
            let result = engine.build_context(&strategy, &scope, query.as_deref()).await?;
            serde_json::to_string_pretty(&result)?
        }
        Command::Generate { chart, force } => {
            let (cfg, engine) = open_engine(&cli.graph)?;
            let options = GeneratorOptions { force, ..cfg.generator_options() };
            let report = engine.generate_structural_memory(chart, &options).await?;
            serde_json::to_string_pretty(&report)?
        }
        Command::Precompute { chart, strategy, node } => {
            let (_, engine) = open_engine(&cli.graph)?;
            let scope = node.map(|n| ContextScope::new(n, chart));
            let report = engine.precompute(chart, &strategy, scope.as_ref()).await?;
            serde_json::to_string_pretty(&report)?
        }
    };
    println!("{}", output);
    Ok(())
}

#[cfg(feature = "cli")]
fn open_engine(graph: &Path) -> anyhow::Result<(Config, ContextEngine)> {
    let cfg = Config::from_env()?;
    cfg.print_config();
    let graph = Arc::new(InMemoryGraph::from_json_file(graph)?);
    let engine = create_default_engine(&cfg, graph)?;
    Ok((cfg, engine))
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
