use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use quiesce_core::{AgentReport, Kernel, KernelConfig, NetworkImage, RunConfig, RunOutcome, StepUnit};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Driver for the quiesce production-rule engine
#[derive(Parser)]
#[command(name = "quiesce", version)]
#[command(about = "Run quiesce agents from a kernel configuration")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the configured agents and run them
    Run(RunArgs),
    /// Validate a configuration file without running anything
    Check(CheckArgs),
    /// Summarize a saved network image
    Inspect(InspectArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Kernel configuration (TOML)
    #[arg(long, short)]
    config: PathBuf,

    /// Overrides `run.step-unit`
    #[arg(long, value_enum)]
    step_unit: Option<UnitArg>,

    /// Overrides `run.count`
    #[arg(long)]
    count: Option<u64>,

    /// Overrides `run.interleave-unit`
    #[arg(long, value_enum)]
    interleave_unit: Option<UnitArg>,

    /// Bring every agent to the input phase first
    #[arg(long)]
    synchronize: bool,

    /// Where to write the per-agent report; stdout when absent
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Args)]
struct CheckArgs {
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(Args)]
struct InspectArgs {
    image: PathBuf,

    /// List rule names
    #[arg(long)]
    rules: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum UnitArg {
    Phase,
    Elaboration,
    Decision,
    Output,
    Forever,
}

impl From<UnitArg> for StepUnit {
    fn from(unit: UnitArg) -> Self {
        match unit {
            UnitArg::Phase => StepUnit::Phase,
            UnitArg::Elaboration => StepUnit::Elaboration,
            UnitArg::Decision => StepUnit::Decision,
            UnitArg::Output => StepUnit::Output,
            UnitArg::Forever => StepUnit::Forever,
        }
    }
}

#[derive(Serialize)]
struct RunSummary {
    outcome: RunOutcome,
    run: RunConfig,
    agents: Vec<AgentReport>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Check(args) => check(args),
        Commands::Inspect(args) => inspect(args),
    }
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quiesce=info,warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<KernelConfig> {
    let config = KernelConfig::load(path)
        .with_context(|| format!("loading {}", path.display()))?
        .apply_env_overrides();
    if config.agents.is_empty() {
        bail!("{} configures no agents", path.display());
    }
    Ok(config)
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let mut run = config.run;
    if let Some(unit) = args.step_unit {
        run.step_unit = unit.into();
    }
    if let Some(count) = args.count {
        run.count = count;
    }
    if let Some(unit) = args.interleave_unit {
        run.interleave_unit = unit.into();
    }
    run.synchronize |= args.synchronize;

    let mut kernel = Kernel::from_config(&config).context("building agents")?;
    info!(agents = kernel.agents().len(), step = ?run.step_unit, count = run.count, "starting run");
    let outcome = kernel.run_config(&run);
    info!(?outcome, "run finished");

    let summary = RunSummary { outcome, run, agents: kernel.reports() };
    let rendered = serde_json::to_string_pretty(&summary)?;
    match args.report {
        Some(path) => std::fs::write(&path, rendered).with_context(|| format!("writing {}", path.display()))?,
        None => println!("{rendered}"),
    }
    if kernel.any_agent_halted() {
        bail!("one or more agents halted");
    }
    Ok(())
}

fn check(args: CheckArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    for agent in &config.agents {
        agent.params().with_context(|| format!("agent '{}'", agent.name))?;
        if let Some(path) = &agent.network_image {
            let image = NetworkImage::read_from(path).with_context(|| format!("agent '{}'", agent.name))?;
            println!("{}: {} rules from {}", agent.name, image.production_count(), path.display());
        } else {
            println!("{}: no network image", agent.name);
        }
    }
    Ok(())
}

fn inspect(args: InspectArgs) -> anyhow::Result<()> {
    let image = NetworkImage::read_from(&args.image)?;
    println!("format version: {}", image.format_version);
    println!("rules: {}", image.production_count());
    println!("nodes: {}", image.node_count());
    if args.rules {
        for name in image.rule_names() {
            println!("  {name}");
        }
    }
    Ok(())
}
