use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::Context;
use clap::Parser;
use drone_core::Config;
use drone_core::DroneAgent;
use drone_core::InProcFabric;
use drone_core::ResourceOffloadProblem;
use tracing_subscriber::EnvFilter;

/// Launches one DRONE agent and exits with the achieved node utility.
#[derive(Debug, Parser)]
#[command(name = "drone", about = "Decentralized placement agent for edge clusters")]
struct Cli {
    /// Name of the agent.
    node_name: String,

    /// The logging level.
    #[arg(short = 'l', long, default_value = "INFO")]
    log_level: String,

    /// Keep running after the first agreement is reached.
    #[arg(short = 'p', long)]
    persistent_daemon: bool,

    /// Log to `<node>.log` instead of stdout.
    #[arg(short = 'o', long)]
    log_on_file: bool,

    /// The log file name. If not given, log is redirected to stdout.
    #[arg(short = 'f', long)]
    log_file: Option<PathBuf>,

    /// Configuration file.
    #[arg(short = 'd', long, default_value = "config/default-config.toml")]
    conf_file: PathBuf,

    /// Reserved: centralized scheduling mode.
    #[arg(short = 'c', long)]
    centralized: bool,
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let directive = match cli.log_level.to_uppercase().as_str() {
        "DEBUG" => "debug",
        "VERBOSE" => "trace",
        "INFO" | "IMPORTANT" => "info",
        "WARNING" | "WARN" => "warn",
        _ => "error",
    };
    let log_file = cli.log_file.clone().or_else(|| {
        cli.log_on_file
            .then(|| PathBuf::from(format!("{}.log", cli.node_name)))
    });
    match log_file {
        Some(path) => {
            let file = std::fs::File::create(&path)
                .with_context(|| format!("cannot create log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(directive))
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(directive))
                .init();
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli)?;
    if cli.centralized {
        tracing::warn!("centralized mode is declared but not implemented; ignoring");
    }

    let config = Config::load(&cli.conf_file)?;
    let raw = std::fs::read_to_string(&config.problem.instance).with_context(|| {
        format!("cannot read problem instance {}", config.problem.instance)
    })?;
    let problem = ResourceOffloadProblem::parse_instance(&raw)?;
    tracing::info!(
        nodes = problem.nodes.len(),
        apps = problem.apps.len(),
        "problem instance loaded"
    );

    let results_folder = PathBuf::from(&config.logging.results_folder);
    let fabric = InProcFabric::new();
    let agent = DroneAgent::new(
        &cli.node_name,
        problem,
        config,
        fabric,
        cli.persistent_daemon,
    )?;
    let outcome = agent.run()?;

    let results = serde_json::json!({
        "offloading-bundle": outcome
            .offload_bundle
            .iter()
            .map(|entry| [&entry.app, &entry.component, &entry.function])
            .collect::<Vec<_>>(),
        "rates": outcome
            .rates
            .iter()
            .map(|(window, count)| serde_json::json!([window, count]))
            .collect::<Vec<_>>(),
        "utility": outcome.utility,
    });
    std::fs::create_dir_all(&results_folder).with_context(|| {
        format!("cannot create results folder {}", results_folder.display())
    })?;
    let results_path = results_folder.join(format!("results_{}.json", cli.node_name));
    std::fs::write(&results_path, serde_json::to_string_pretty(&results)?)?;
    tracing::info!(path = %results_path.display(), "results persisted");

    Ok(ExitCode::from((outcome.utility % 256) as u8))
}
