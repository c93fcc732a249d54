//! Armada - reconcile a declared cluster against live state
//!
//! This is the main CLI entry point for Armada.

use armada::cluster::{ClusterContext, DeployOptions, DEFAULT_STEP_PERCENT};
use armada::container::{filter, EngineConnector, FilterChain};
use armada::error::Result;
use armada::machine::docker_machine::DEFAULT_MACHINE_BIN;
use armada::machine::{DockerMachine, MachineProvisioner};
use armada::topology::parser::{DEFAULT_PROFILE_FILE, DEFAULT_TOPOLOGY_FILE};
use armada::topology::{ClusterTopology, TopologyParser};
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Armada - cluster deployment from a topology file
#[derive(Parser)]
#[command(name = "armada")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Reconcile a declared cluster of machines and containers", long_about = None)]
struct Cli {
    /// Topology file
    #[arg(short = 'f', long = "file", global = true, default_value = DEFAULT_TOPOLOGY_FILE)]
    file: PathBuf,

    /// Profile file, `profile.yml` next to the topology file by default
    #[arg(long, global = true)]
    profile_file: Option<PathBuf>,

    /// Profile to apply, the file's active profile by default
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the cluster to the declared state
    Deploy {
        /// Destroy machines above a group's max_num
        #[arg(long = "m-scale-in")]
        machine_scale_in: bool,
        /// Start or create machines up to a group's min_num
        #[arg(long = "m-scale-out")]
        machine_scale_out: bool,
        /// Stop containers above a group's num
        #[arg(long = "c-scale-in")]
        container_scale_in: bool,
        /// Run containers up to a group's num
        #[arg(long = "c-scale-out")]
        container_scale_out: bool,
        /// Remove stopped containers after deploying a group
        #[arg(long = "c-rm", action = ArgAction::Set, default_value_t = true)]
        remove_stopped: bool,
        /// Share of running containers cycled at once
        #[arg(long = "c-step-percent", default_value_t = DEFAULT_STEP_PERCENT,
              value_parser = clap::value_parser!(u32).range(1..=100))]
        step_percent: u32,
        /// Container filter, key=value (group, ip, machine, percent)
        #[arg(long = "c-filter")]
        filters: Vec<String>,
        /// Continue when a machine group stays below its minimum
        #[arg(long)]
        allow_degraded: bool,
        /// docker-machine binary
        #[arg(long, default_value = DEFAULT_MACHINE_BIN)]
        machine_bin: String,
    },

    /// Print the deploy order of the container groups
    Plan {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --debug
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let topology = load_topology(&cli.file, cli.profile_file.as_deref(), cli.profile.as_deref())?;

    match cli.command {
        Commands::Deploy {
            machine_scale_in,
            machine_scale_out,
            container_scale_in,
            container_scale_out,
            remove_stopped,
            step_percent,
            filters,
            allow_degraded,
            machine_bin,
        } => {
            // Reject bad filters before anything is contacted
            FilterChain::from_args(&filters)?;
            let options = DeployOptions {
                machine_scale_in,
                machine_scale_out,
                container_scale_in,
                container_scale_out,
                remove_stopped,
                step_percent,
                filters: filter::parse_pairs(&filters)?,
                allow_degraded,
            };
            tracing::debug!("Deploy options: {:?}", options);

            let provisioner: Arc<dyn MachineProvisioner> = Arc::new(DockerMachine::new(&machine_bin));
            let connector = Arc::new(EngineConnector::new(provisioner.clone()));
            let mut context = ClusterContext::new(topology, options, provisioner, connector)?;

            if let Err(e) = context.deploy().await {
                tracing::error!("Deploy of {} failed", cli.file.display());
                return Err(e);
            }
            println!("Cluster deployed");
        }

        Commands::Plan { json } => {
            let plan = armada::cluster::DeployPlan::build(&topology)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print!("{}", plan);
            }
        }
    }

    Ok(())
}

fn load_topology(file: &Path, profile_file: Option<&Path>, profile: Option<&str>) -> Result<ClusterTopology> {
    let default_profile_file;
    let profile_file = match profile_file {
        Some(p) => p,
        None => {
            default_profile_file = file
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(DEFAULT_PROFILE_FILE);
            default_profile_file.as_path()
        }
    };
    tracing::info!("Loading topology from {}", file.display());
    TopologyParser::parse_file(file, Some(profile_file), profile)
}
