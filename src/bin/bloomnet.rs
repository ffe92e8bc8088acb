use anyhow::{Context, Result};
use bloomnet::{
    CancellationToken, ClusterStatus, ClusterStatusRequest, ControlPlane, ControlPlaneConfig,
    DeregisterNodeRequest, FormClusterRequest, RegisterNodeRequest,
};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;
use serde::Serialize;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

const DEFAULT_LOG_FILTER: &str = "info,bloomnet=info";
const REFRESH_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "bloomnet", about = "Storage node registry and replication control plane")]
struct Cli {
    /// Path to the control plane configuration YAML (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// env_logger-style filter string (e.g. "info,bloomnet=debug"); overrides RUST_LOG/defaults
    #[arg(long)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a node and probe it once
    Register {
        name: String,
        address: String,
        #[arg(long, default_value_t = 9000)]
        port: u16,
    },
    /// Retire a node
    Deregister { name: String },
    /// Probe one node, or every node when no name is given
    Probe { name: Option<String> },
    /// List nodes; `--active` limits the listing to HEALTHY and PENDING nodes
    Nodes {
        #[arg(long)]
        active: bool,
    },
    /// Form a replication cluster from comma-separated aliases
    FormCluster { name: String, aliases: String },
    /// Show one cluster, optionally reconciling it against member health first
    Cluster {
        name: String,
        #[arg(long)]
        reconcile: bool,
    },
    /// List clusters
    Clusters,
    /// Re-publish every target file now
    Refresh,
    /// Probe on the configured interval until stdin closes
    Watch,
}

fn init_logging(cli_filter: Option<&str>) {
    let env = Env::default().default_filter_or(DEFAULT_LOG_FILTER);
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(filter) = cli_filter {
        builder.parse_filters(filter);
    }
    builder.format_timestamp_secs();
    builder.format(|buf, record| {
        let ts = buf.timestamp();
        writeln!(
            buf,
            "[{} {:<5} {}] {}",
            ts,
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder.init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{rendered}");
    Ok(())
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => ControlPlaneConfig::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => ControlPlaneConfig::default(),
    };
    let mut plane = ControlPlane::from_config(&config).context("start control plane")?;
    let mut code = ExitCode::SUCCESS;

    match cli.command {
        Command::Register {
            name,
            address,
            port,
        } => {
            let node = plane.register_node(&RegisterNodeRequest::new(name, address, port))?;
            print_json(&node)?;
        }
        Command::Deregister { name } => {
            let ack = plane.deregister_node(&DeregisterNodeRequest::new(name))?;
            print_json(&ack)?;
        }
        Command::Probe { name: Some(name) } => print_json(&plane.probe_node(&name)?)?,
        Command::Probe { name: None } => print_json(&plane.probe_all()?)?,
        Command::Nodes { active: true } => print_json(&plane.list_active()?)?,
        Command::Nodes { active: false } => print_json(&plane.list_nodes()?)?,
        Command::FormCluster { name, aliases } => {
            let request = FormClusterRequest::from_joined(name, &aliases);
            let cluster = plane.form_cluster(&request, &CancellationToken::new())?;
            if cluster.status == ClusterStatus::Failed {
                code = ExitCode::from(2);
            }
            print_json(&cluster)?;
        }
        Command::Cluster { name, reconcile } => {
            let cluster = if reconcile {
                plane.reconcile_cluster(&name)?
            } else {
                plane.get_cluster_status(&ClusterStatusRequest::new(name))?
            };
            print_json(&cluster)?;
        }
        Command::Clusters => print_json(&plane.list_clusters()?)?,
        Command::Refresh => print_json(&plane.refresh_now()?)?,
        Command::Watch => {
            let mut scheduler = plane
                .spawn_probe_scheduler(config.probe.interval())
                .context("start probe scheduler")?;
            info!(
                "event=watch_started interval_ms={}",
                config.probe.interval_ms
            );
            let mut sink = Vec::new();
            io::stdin()
                .read_to_end(&mut sink)
                .context("read stdin")?;
            scheduler.shutdown();
            print_json(&plane.metrics().snapshot())?;
        }
    }

    if !plane.wait_for_refresh(REFRESH_SETTLE_TIMEOUT) {
        log::warn!(
            "event=refresh_not_settled last_error={}",
            plane.refresh_signal().last_error().unwrap_or_default()
        );
    }
    plane.shutdown();
    Ok(code)
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_filter.as_deref());
    run(cli)
}
