//! Binary entrypoint for the Loramesh CLI.
//!
//! Commands:
//! - `start` - run a mesh node over the UDP radio described in `[udp]`
//! - `init [--node-id <id>] [--force]` - write a starter `config.toml` with a fresh key
//! - `status` - print the configuration summary and whether it validates
//! - `simulate [--nodes <n>] [--seconds <s>]` - run a chain of in-process nodes and print their tables
//!
//! See the library crate docs for module-level details: `loramesh::`.
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use loramesh::config::Config;
use loramesh::mesh::MeshNode;
use loramesh::metrics;
use loramesh::radio::loopback::LoopbackMedium;
use loramesh::radio::udp::UdpRadio;

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "loramesh")]
#[command(about = "Self-healing multi-hop mesh node for LoRa radios")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a mesh node
    Start,
    /// Write a new configuration file with a random encryption key
    Init {
        /// Node id for the new configuration (1 is the master)
        #[arg(long)]
        node_id: Option<u8>,
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show configuration summary and validation result
    Status,
    /// Run a simulated chain of nodes in-process and print the resulting tables
    Simulate {
        /// Number of nodes in the chain (node 1 is the master)
        #[arg(short, long, default_value_t = 4)]
        nodes: u8,
        /// Seconds to let the mesh converge
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init writes the config, so there is nothing to load yet
    let pre_config = match cli.command {
        Commands::Init { .. } | Commands::Simulate { .. } => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            info!("Starting Loramesh v{}", env!("CARGO_PKG_VERSION"));
            for line in config.summary_lines() {
                info!("  {}", line);
            }

            let radio = UdpRadio::bind(&config.udp).await?;
            let node = MeshNode::start(config, Arc::new(radio)).await?;

            let mut stats = tokio::time::interval(STATS_LOG_INTERVAL);
            stats.tick().await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown requested");
                        break;
                    }
                    _ = stats.tick() => {
                        let s = node.get_statistics();
                        info!(
                            "Nodes {}/{} online, routes {}/{} active",
                            s.online_nodes, s.total_nodes, s.active_routes, s.total_routes
                        );
                    }
                }
            }
            node.shutdown().await;
        }
        Commands::Init { node_id, force } => {
            if !force && tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    cli.config
                );
            }
            let mut cfg = Config::default();
            if let Some(id) = node_id {
                cfg.node.id = id;
                cfg.node.name = format!("LoRa-Node-{}", id);
            }
            cfg.validate()?;
            let serialized = toml::to_string_pretty(&cfg)?;
            tokio::fs::write(&cli.config, serialized).await?;
            info!("Configuration file created at {}", cli.config);
            if cfg.is_master() {
                info!("Copy [encryption] key and iv to every other node before starting them");
            }
        }
        Commands::Status => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            println!("Loramesh v{} - {}", env!("CARGO_PKG_VERSION"), cli.config);
            for line in config.summary_lines() {
                println!("  {}", line);
            }
            match config.validate() {
                Ok(()) => println!("Configuration: OK"),
                Err(e) => {
                    println!("Configuration: INVALID ({})", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Simulate { nodes, seconds } => {
            simulate(nodes, seconds).await?;
        }
    }

    Ok(())
}

/// Chain `count` loopback nodes (1-2-3-...), let them beacon for `seconds`,
/// then print each node's status and the process counters as JSON.
async fn simulate(count: u8, seconds: u64) -> Result<()> {
    if !(2..=20).contains(&count) {
        bail!("--nodes must be between 2 and 20");
    }
    let mut base = Config::default();
    base.network.beacon_interval = 1;
    base.network.ping_interval = 2;
    base.network.ping_jitter_max_ms = 100;
    base.mesh.maintenance_interval = 1;
    base.mesh.healing_timeout = 5;

    let ids: Vec<u8> = (1..=count).collect();
    let medium = LoopbackMedium::new();
    medium.chain(&ids, -70);
    let radios: Vec<_> = ids.iter().map(|id| medium.attach(*id)).collect();

    let mut mesh = Vec::with_capacity(ids.len());
    for (id, radio) in ids.iter().zip(radios) {
        let mut cfg = base.clone();
        cfg.node.id = *id;
        cfg.node.name = format!("sim-{}", id);
        mesh.push(MeshNode::start(cfg, Arc::new(radio)).await?);
    }
    info!("Simulating {} nodes for {} s", count, seconds);
    tokio::time::sleep(Duration::from_secs(seconds)).await;

    if let Some(last) = mesh.last() {
        let far = last.id();
        if let Some(master) = mesh.first() {
            if !master.registry().is_reachable(far) {
                if let Err(e) = master.trigger_discovery(far).await {
                    warn!("Discovery toward {} failed: {}", far, e);
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    for node in &mesh {
        println!("{}", serde_json::to_string_pretty(&node.status())?);
    }
    println!("{}", serde_json::to_string_pretty(&metrics::snapshot())?);

    for node in mesh {
        node.shutdown().await;
    }
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(f) = file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Also echo to the console when running in a terminal
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
