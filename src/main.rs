//! RelayMQ - clustered point-to-point queue broker
//!
//! Usage:
//!   relaymq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file path
//!   -n, --node-id <ID>       Node identifier (default: hostname)
//!   -p, --peer-addr <ADDR>   Cluster listener address (enables clustering)
//!   --peer <ID=ADDR>         Static peer, may be repeated (enables clustering)
//!   -l, --log-level          Log level (error, warn, info, debug, trace)
//!   -h, --help               Print help

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use relaymq::config::{Config, StaticPeer};
use relaymq::Broker;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Parse `id=addr` into a static peer
fn parse_peer(value: &str) -> Result<StaticPeer, String> {
    let (id, addr) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ID=ADDR, got {:?}", value))?;
    let id = id.trim();
    if id.is_empty() {
        return Err("peer id must not be empty".to_string());
    }
    let addr: SocketAddr = addr
        .trim()
        .parse()
        .map_err(|e| format!("invalid peer address {:?}: {}", addr, e))?;
    Ok(StaticPeer {
        id: id.to_string(),
        addr,
    })
}

/// RelayMQ - clustered point-to-point queue broker
#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(author = "RelayMQ Contributors")]
#[command(version)]
#[command(about = "Clustered queue broker with stranded-message redistribution")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node identifier announced to peers
    #[arg(short, long)]
    node_id: Option<String>,

    /// Cluster listener address
    #[arg(short, long)]
    peer_addr: Option<SocketAddr>,

    /// Static peer as ID=ADDR (repeatable)
    #[arg(long = "peer", value_name = "ID=ADDR", value_parser = parse_peer)]
    peers: Vec<StaticPeer>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

impl Args {
    /// CLI args override file config
    fn apply(&self, config: &mut Config) {
        if let Some(ref id) = self.node_id {
            config.node.id = Some(id.clone());
        }
        if let Some(addr) = self.peer_addr {
            config.cluster.peer_addr = addr;
            config.cluster.enabled = true;
        }
        if !self.peers.is_empty() {
            config.cluster.peers.extend(self.peers.iter().cloned());
            config.cluster.enabled = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults plus env overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref path) = args.config {
        info!("Loaded configuration from {:?}", path);
    }

    info!("Starting RelayMQ node");
    info!("  Node id: {}", config.node.get_node_id());
    info!("  Declared queues: {}", config.queue.len());
    info!("  Consumer window: {}", config.queues.consumer_window);
    if config.redistribution.enabled {
        info!(
            "  Redistribution: enabled (delay={:?}, recheck={:?})",
            config.redistribution.delay, config.redistribution.recheck_interval
        );
    } else {
        info!("  Redistribution: disabled");
    }
    info!(
        "  Relay: chunk={} bytes, large threshold={} bytes, spool={:?}",
        config.relay.chunk_size, config.relay.large_message_threshold, config.relay.spool_dir
    );
    if config.cluster.enabled {
        info!(
            "  Cluster: enabled (peer={}, {} static peers)",
            config.cluster.peer_addr,
            config.cluster.peers.len()
        );
        for peer in &config.cluster.peers {
            info!("    - {} @ {}", peer.id, peer.addr);
        }
        if config.cluster.gossip_enabled() {
            info!(
                "    Gossip: {} (seeds: {})",
                config.cluster.gossip_addr,
                config.cluster.seeds.join(", ")
            );
        }
    } else {
        info!("  Cluster: disabled");
    }
    if config.metrics.enabled {
        info!("  Metrics: enabled (http://{})", config.metrics.bind);
    } else {
        info!("  Metrics: disabled");
    }

    let broker = Broker::new(config);
    broker.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    broker.shutdown().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer() {
        let peer = parse_peer("node-b=127.0.0.1:7000").unwrap();
        assert_eq!(peer.id, "node-b");
        assert_eq!(peer.addr, "127.0.0.1:7000".parse().unwrap());

        assert!(parse_peer("127.0.0.1:7000").is_err());
        assert!(parse_peer("=127.0.0.1:7000").is_err());
        assert!(parse_peer("b=not-an-addr").is_err());
    }

    #[test]
    fn test_cli_enables_cluster() {
        let args = Args::parse_from([
            "relaymq",
            "--node-id",
            "a",
            "--peer",
            "b=127.0.0.1:7001",
            "--peer",
            "c=127.0.0.1:7002",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.node.id.as_deref(), Some("a"));
        assert!(config.cluster.enabled);
        assert_eq!(config.cluster.peers.len(), 2);
    }
}
