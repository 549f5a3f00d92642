// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ipcbus broker CLI
//!
//! Standalone broker process: accepts peer connections over TCP or a Unix
//! socket and routes channel traffic between them, optionally bridged to an
//! upstream broker.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default TCP port
//! ipcbus-broker
//!
//! # Unix socket, traffic logging with arguments
//! ipcbus-broker --path /tmp/ipcbus.sock --traffic args
//!
//! # Bridge to an upstream broker on port 9000
//! ipcbus-broker --port 9100 --bridge-port 9000
//!
//! # Accept bridge links from downstream brokers
//! ipcbus-broker --port 9000 --bridge-server
//!
//! # Using a configuration file
//! ipcbus-broker --config broker.toml
//! ```

use clap::{Parser, Subcommand};
use ipcbus::config::DEFAULT_PORT;
use ipcbus::{Broker, BrokerConfig, BrokerStats, ConfigError, ConnectOptions, LogLevel};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// ipcbus message broker
#[derive(Parser, Debug)]
#[command(name = "ipcbus-broker")]
#[command(about = "ipcbus broker - channel routing between processes")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP port to listen on
    #[arg(short, long, conflicts_with_all = ["config", "path"])]
    port: Option<u16>,

    /// Listen host
    #[arg(long, default_value = "127.0.0.1", conflicts_with = "config")]
    host: String,

    /// Unix socket path to listen on
    #[arg(long, conflicts_with = "config")]
    path: Option<PathBuf>,

    /// Broker name reported in query-state replies
    #[arg(short, long, conflicts_with = "config")]
    name: Option<String>,

    /// Upstream broker port to bridge to
    #[arg(long, conflicts_with_all = ["config", "bridge_server"])]
    bridge_port: Option<u16>,

    /// Upstream broker host
    #[arg(long, default_value = "127.0.0.1", conflicts_with = "config")]
    bridge_host: String,

    /// Accept bridge links from downstream brokers
    #[arg(long, conflicts_with = "config")]
    bridge_server: bool,

    /// Traffic log level announced to peers (off, traffic, args)
    #[arg(long, value_parser = parse_traffic, conflicts_with = "config")]
    traffic: Option<LogLevel>,

    /// Statistics reporting interval (seconds, 0 to disable)
    #[arg(long, default_value = "0")]
    stats_interval: u64,

    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "broker.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn parse_traffic(s: &str) -> Result<LogLevel, String> {
    LogLevel::parse(s).ok_or_else(|| format!("unknown traffic level '{}'", s))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = build_config(&args)?;

    info!("+----------------------------------------------------+");
    info!(
        "|       ipcbus broker v{}                         |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Name:    {:40} |", config.name);
    info!("|  Listen:  {:40} |", config.listen.describe());
    info!(
        "|  Bridge:  {:40} |",
        match &config.bridge {
            Some(b) if b.server => "accepting".to_string(),
            Some(b) => b.describe(),
            None => "disabled".to_string(),
        }
    );
    info!("|  Traffic: {:40} |", config.log_level);
    info!("+----------------------------------------------------+");

    let handle = Broker::new(config)?.start().await?;

    let stats_interval = args.stats_interval;
    if stats_interval > 0 {
        let stats_handle = handle.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(stats_interval));
            loop {
                interval.tick().await;
                if !stats_handle.is_running() {
                    break;
                }
                if let Ok(stats) = stats_handle.stats().await {
                    print_stats(&stats);
                }
            }
        });
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received, stopping broker...");
        }
        _ = handle.closed() => {}
    }

    if let Ok(stats) = handle.stats().await {
        print_stats(&stats);
    }
    handle.shutdown();
    handle.closed().await;

    info!("Broker stopped");
    Ok(())
}

fn build_config(args: &Args) -> Result<BrokerConfig, ConfigError> {
    if let Some(ref config_path) = args.config {
        return BrokerConfig::from_file(config_path);
    }

    let listen = match &args.path {
        Some(path) => ConnectOptions::unix(path),
        None => ConnectOptions::tcp(args.port.unwrap_or(DEFAULT_PORT)).with_host(&args.host),
    };
    let mut config = BrokerConfig::listening(listen);

    if let Some(name) = &args.name {
        config.name = name.clone();
    }
    if let Some(level) = args.traffic {
        config.log_level = level;
    }
    if args.bridge_server {
        config.bridge = Some(ConnectOptions::default().as_server());
    } else if let Some(port) = args.bridge_port {
        config.bridge = Some(ConnectOptions::tcp(port).with_host(&args.bridge_host));
    }

    config.validate()?;
    Ok(config)
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = BrokerConfig::listening(ConnectOptions::tcp(DEFAULT_PORT))
        .with_bridge(ConnectOptions::tcp(DEFAULT_PORT + 1).with_timeout_delay(2000))
        .with_log_level(LogLevel::Traffic);
    config.name = "example-broker".into();

    let content = format!(
        r#"# ipcbus Broker Configuration
# Generated by ipcbus-broker gen-config

{}
"#,
        config.to_toml()?
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match BrokerConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Broker:    {}", config.name);
            println!("Listen:    {}", config.listen.describe());
            match &config.bridge {
                Some(b) if b.server => println!("Bridge:    accepting"),
                Some(b) => println!("Bridge:    {}", b.describe()),
                None => println!("Bridge:    disabled"),
            }
            println!("Max peers: {}", config.max_peers);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_stats(stats: &BrokerStats) {
    println!("--- Broker Statistics ---");
    println!(
        "  {} msgs, {} routed, {} dropped",
        stats.messages_routed,
        format_bytes(stats.bytes_routed),
        stats.messages_dropped
    );
    println!(
        "  {} connections, {} peers, {} channels{}",
        stats.connections,
        stats.peers,
        stats.channels,
        if stats.bridged { ", bridged" } else { "" }
    );
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_tcp_listener() {
        let args = Args::parse_from(["ipcbus-broker"]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.listen.port, Some(DEFAULT_PORT));
        assert!(config.bridge.is_none());
        assert_eq!(config.log_level, LogLevel::Off);
    }

    #[test]
    fn test_cli_bridge_and_traffic_flags() {
        let args = Args::parse_from([
            "ipcbus-broker",
            "--port",
            "9100",
            "--bridge-port",
            "9000",
            "--traffic",
            "args",
            "--name",
            "edge",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.name, "edge");
        assert_eq!(config.log_level, LogLevel::Args);
        let bridge = config.bridge.unwrap();
        assert_eq!(bridge.port, Some(9000));
        assert!(!bridge.server);
    }

    #[test]
    fn test_cli_rejects_bridge_to_self() {
        let args = Args::parse_from(["ipcbus-broker", "--port", "9000", "--bridge-port", "9000"]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_gen_config_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.toml");
        cmd_gen_config(path.clone()).unwrap();

        let config = BrokerConfig::from_file(&path).unwrap();
        assert_eq!(config.name, "example-broker");
        assert_eq!(config.log_level, LogLevel::Traffic);
        assert!(config.bridge.is_some());
    }
}
