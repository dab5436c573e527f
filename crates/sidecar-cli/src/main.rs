//! sidecar CLI - intercepting HTTP proxy
//!
//! Loads the proxy configuration and serves until interrupted.

mod cli;
mod config;

use clap::Parser;
use cli::{CheckArgs, Cli, Commands, RunArgs};
use sidecar_proxy::{ProxyError, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over -v.
    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Run(args) => run_proxy(&args),
        Commands::Check(args) => run_check(&args),
    };
    if let Err(e) = result {
        error!("{}", e);
        eprintln!("sidecar: {}", e);
        std::process::exit(1);
    }
}

/// Start the proxy and block until Ctrl-C.
fn run_proxy(args: &RunArgs) -> Result<()> {
    let config = config::resolve(args)?;

    // Single-threaded: spawned connection tasks are driven only while
    // block_on runs, so the whole serve loop stays inside it.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| ProxyError::Config(format!("Failed to start proxy runtime: {}", e)))?;

    rt.block_on(async {
        let handle = sidecar_proxy::start(config).await?;
        info!("Proxy ready at {}", handle.proxy_url());

        tokio::signal::ctrl_c().await?;
        let counters = handle.counters();
        info!(
            "Shutting down: {} request(s), {} relayed, {} upgraded, {} halted, {} failed",
            counters.requests,
            counters.relayed,
            counters.upgraded,
            counters.halted,
            counters.failed
        );
        handle.shutdown();
        Ok::<(), ProxyError>(())
    })
}

/// Parse a configuration file and report what it configures.
fn run_check(args: &CheckArgs) -> Result<()> {
    let config = config::load(&args.config)?;
    // Building the tables validates patterns and targets.
    let targets = sidecar_proxy::DestinationOverrides::from_config(&config.targets)?;
    println!("{}: ok", args.config.display());
    println!("  listen:        {}:{}", config.bind_addr, config.bind_port);
    println!("  intercepts:    {}", config.intercepts.len());
    println!("  dns overrides: {}", config.dns.map.len());
    println!("  destinations:  {}", targets.len());
    println!(
        "  auto-heal:     {}",
        if config.auto_heal.enabled { "on" } else { "off" }
    );
    Ok(())
}
