//! CLI argument definitions for sidecar
//!
//! Uses clap for argument parsing.

use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

/// sidecar - intercepting HTTP proxy
///
/// Rewrites requests per domain rules, applies DNS and destination
/// overrides, and tunnels CONNECT and upgraded connections.
#[derive(Parser, Debug)]
#[command(name = "sidecar")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v debug, -vv trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the proxy and serve until interrupted
    #[command(after_help = "EXAMPLES:
    # Listen on an ephemeral port with built-in defaults
    sidecar run

    # Load rules and overrides from a file, listen on 1181
    sidecar run --config sidecar.json --port 1181
")]
    Run(RunArgs),

    /// Validate a configuration file and print a summary
    Check(CheckArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Configuration file path (JSON)
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Listen port, overrides the configuration file
    #[arg(long, short = 'p', value_name = "PORT")]
    pub port: Option<u16>,

    /// Listen address, overrides the configuration file
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<IpAddr>,

    /// Never downgrade certificate verification after failures
    #[arg(long)]
    pub no_auto_heal: bool,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Configuration file path (JSON)
    #[arg(value_name = "FILE")]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flags() {
        let cli = Cli::parse_from([
            "sidecar", "-vv", "run", "--config", "a.json", "--port", "1181", "--bind", "0.0.0.0",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, Some(PathBuf::from("a.json")));
                assert_eq!(args.port, Some(1181));
                assert_eq!(args.bind, "0.0.0.0".parse::<IpAddr>().ok());
                assert!(!args.no_auto_heal);
            }
            Commands::Check(_) => panic!("expected run"),
        }
    }

    #[test]
    fn test_check_requires_file() {
        assert!(Cli::try_parse_from(["sidecar", "check"]).is_err());
        assert!(Cli::try_parse_from(["sidecar", "check", "x.json"]).is_ok());
    }
}
