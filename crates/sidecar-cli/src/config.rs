//! Configuration loading for the sidecar CLI
//!
//! The proxy configuration is read from a JSON file; command-line flags
//! take precedence over the file.

use crate::cli::RunArgs;
use sidecar_proxy::{ProxyConfig, ProxyError, Result};
use std::path::Path;

/// Read a proxy configuration from `path`.
pub fn load(path: &Path) -> Result<ProxyConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&raw)
        .map_err(|e| ProxyError::Config(format!("failed to parse {}: {}", path.display(), e)))
}

/// Configuration for `run`: the file (or defaults) with flag overrides.
pub fn resolve(args: &RunArgs) -> Result<ProxyConfig> {
    let mut config = match &args.config {
        Some(path) => load(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if args.no_auto_heal {
        config.auto_heal.enabled = false;
    }
    Ok(config)
}
