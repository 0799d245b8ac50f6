//! NetherNet Discovery Server
//!
//! A UDP discovery responder that:
//! - Answers discovery requests with a fixed advertisement
//! - Refuses session requests (no peer-connection engine in this binary)
//! - Logs counters in Prometheus text format on shutdown
//!
//! Usage: `discovery-server [port] [advertisement]` or
//! `discovery-server --config <path.json> [--advertisement <text>]`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nethernet::{NoTransport, Server, ServerConfig, DEFAULT_PORT};

mod metrics;

use metrics::Metrics;

// ============================================================================
// Constants
// ============================================================================

/// Advertisement used when none is given
const DEFAULT_ADVERTISEMENT: &str = "NetherNet discovery server";

/// Upper bound on one poll wait, so shutdown signals are noticed promptly
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let (config, advertisement) = parse_config(&args)?;

    // SIGINT/SIGTERM request a graceful close
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let mut server = Server::new(config, Box::new(NoTransport))?;
    server.set_advertisement(advertisement.into_bytes());
    let addr = server.listen()?;

    log::info!("Discovery server {} starting...", server.network_id());
    // Readiness line for supervisors and tests
    println!("listening on {}", addr);

    let metrics = Metrics::new();

    while !shutdown.load(Ordering::Relaxed) {
        for event in server.poll(Some(POLL_TIMEOUT))? {
            log::debug!("{:?}", event);
            metrics.record(&event);
        }
        if let Some(stats) = server.stats() {
            metrics.update_discovery(&stats);
        }
    }

    log::info!("Shutting down...");
    server.close("shutdown");
    for event in server.poll(None)? {
        metrics.record(&event);
    }

    log::info!("Final metrics:\n{}", metrics.render());
    Ok(())
}

/// Resolve configuration from `--config`, then positional arguments
fn parse_config(args: &[String]) -> Result<(ServerConfig, String), Box<dyn std::error::Error>> {
    if let Some(path) = parse_arg(args, "--config") {
        let config = ServerConfig::from_file(&path)?;
        let advertisement = parse_arg(args, "--advertisement")
            .unwrap_or_else(|| DEFAULT_ADVERTISEMENT.to_string());
        return Ok((config, advertisement));
    }

    let port = match args.get(1) {
        Some(p) => p.parse().map_err(|_| format!("Invalid port {:?}", p))?,
        None => DEFAULT_PORT,
    };
    let advertisement = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| DEFAULT_ADVERTISEMENT.to_string());

    let config = ServerConfig {
        port,
        ..ServerConfig::default()
    };
    config.validate()?;
    Ok((config, advertisement))
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_positional_arguments() {
        let (config, advertisement) =
            parse_config(&args(&["discovery-server", "19132", "My World"])).unwrap();
        assert_eq!(config.port, 19132);
        assert_eq!(advertisement, "My World");
    }

    #[test]
    fn test_defaults() {
        let (config, advertisement) = parse_config(&args(&["discovery-server"])).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(advertisement, DEFAULT_ADVERTISEMENT);
    }

    #[test]
    fn test_invalid_port() {
        assert!(parse_config(&args(&["discovery-server", "seventy"])).is_err());
        assert!(parse_config(&args(&["discovery-server", "0"])).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        assert!(parse_config(&args(&["discovery-server", "--config", "/nonexistent.json"])).is_err());
    }
}
