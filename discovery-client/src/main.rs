//! NetherNet Discovery Client
//!
//! Broadcasts discovery requests and prints each server that answers, once.
//!
//! Usage: `discovery-client [--target <addr:port>] [--count <n>] [--timeout <secs>]`
//!
//! Stops after `count` distinct servers answered, after `timeout` seconds, or
//! on SIGINT.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nethernet::{Client, ClientConfig, ClientEvent, NoTransport, DEFAULT_PORT};

// ============================================================================
// Constants
// ============================================================================

/// Default probe duration in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 5;

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

    let args: Vec<String> = std::env::args().collect();
    let options = Options::parse(&args)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))?;

    let config = ClientConfig {
        target: options.target,
        ..ClientConfig::default()
    };
    // Discovery only: no session is started, so the server id is unused
    let mut client = Client::new(0, config, Box::new(NoTransport))?;

    log::info!(
        "Probing {} for {}s (client {})",
        options.target,
        options.timeout.as_secs(),
        client.network_id()
    );

    let deadline = Instant::now() + options.timeout;
    let mut seen = HashSet::new();

    while Instant::now() < deadline && !interrupted.load(Ordering::Relaxed) {
        for event in client.poll(Some(POLL_TIMEOUT))? {
            if let ClientEvent::Pong(response) = event {
                if seen.insert(response.sender_id) {
                    println!(
                        "{} {} {}",
                        response.sender_id,
                        response.address,
                        String::from_utf8_lossy(&response.data)
                    );
                }
            }
        }
        if options.count.map_or(false, |n| seen.len() >= n) {
            break;
        }
    }

    client.close("probe finished");
    log::info!("{} server(s) found", seen.len());
    Ok(())
}

// ============================================================================
// Arguments
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
struct Options {
    target: SocketAddr,
    count: Option<usize>,
    timeout: Duration,
}

impl Options {
    fn parse(args: &[String]) -> Result<Self, String> {
        let target = parse_arg(args, "--target")
            .unwrap_or_else(|| format!("255.255.255.255:{}", DEFAULT_PORT));
        let target: SocketAddr = target
            .parse()
            .map_err(|_| format!("Invalid target address {:?}", target))?;

        let count = match parse_arg(args, "--count") {
            Some(c) => Some(c.parse().map_err(|_| format!("Invalid count {:?}", c))?),
            None => None,
        };

        let timeout = match parse_arg(args, "--timeout") {
            Some(t) => t.parse().map_err(|_| format!("Invalid timeout {:?}", t))?,
            None => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Self {
            target,
            count,
            timeout: Duration::from_secs(timeout),
        })
    }
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
    fn test_default_options() {
        let options = Options::parse(&args(&["discovery-client"])).unwrap();
        assert_eq!(options.target.to_string(), "255.255.255.255:7551");
        assert_eq!(options.count, None);
        assert_eq!(options.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[test]
    fn test_all_options() {
        let options = Options::parse(&args(&[
            "discovery-client",
            "--target",
            "192.168.1.20:7551",
            "--count",
            "3",
            "--timeout",
            "12",
        ]))
        .unwrap();
        assert_eq!(options.target.to_string(), "192.168.1.20:7551");
        assert_eq!(options.count, Some(3));
        assert_eq!(options.timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_invalid_options() {
        assert!(Options::parse(&args(&["discovery-client", "--target", "nowhere"])).is_err());
        assert!(Options::parse(&args(&["discovery-client", "--count", "-1"])).is_err());
        assert!(Options::parse(&args(&["discovery-client", "--timeout", "soon"])).is_err());
    }
}
