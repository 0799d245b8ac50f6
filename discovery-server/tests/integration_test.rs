//! Runs the built discovery-server binary and pings it with the library client

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nethernet::{Client, ClientConfig, ClientEvent, NoTransport};

const PORT: u16 = 17650;

struct ServerProcess(Child);

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

/// Start the server and wait for its readiness line; None if it cannot start
fn spawn_server(advertisement: &str) -> Option<ServerProcess> {
    let mut child = Command::new(env!("CARGO_BIN_EXE_discovery-server"))
        .arg(PORT.to_string())
        .arg(advertisement)
        .env("RUST_LOG", "warn")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    let stdout = child.stdout.take()?;
    let process = ServerProcess(child);

    let mut line = String::new();
    BufReader::new(stdout).read_line(&mut line).ok()?;
    if !line.starts_with("listening on") {
        return None;
    }
    Some(process)
}

#[test]
fn test_binary_answers_ping() {
    let _ = env_logger::builder().is_test(true).try_init();

    let _server = match spawn_server("integration advert") {
        Some(s) => s,
        None => {
            eprintln!("Skipping: discovery-server could not start");
            return;
        }
    };

    let config = ClientConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        target: format!("127.0.0.1:{}", PORT).parse().unwrap(),
        discovery_interval_ms: 200,
        ..ClientConfig::default()
    };
    // The server's NetworkId is random; 0 never matches, which is fine for pings
    let mut client = Client::new(0, config, Box::new(NoTransport)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut advertisement = None;
    while advertisement.is_none() && Instant::now() < deadline {
        for event in client.poll(Some(Duration::from_millis(20))).unwrap() {
            if let ClientEvent::Pong(response) = event {
                advertisement = Some(response.data);
            }
        }
    }

    assert_eq!(advertisement, Some(b"integration advert".to_vec()));
}
