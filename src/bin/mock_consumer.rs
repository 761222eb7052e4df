//! Mock consumer binary for integration testing
//!
//! Stands in for the discovery consumer: reads `--config.file=<path>`,
//! listens on the configured address and serves a fixed targets response
//! once its warmup period is over.
//!
//! Config file (JSON):
//! `{"listen": "127.0.0.1:9090", "response": {...}, "ready_after_ms": 300,
//!   "warmup_body": "not json", "exit_code": 1}`

use serde::Deserialize;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

const TARGETS_PATH: &str = "/api/v1/targets";

#[derive(Deserialize)]
struct MockConfig {
    listen: String,
    #[serde(default)]
    response: Value,
    /// Serve warmup replies for this long after startup
    #[serde(default)]
    ready_after_ms: u64,
    /// Body served with 200 during warmup; 503 when absent
    warmup_body: Option<String>,
    /// Exit immediately with this code instead of serving
    exit_code: Option<i32>,
}

fn main() {
    let config_path = config_path_from_args().unwrap_or_else(|| {
        eprintln!("mock_consumer: missing --config.file");
        std::process::exit(2);
    });

    let content = std::fs::read_to_string(&config_path).unwrap_or_else(|e| {
        eprintln!("mock_consumer: cannot read {}: {}", config_path, e);
        std::process::exit(2);
    });
    let config: MockConfig = serde_json::from_str(&content).unwrap_or_else(|e| {
        eprintln!("mock_consumer: invalid config: {}", e);
        std::process::exit(2);
    });

    if let Some(code) = config.exit_code {
        std::process::exit(code);
    }

    let listener = TcpListener::bind(&config.listen).unwrap_or_else(|e| {
        eprintln!("mock_consumer: cannot listen on {}: {}", config.listen, e);
        std::process::exit(1);
    });

    let started = Instant::now();
    let ready_after = Duration::from_millis(config.ready_after_ms);
    let body = serde_json::to_string(&config.response).unwrap();

    for stream in listener.incoming() {
        let Ok(stream) = stream else { continue };
        let ready = started.elapsed() >= ready_after;
        handle(stream, &config, &body, ready);
    }
}

fn config_path_from_args() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some(path) = arg.strip_prefix("--config.file=") {
            return Some(path.to_string());
        }
        if arg == "--config.file" {
            return args.next();
        }
    }
    None
}

fn handle(mut stream: TcpStream, config: &MockConfig, body: &str, ready: bool) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let Some(path) = read_request_path(&mut stream) else {
        return;
    };

    let (status, body) = if path != TARGETS_PATH {
        ("404 Not Found", "404 page not found")
    } else if ready {
        ("200 OK", body)
    } else {
        match &config.warmup_body {
            Some(warmup) => ("200 OK", warmup.as_str()),
            None => ("503 Service Unavailable", "Service Unavailable"),
        }
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}

/// Read the request head and return the path from its request line
fn read_request_path(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).ok()?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }

    let head = String::from_utf8_lossy(&head);
    let request_line = head.lines().next()?;
    let target = request_line.split_whitespace().nth(1)?;
    Some(target.split('?').next().unwrap_or(target).to_string())
}
