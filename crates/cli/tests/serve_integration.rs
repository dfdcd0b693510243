//! Integration tests for the `cohort serve` HTTP API.
//!
//! Each test starts the server as a child process on a unique port with its
//! own SQLite file, makes HTTP requests, and verifies the responses.

use std::io::Read;
use std::net::TcpStream;
use std::path::Path;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Atomic port counter to avoid port conflicts between parallel tests.
static NEXT_PORT: AtomicU16 = AtomicU16::new(0);
static PORT_INIT: std::sync::Once = std::sync::Once::new();

fn next_port() -> u16 {
    PORT_INIT.call_once(|| {
        let base = 30000 + (std::process::id() as u16 % 20000);
        NEXT_PORT.store(base, Ordering::SeqCst);
    });
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

/// Kills the server when the test ends, pass or fail.
struct Server(Child);

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn start_server(port: u16, db: &Path) -> Server {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_cohort"));
    cmd.env("DATABASE_URL", format!("sqlite://{}", db.display()))
        .env("ADMIN_USERNAME", "admin")
        .env("ADMIN_PASSWORD", "secret")
        .env("RUST_LOG", "warn")
        .arg("serve")
        .arg("--port")
        .arg(port.to_string());
    cmd.stdout(std::process::Stdio::null());
    cmd.stderr(std::process::Stdio::null());

    let child = cmd.spawn().expect("failed to start cohort serve");
    for _ in 0..50 {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).is_ok() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Server(child)
}

/// Helper: send one HTTP/1.1 request and return (status, body).
fn http(port: u16, method: &str, path: &str, body: Option<&str>, auth: Option<&str>) -> (u16, String) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost:{}\r\nConnection: close\r\n",
        method, path, port
    );
    if let Some(credentials) = auth {
        request.push_str(&format!(
            "Authorization: Basic {}\r\n",
            BASE64.encode(credentials)
        ));
    }
    let body = body.unwrap_or("");
    if !body.is_empty() {
        request.push_str("Content-Type: application/json\r\n");
    }
    request.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    std::io::Write::write_all(&mut stream, request.as_bytes()).expect("failed to write");

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);
    parse_http_response(&response)
}

/// Split a raw HTTP response into status code and body. Handles chunked
/// bodies well enough for small JSON payloads.
fn parse_http_response(response: &str) -> (u16, String) {
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let (head, body) = response.split_once("\r\n\r\n").unwrap_or((response, ""));
    if head.to_ascii_lowercase().contains("transfer-encoding: chunked") {
        let mut out = String::new();
        let mut rest = body;
        while let Some((size, tail)) = rest.split_once("\r\n") {
            let size = usize::from_str_radix(size.trim(), 16).unwrap_or(0);
            if size == 0 || tail.len() < size {
                break;
            }
            out.push_str(&tail[..size]);
            rest = tail[size..].trim_start_matches("\r\n");
        }
        return (status, out);
    }
    (status, body.to_string())
}

#[test]
fn health_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let port = next_port();
    let _server = start_server(port, &dir.path().join("cohort.db"));

    let (status, body) = http(port, "GET", "/health", None, None);
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "ok");
}

#[test]
fn participant_flow_persists_to_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cohort.db");
    let port = next_port();
    let server = start_server(port, &db);

    let init = r#"{"worker_id":"W1","hit_id":"H1","assignment_id":"A1","platform":"prolific"}"#;
    let (status, body) = http(port, "POST", "/init", Some(init), None);
    assert_eq!(status, 200, "{body}");
    let config: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(config["status"], "started");

    let data = r#"{"worker_id":"W1","condition":"trustworthy","json_data":[{"entry_1":"x"}]}"#;
    let (status, body) = http(port, "POST", "/data", Some(data), None);
    assert_eq!(status, 200);
    assert_eq!(body.trim(), "null");

    let (status, _) = http(port, "GET", "/status", None, None);
    assert_eq!(status, 401);
    let (status, body) = http(port, "GET", "/status", None, Some("admin:secret"));
    assert_eq!(status, 200);
    let summary: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(summary, serde_json::json!([["complete", 1]]));
    drop(server);

    let out = dir.path().join("out");
    let export = Command::new(env!("CARGO_BIN_EXE_cohort"))
        .env("DATABASE_URL", format!("sqlite://{}", db.display()))
        .env("RUST_LOG", "warn")
        .arg("extract-trials")
        .arg("--out")
        .arg(&out)
        .output()
        .expect("failed to run extract-trials");
    assert!(export.status.success());
    let trials = std::fs::read_to_string(out.join("trials.csv")).unwrap();
    assert_eq!(trials, "worker_id,condition,entry_1\nW1,trustworthy,x\n");
}
