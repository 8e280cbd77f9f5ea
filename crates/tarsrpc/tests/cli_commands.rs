#![cfg(feature = "cli")]

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Output, Stdio};

struct DemoServer {
    child: Child,
    object: String,
}

impl DemoServer {
    fn start() -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_tarsrpc"))
            .args(["--log-level", "error", "--format", "json", "serve", "127.0.0.1:0"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("serve command should start");

        let stdout = child.stdout.take().expect("stdout should be piped");
        let mut line = String::new();
        BufReader::new(stdout)
            .read_line(&mut line)
            .expect("serve should announce its endpoint");
        let event: serde_json::Value =
            serde_json::from_str(&line).expect("listening event should be JSON");
        assert_eq!(event["event"], "listening");
        let object = event["object"]
            .as_str()
            .expect("listening event should carry the object name")
            .to_string();
        Self { child, object }
    }
}

impl Drop for DemoServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn tarsrpc(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tarsrpc"))
        .args(["--log-level", "error", "--format", "json"])
        .args(args)
        .output()
        .expect("tarsrpc should run")
}

fn json_stdout(output: &Output) -> serde_json::Value {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

#[test]
fn call_echo_in_every_protocol_version() {
    let server = DemoServer::start();
    for proto in ["1", "2", "3"] {
        let out = json_stdout(&tarsrpc(&[
            "call",
            &server.object,
            "echo",
            "hello",
            "--proto",
            proto,
        ]));
        assert_eq!(out["ret"], "hello", "proto {proto}");
        assert_eq!(out["servant"], "Demo.EchoServer.EchoObj");
        assert_eq!(out["version"].as_i64(), proto.parse::<i64>().ok());
    }
}

#[test]
fn call_add_returns_out_parameter() {
    let server = DemoServer::start();
    let out = json_stdout(&tarsrpc(&["call", &server.object, "add", "40", "2"]));
    assert_eq!(out["ret"], 0);
    assert_eq!(out["outputs"]["sum"], 42);
}

#[test]
fn ping_reports_pong() {
    let server = DemoServer::start();
    let out = json_stdout(&tarsrpc(&["ping", &server.object]));
    assert_eq!(out["event"], "pong");
    assert_eq!(out["object"], "Demo.EchoServer.EchoObj");
}

#[test]
fn slow_call_exits_with_timeout_code() {
    let server = DemoServer::start();
    let output = tarsrpc(&[
        "call",
        &server.object,
        "sleep",
        "1000",
        "--timeout",
        "100ms",
    ]);
    assert_eq!(output.status.code(), Some(124));
}

#[test]
fn unknown_method_exits_with_usage_code() {
    let output = tarsrpc(&[
        "call",
        "Demo.EchoServer.EchoObj@tcp -h 127.0.0.1 -p 1",
        "shout",
    ]);
    assert_eq!(output.status.code(), Some(64));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown method"));
}

#[test]
fn refused_connection_exits_with_transport_code() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .expect("probe bind")
        .port();
    let object = format!("Demo.EchoServer.EchoObj@tcp -h 127.0.0.1 -p {port}");
    let output = tarsrpc(&["call", &object, "echo", "x"]);
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn version_prints_package_version() {
    let output = tarsrpc(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("tarsrpc {}", env!("CARGO_PKG_VERSION")));
}
