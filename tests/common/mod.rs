//! Shared utilities for integration testing.
#![allow(dead_code)]

use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;

use proxima::{config, server, Dispatcher, Renderer};

/// Serve an axum router on an ephemeral port and return its address.
pub async fn spawn(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    addr
}

/// Compile the YAML config and serve the proxy on an ephemeral port.
pub async fn spawn_proxy(yaml: &str) -> SocketAddr {
    spawn_proxy_with(yaml, json!({}), false, Arc::new(Renderer::new())).await
}

pub async fn spawn_proxy_with(
    yaml: &str,
    settings: Value,
    test_mode: bool,
    renderer: Arc<Renderer>,
) -> SocketAddr {
    let cfg = config::from_bytes(yaml.as_bytes()).unwrap();
    let dispatcher = Arc::new(Dispatcher::new(&cfg, settings, renderer, test_mode).unwrap());
    spawn(server::build_router(dispatcher)).await
}

/// Write a stub credential CLI that counts its invocations and prints the
/// given token.
pub fn stub_credential_cli(dir: &Path, token: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = dir.join("atlas");
    let calls = dir.join("calls");

    std::fs::write(
        &script,
        format!(
            "#!/bin/sh\necho called >> '{}'\nprintf '%s' '{token}'\n",
            calls.display()
        ),
    )
    .unwrap();

    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

/// How many times the stub credential CLI ran.
pub fn credential_calls(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("calls"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// An unsigned JWT whose `exp` claim is `now + ttl_secs`.
pub fn make_jwt(ttl_secs: i64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;

    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(json!({ "exp": now + ttl_secs }).to_string());
    format!("{header}.{payload}.stub-signature")
}
