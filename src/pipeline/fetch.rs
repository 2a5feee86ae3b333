//! Fetch fan-out: named sub-requests run concurrently before rendering.
//!
//! Every declared request produces exactly one `{status, body, error}` entry
//! in the template input's `requests` map, whatever its outcome. A failed
//! sub-request never fails the outer request.

use http::StatusCode;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use super::headers::apply_header_ops;
use crate::config::{Fetch, FetchRequest, StatusCodeInput};
use crate::render::{Renderer, Storage};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Execute all fetch sub-requests concurrently and merge their results into
/// `tpl["requests"]`.
pub async fn execute_fetch(
    fetch: &Fetch,
    client: &reqwest::Client,
    renderer: &Arc<Renderer>,
    tpl: &mut Value,
) {
    // Every declared name gets an entry even if its task dies.
    let mut results = Map::new();
    for name in fetch.requests.keys() {
        results.insert(
            name.clone(),
            json!({"status": 0, "body": "", "error": "request did not complete"}),
        );
    }

    let mut tasks = JoinSet::new();

    for (name, request) in &fetch.requests {
        let name = name.clone();
        let request = request.clone();
        let client = client.clone();
        let renderer = renderer.clone();
        let tpl = tpl.clone();

        tasks.spawn(async move {
            let result = execute_fetch_request(&client, &renderer, &request, &tpl).await;
            (name, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, result)) => {
                results.insert(name, result);
            }
            Err(e) => tracing::error!(error = %e, "fetch task failed"),
        }
    }

    if let Value::Object(map) = tpl {
        map.insert("requests".into(), Value::Object(results));
    }
}

/// Execute a single sub-request with its own timeout. All failure modes are
/// folded into the result's `error` field.
async fn execute_fetch_request(
    client: &reqwest::Client,
    renderer: &Renderer,
    request: &FetchRequest,
    tpl: &Value,
) -> Value {
    let timeout = parse_duration(&request.timeout).unwrap_or(DEFAULT_TIMEOUT);
    let mut storage = Storage::new();

    // Render the URL; fall back to the literal text.
    let url = match renderer.render(&request.url.template, &request.url.expr, tpl, &mut storage)
    {
        Ok(rendered) => {
            let rendered = rendered
                .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
                .unwrap_or_default();
            if rendered.is_empty() {
                request.url.text.clone()
            } else {
                rendered
            }
        }
        Err(e) => return fetch_error(0, format!("failed to render URL: {e}")),
    };

    if url.is_empty() {
        return fetch_error(0, "URL is empty");
    }

    let method = match http::Method::from_bytes(request.method.to_uppercase().as_bytes()) {
        Ok(method) => method,
        Err(_) => return fetch_error(0, format!("invalid method '{}'", request.method)),
    };

    let mut body = Vec::new();
    if !request.body.is_empty() {
        match renderer.render(&request.body.template, &request.body.expr, tpl, &mut storage) {
            Ok(Some(rendered)) => body = rendered,
            Ok(None) => body = request.body.text.clone().into_bytes(),
            Err(e) => return fetch_error(0, format!("failed to render body: {e}")),
        }
        if body.is_empty() && !request.body.text.is_empty() {
            body = request.body.text.clone().into_bytes();
        }
    }

    let mut headers = http::HeaderMap::new();
    if let Err(e) =
        apply_header_ops(&request.headers, &mut headers, client, renderer, tpl, &mut storage)
            .await
    {
        return fetch_error(0, format!("failed to render headers: {e}"));
    }

    let response = match client
        .request(method, &url)
        .headers(headers)
        .body(body)
        .timeout(timeout)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => return fetch_error(0, format!("request failed: {e}")),
    };

    let status = response.status().as_u16();

    let body = match response.bytes().await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => return fetch_error(status, format!("failed to read response: {e}")),
    };

    let error = if (200..300).contains(&status) {
        String::new()
    } else {
        format!("HTTP {status}")
    };

    json!({"status": status, "body": body, "error": error})
}

fn fetch_error(status: u16, error: impl Into<String>) -> Value {
    json!({"status": status, "body": "", "error": error.into()})
}

/// Evaluate a status code input: expression first (falling through on any
/// failure), then the literal, then 200.
pub fn evaluate_status_code(
    renderer: &Renderer,
    status: &StatusCodeInput,
    tpl: &Value,
) -> StatusCode {
    if !status.expr.trim().is_empty() {
        let mut storage = Storage::new();
        if let Ok(rendered) = renderer.render_expr(&status.expr, tpl, &mut storage) {
            if let Ok(code) = String::from_utf8_lossy(&rendered).trim().parse::<u16>() {
                if let Ok(code) = StatusCode::from_u16(code) {
                    return code;
                }
            }
        }
        // Fall through to the literal or default on error.
    }

    if status.int != 0 {
        if let Ok(code) = StatusCode::from_u16(status.int) {
            return code;
        }
    }

    StatusCode::OK
}

/// Parse Go-style duration strings: `300ms`, `5s`, `2m`, `1h`.
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (number, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit() && c != '.')?);
    let value: f64 = number.parse().ok()?;

    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => return None,
    };

    Some(Duration::from_millis(millis as u64))
}
