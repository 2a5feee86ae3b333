//! Fetch fan-out behavior against live mock servers.

mod common;

use axum::routing::get;
use axum::Router;
use http::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use common::spawn;
use proxima::config::{Fetch, FetchRequest, Input};
use proxima::pipeline::fetch::execute_fetch;
use proxima::Renderer;

fn fetch_of(requests: Vec<(&str, FetchRequest)>) -> Fetch {
    Fetch {
        requests: requests
            .into_iter()
            .map(|(name, request)| (name.to_string(), request))
            .collect(),
    }
}

fn text_url(url: String) -> Input {
    Input {
        text: url,
        ..Input::default()
    }
}

async fn run_fetch(fetch: &Fetch, mut tpl: Value) -> Value {
    let client = reqwest::Client::new();
    let renderer = Arc::new(Renderer::new());
    execute_fetch(fetch, &client, &renderer, &mut tpl).await;
    tpl["requests"].clone()
}

#[tokio::test]
async fn single_request_populates_status_and_body() {
    let upstream = Router::new().route("/", get(|| async { r#"{"message": "hello"}"# }));
    let addr = spawn(upstream).await;

    let fetch = fetch_of(vec![(
        "api",
        FetchRequest {
            method: "GET".into(),
            url: text_url(format!("http://{addr}/")),
            ..FetchRequest::default()
        },
    )]);

    let requests = run_fetch(&fetch, json!({})).await;
    assert_eq!(requests["api"]["status"], 200);
    assert_eq!(requests["api"]["body"], r#"{"message": "hello"}"#);
    assert_eq!(requests["api"]["error"], "");
}

#[tokio::test]
async fn url_can_come_from_an_expression() {
    let upstream = Router::new().route("/", get(|| async { "ok" }));
    let addr = spawn(upstream).await;

    let fetch = fetch_of(vec![(
        "api",
        FetchRequest {
            method: "GET".into(),
            url: Input {
                expr: "settings.baseUrl".into(),
                ..Input::default()
            },
            ..FetchRequest::default()
        },
    )]);

    let tpl = json!({"settings": {"baseUrl": format!("http://{addr}/")}});
    let requests = run_fetch(&fetch, tpl).await;
    assert_eq!(requests["api"]["status"], 200);
    assert_eq!(requests["api"]["error"], "");
}

#[tokio::test]
async fn slow_server_times_out() {
    let upstream = Router::new().route(
        "/",
        get(|| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            "late"
        }),
    );
    let addr = spawn(upstream).await;

    let fetch = fetch_of(vec![(
        "slow",
        FetchRequest {
            method: "GET".into(),
            url: text_url(format!("http://{addr}/")),
            timeout: "50ms".into(),
            ..FetchRequest::default()
        },
    )]);

    let requests = run_fetch(&fetch, json!({})).await;
    assert_ne!(requests["slow"]["error"], "");
}

#[tokio::test]
async fn non_2xx_status_surfaces_as_error_with_body() {
    let upstream = Router::new().route(
        "/",
        get(|| async { (StatusCode::NOT_FOUND, r#"{"error": "not found"}"#) }),
    );
    let addr = spawn(upstream).await;

    let fetch = fetch_of(vec![(
        "missing",
        FetchRequest {
            method: "GET".into(),
            url: text_url(format!("http://{addr}/")),
            ..FetchRequest::default()
        },
    )]);

    let requests = run_fetch(&fetch, json!({})).await;
    assert_eq!(requests["missing"]["status"], 404);
    assert_eq!(requests["missing"]["error"], "HTTP 404");
    assert_eq!(requests["missing"]["body"], r#"{"error": "not found"}"#);
}

#[tokio::test]
async fn all_declared_requests_produce_entries() {
    let first = Router::new().route("/", get(|| async { r#"{"id": 1}"# }));
    let second = Router::new().route("/", get(|| async { r#"{"id": 2}"# }));
    let first_addr = spawn(first).await;
    let second_addr = spawn(second).await;

    let fetch = fetch_of(vec![
        (
            "first",
            FetchRequest {
                method: "GET".into(),
                url: text_url(format!("http://{first_addr}/")),
                ..FetchRequest::default()
            },
        ),
        (
            "second",
            FetchRequest {
                method: "GET".into(),
                url: text_url(format!("http://{second_addr}/")),
                ..FetchRequest::default()
            },
        ),
        (
            "dead",
            FetchRequest {
                method: "GET".into(),
                url: text_url("http://127.0.0.1:1/".into()),
                timeout: "300ms".into(),
                ..FetchRequest::default()
            },
        ),
    ]);

    let requests = run_fetch(&fetch, json!({})).await;
    let map = requests.as_object().unwrap();

    assert_eq!(map.len(), 3);
    assert_eq!(requests["first"]["body"], r#"{"id": 1}"#);
    assert_eq!(requests["second"]["body"], r#"{"id": 2}"#);
    assert_ne!(requests["dead"]["error"], "");
}

#[tokio::test]
async fn rendered_body_reaches_the_sub_request() {
    let upstream = Router::new().route(
        "/",
        get(|| async { "unused" }).post(|body: String| async move { body }),
    );
    let addr = spawn(upstream).await;

    let fetch = fetch_of(vec![(
        "echo",
        FetchRequest {
            method: "POST".into(),
            url: text_url(format!("http://{addr}/")),
            body: Input {
                template: r#"{"model": "{{ .body.model }}"}"#.into(),
                ..Input::default()
            },
            ..FetchRequest::default()
        },
    )]);

    let tpl = json!({"body": {"model": "opus"}});
    let requests = run_fetch(&fetch, tpl).await;
    assert_eq!(requests["echo"]["body"], r#"{"model": "opus"}"#);
}

#[tokio::test]
async fn empty_url_is_an_error_entry() {
    let fetch = fetch_of(vec![("blank", FetchRequest::default())]);

    let requests = run_fetch(&fetch, json!({})).await;
    assert_eq!(requests["blank"]["error"], "URL is empty");
}
