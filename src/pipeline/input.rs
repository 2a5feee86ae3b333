//! Template input construction and `Input` value-source resolution.
//!
//! The template input is the evaluation environment for a single render
//! pass: a JSON object with the reserved keys `path`, `pathParams`,
//! `headers`, `body`, `settings`, `version`, `requests`, and `event`.

use http::header::CONTENT_TYPE;
use http::HeaderMap;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use super::InboundRequest;
use crate::config::{Input, SourceRequest};
use crate::error::{ProxyError, Result};
use crate::render::{Renderer, Storage};

/// Build the per-request evaluation environment.
pub fn build_request_input(
    req: &InboundRequest,
    params: &BTreeMap<String, String>,
    settings: &Value,
    version: &str,
) -> Value {
    json!({
        "path": req.path,
        "pathParams": params,
        "headers": headers_value(&req.headers),
        "body": parse_body(&req.headers, &req.body),
        "settings": settings,
        "version": version,
    })
}

/// Derive the response-side environment: same request context, but `headers`
/// and `body` describe the upstream response.
pub fn build_response_input(request_input: &Value, headers: &HeaderMap, body: &[u8]) -> Value {
    let mut input = request_input.clone();
    if let Value::Object(map) = &mut input {
        map.insert("headers".into(), headers_value(headers));
        map.insert("body".into(), parse_body(headers, body));
    }
    input
}

/// Environment for SSE header rewriting and per-event rendering: no `body`,
/// `event` starts out null and is set per line.
pub fn build_event_input(request_input: &Value, headers: &HeaderMap) -> Value {
    let mut input = request_input.clone();
    if let Value::Object(map) = &mut input {
        map.insert("headers".into(), headers_value(headers));
        map.remove("body");
        map.insert("event".into(), Value::Null);
    }
    input
}

/// Snapshot headers as a name → value map. Multi-valued headers join with
/// `", "`.
pub fn headers_value(headers: &HeaderMap) -> Value {
    let mut map = Map::new();

    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        map.insert(name.as_str().to_string(), Value::String(joined));
    }

    Value::Object(map)
}

/// Decode the body: a JSON value when the Content-Type is exactly
/// `application/json` (an empty body counts as an empty object), raw text
/// otherwise.
pub fn parse_body(headers: &HeaderMap, body: &[u8]) -> Value {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if content_type == "application/json" {
        if body.is_empty() {
            return Value::Object(Map::new());
        }
        if let Ok(value) = serde_json::from_slice(body) {
            return value;
        }
    }

    Value::String(String::from_utf8_lossy(body).into_owned())
}

/// Resolve an [`Input`] to its value. Returns `None` when no source is set.
///
/// Precedence: expression, template, file, sub-request, literal text.
pub async fn render_input(
    input: &Input,
    client: &reqwest::Client,
    renderer: &Renderer,
    tpl: &Value,
    storage: &mut Storage,
) -> Result<Option<String>> {
    if let Some(rendered) = renderer.render(&input.template, &input.expr, tpl, storage)? {
        return Ok(Some(String::from_utf8_lossy(&rendered).into_owned()));
    }

    if !input.file.is_empty() {
        let contents = tokio::fs::read_to_string(&input.file)
            .await
            .map_err(|e| ProxyError::HeaderSource(format!("{}: {e}", input.file)))?;
        return Ok(Some(contents));
    }

    if !input.request.url.is_empty() {
        return source_request_value(client, &input.request).await.map(Some);
    }

    if !input.text.is_empty() {
        return Ok(Some(input.text.clone()));
    }

    Ok(None)
}

/// Perform an embedded source request and walk its JSON response down
/// `resultPath` to a string value.
pub async fn source_request_value(
    client: &reqwest::Client,
    source: &SourceRequest,
) -> Result<String> {
    let method = http::Method::from_bytes(source.method.to_uppercase().as_bytes())
        .map_err(|_| ProxyError::HeaderSource(format!("invalid method '{}'", source.method)))?;

    let response = client
        .request(method, &source.url)
        .header(CONTENT_TYPE, "application/json")
        .body(source.json_body.clone())
        .send()
        .await
        .map_err(|e| ProxyError::HeaderSource(e.to_string()))?;

    let data: Value = response
        .json()
        .await
        .map_err(|e| ProxyError::HeaderSource(e.to_string()))?;

    value_at_path(&data, &source.response.result_path)
}

fn value_at_path(data: &Value, path: &str) -> Result<String> {
    let mut current = data;

    for key in path.trim_matches('/').split('/').filter(|k| !k.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(key).unwrap_or(&Value::Null),
            _ => return Err(ProxyError::HeaderSource("error parsing response".into())),
        };
    }

    match current {
        Value::String(s) => Ok(s.clone()),
        other => Err(ProxyError::HeaderSource(format!(
            "error parsing response, returned type is not a string: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderValue, Method};

    fn request(content_type: &str, body: &str) -> InboundRequest {
        let mut headers = HeaderMap::new();
        if !content_type.is_empty() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        }
        InboundRequest {
            method: Method::POST,
            path: "/v1/chat".into(),
            query: None,
            headers,
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn json_body_is_parsed() {
        let req = request("application/json", r#"{"model": "opus"}"#);
        let input = build_request_input(&req, &BTreeMap::new(), &json!({}), "1.0");
        assert_eq!(input["body"]["model"], "opus");
        assert_eq!(input["path"], "/v1/chat");
        assert_eq!(input["headers"]["content-type"], "application/json");
    }

    #[test]
    fn non_json_content_type_keeps_raw_text() {
        let req = request("text/plain", "raw payload");
        let input = build_request_input(&req, &BTreeMap::new(), &json!({}), "1.0");
        assert_eq!(input["body"], "raw payload");
    }

    #[test]
    fn json_content_type_with_empty_body_is_empty_object() {
        let req = request("application/json", "");
        let input = build_request_input(&req, &BTreeMap::new(), &json!({}), "1.0");
        assert_eq!(input["body"], json!({}));
    }

    #[test]
    fn charset_suffix_is_not_exact_json() {
        let req = request("application/json; charset=utf-8", r#"{"a":1}"#);
        let input = build_request_input(&req, &BTreeMap::new(), &json!({}), "1.0");
        assert_eq!(input["body"], r#"{"a":1}"#);
    }

    #[test]
    fn path_params_are_exposed() {
        let req = request("", "");
        let mut params = BTreeMap::new();
        params.insert("model".to_string(), "claude".to_string());
        let input = build_request_input(&req, &params, &json!({}), "1.0");
        assert_eq!(input["pathParams"]["model"], "claude");
    }

    #[test]
    fn event_input_drops_body() {
        let req = request("application/json", r#"{"a":1}"#);
        let input = build_request_input(&req, &BTreeMap::new(), &json!({}), "1.0");
        let event_input = build_event_input(&input, &HeaderMap::new());
        assert!(event_input.get("body").is_none());
        assert_eq!(event_input["event"], Value::Null);
    }

    #[test]
    fn value_at_path_walks_and_asserts_string() {
        let data = json!({"data": {"token": "abc", "n": 1}});
        assert_eq!(value_at_path(&data, "/data/token").unwrap(), "abc");
        assert_eq!(value_at_path(&data, "data/token").unwrap(), "abc");
        assert!(value_at_path(&data, "/data/n").is_err());
        assert!(value_at_path(&data, "/data/token/deeper").is_err());
    }
}
