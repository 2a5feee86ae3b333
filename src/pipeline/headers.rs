//! Two-phase header operations.
//!
//! Static operations apply first, in declared order. `template`/`expr`
//! sources are recorded as deferred placeholders and rendered only after
//! every static op has run, so a header that ends up removed never triggers
//! rendering (and never invokes the credential helper).

use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use http::HeaderMap;
use serde_json::Value;

use super::input::source_request_value;
use crate::config::{Header, HeaderOp, Input};
use crate::error::{ProxyError, Result};
use crate::render::{Renderer, Storage};

/// Apply header operations to `headers`, rendering against `tpl`.
pub async fn apply_header_ops(
    ops: &[Header],
    headers: &mut HeaderMap,
    client: &reqwest::Client,
    renderer: &Renderer,
    tpl: &Value,
    storage: &mut Storage,
) -> Result<()> {
    // Deferred template/expr sources, keyed by lower-cased header name.
    // Declared order is preserved; a later op on the same name replaces or
    // cancels the pending render.
    let mut deferred: Vec<(String, Input)> = Vec::new();

    for op in ops {
        let lower = op.name.to_lowercase();

        match op.op {
            HeaderOp::Remove => {
                if !op.name.is_empty() {
                    headers.remove(lower.as_str());
                    deferred.retain(|(name, _)| name != &lower);
                    continue;
                }

                // Wipe everything except Content-Length, which cannot be
                // statically set.
                let content_length = headers.get(CONTENT_LENGTH).cloned();
                headers.clear();
                if let Some(value) = content_length {
                    headers.insert(CONTENT_LENGTH, value);
                }
                deferred.clear();
            }

            HeaderOp::Add => {
                let name = header_name(&op.name)?;
                deferred.retain(|(deferred_name, _)| deferred_name != &lower);

                if !op.input.template.trim().is_empty() || !op.input.expr.trim().is_empty() {
                    // Placeholder now, render in phase two.
                    headers.insert(name, HeaderValue::from_static(""));
                    deferred.push((lower, op.input.clone()));
                    continue;
                }

                let value = static_value(&op.input, client).await?;
                headers.insert(name, header_value(&op.name, &value)?);
            }
        }
    }

    // Phase two: render whatever survived.
    for (lower, input) in deferred {
        if !headers.contains_key(lower.as_str()) {
            continue;
        }

        let rendered = renderer
            .render(&input.template, &input.expr, tpl, storage)?
            .unwrap_or_default();
        let value = String::from_utf8_lossy(&rendered);
        let name = header_name(&lower)?;
        headers.insert(name, header_value(&lower, value.trim())?);
    }

    Ok(())
}

/// Resolve a static (non-rendered) header value source.
async fn static_value(input: &Input, client: &reqwest::Client) -> Result<String> {
    if !input.text.is_empty() {
        return Ok(input.text.clone());
    }

    if !input.file.is_empty() {
        let contents = tokio::fs::read_to_string(&input.file)
            .await
            .map_err(|e| ProxyError::HeaderSource(format!("{}: {e}", input.file)))?;
        return Ok(contents.trim_end().to_string());
    }

    if !input.request.url.is_empty() {
        return source_request_value(client, &input.request).await;
    }

    Ok(String::new())
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::try_from(name).map_err(|e| ProxyError::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ProxyError::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_text(name: &str, text: &str) -> Header {
        Header {
            op: HeaderOp::Add,
            name: name.into(),
            input: Input {
                text: text.into(),
                ..Input::default()
            },
        }
    }

    fn add_expr(name: &str, expr: &str) -> Header {
        Header {
            op: HeaderOp::Add,
            name: name.into(),
            input: Input {
                expr: expr.into(),
                ..Input::default()
            },
        }
    }

    fn remove(name: &str) -> Header {
        Header {
            op: HeaderOp::Remove,
            name: name.into(),
            ..Header::default()
        }
    }

    async fn apply(ops: &[Header], headers: &mut HeaderMap, tpl: Value) -> Result<()> {
        let client = reqwest::Client::new();
        let renderer = Renderer::new();
        let mut storage = Storage::new();
        apply_header_ops(ops, headers, &client, &renderer, &tpl, &mut storage).await
    }

    #[tokio::test]
    async fn literal_add_and_remove() {
        let mut headers = HeaderMap::new();
        headers.insert("x-old", HeaderValue::from_static("1"));

        apply(
            &[add_text("X-New", "v"), remove("X-Old")],
            &mut headers,
            json!({}),
        )
        .await
        .unwrap();

        assert_eq!(headers.get("x-new").unwrap(), "v");
        assert!(headers.get("x-old").is_none());
    }

    #[tokio::test]
    async fn remove_all_keeps_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("secret"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));

        apply(&[remove("")], &mut headers, json!({})).await.unwrap();

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get(CONTENT_LENGTH).unwrap(), "42");
    }

    #[tokio::test]
    async fn deferred_expr_renders_after_static_ops() {
        let mut headers = HeaderMap::new();

        apply(
            &[add_expr("X-Model", "body.model")],
            &mut headers,
            json!({"body": {"model": "opus"}}),
        )
        .await
        .unwrap();

        assert_eq!(headers.get("x-model").unwrap(), "opus");
    }

    #[tokio::test]
    async fn removed_header_is_never_rendered() {
        let mut headers = HeaderMap::new();

        // merge(1, 2) fails at runtime, so a rendered removal would error.
        let failing = add_expr("Authorization", "merge(1, 2)");

        apply(
            &[failing, remove("Authorization")],
            &mut headers,
            json!({}),
        )
        .await
        .unwrap();

        assert!(headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn later_static_add_cancels_deferred_render() {
        let mut headers = HeaderMap::new();

        apply(
            &[add_expr("X-A", "merge(1, 2)"), add_text("X-A", "static")],
            &mut headers,
            json!({}),
        )
        .await
        .unwrap();

        assert_eq!(headers.get("x-a").unwrap(), "static");
    }

    #[tokio::test]
    async fn remove_all_cancels_deferred_renders() {
        let mut headers = HeaderMap::new();

        apply(
            &[add_expr("X-A", "merge(1, 2)"), remove("")],
            &mut headers,
            json!({}),
        )
        .await
        .unwrap();

        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn file_source_reads_at_request_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value.txt");
        std::fs::write(&path, "from-file\n").unwrap();

        let op = Header {
            op: HeaderOp::Add,
            name: "X-File".into(),
            input: Input {
                file: path.display().to_string(),
                ..Input::default()
            },
        };

        let mut headers = HeaderMap::new();
        apply(&[op], &mut headers, json!({})).await.unwrap();
        assert_eq!(headers.get("x-file").unwrap(), "from-file");
    }

    #[tokio::test]
    async fn missing_file_is_a_header_source_error() {
        let op = Header {
            op: HeaderOp::Add,
            name: "X-File".into(),
            input: Input {
                file: "/nonexistent/value.txt".into(),
                ..Input::default()
            },
        };

        let mut headers = HeaderMap::new();
        let err = apply(&[op], &mut headers, json!({})).await.unwrap_err();
        assert!(matches!(err, ProxyError::HeaderSource(_)));
    }
}
