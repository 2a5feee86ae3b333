//! Streaming SSE transformer.
//!
//! A producer task reads the upstream body line by line and writes each
//! (possibly rewritten) line into a bounded channel backing the downstream
//! response body. One event is fully emitted before the next is read, and
//! one temporary storage map lives for the whole stream so event handlers
//! can accumulate state across lines.

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde_json::Value;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::Body as BodyOverride;
use crate::render::{Renderer, Storage};

/// Replace the upstream body with a line-rewriting stream.
///
/// `input` is the event-less template input (`body` absent, `event` null);
/// each line sets `event` before rendering.
pub fn transform(
    upstream: reqwest::Response,
    override_body: BodyOverride,
    renderer: Arc<Renderer>,
    input: Value,
) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(16);

    tokio::spawn(async move {
        let mut stream = upstream.bytes_stream();
        let mut buf = BytesMut::new();
        let mut storage = Storage::new();
        let mut input = input;

        'stream: while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::error!(error = %e, "sse upstream read failed");
                    break;
                }
            };

            buf.extend_from_slice(&chunk);

            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line = buf.split_to(pos + 1).freeze();
                let out = process_line(&line, &override_body, &renderer, &mut input, &mut storage);

                if tx.send(Ok(out)).await.is_err() {
                    // Client went away.
                    break 'stream;
                }
            }
        }

        if !buf.is_empty() {
            tracing::debug!(bytes = buf.len(), "dropping partial trailing sse line");
        }
    });

    Body::from_stream(ReceiverStream::new(rx))
}

/// Rewrite a single line, or pass it through byte-identical.
///
/// Pass-through cases: no template/expr override; heartbeat (empty payload)
/// lines; a template-only override on a payload that is not JSON; and any
/// render failure (logged).
fn process_line(
    line: &Bytes,
    override_body: &BodyOverride,
    renderer: &Renderer,
    input: &mut Value,
    storage: &mut Storage,
) -> Bytes {
    if !override_body.has_renderer() {
        return line.clone();
    }

    let text = String::from_utf8_lossy(line);
    let payload = text
        .strip_prefix("data:")
        .unwrap_or(&text)
        .trim();

    if payload.is_empty() {
        return line.clone();
    }

    let parsed: Option<Value> = serde_json::from_str(payload).ok();
    let has_expr = !override_body.expr.trim().is_empty();

    // A template cannot pick fields out of a non-JSON event; keep the line.
    if !has_expr && parsed.is_none() {
        return line.clone();
    }

    let event = parsed.unwrap_or_else(|| Value::String(text.trim_end_matches(['\r', '\n']).to_string()));

    if let Value::Object(map) = input {
        map.insert("event".into(), event);
    }

    match renderer.render(&override_body.template, &override_body.expr, input, storage) {
        Ok(Some(rendered)) => Bytes::from(rendered),
        Ok(None) => line.clone(),
        Err(e) => {
            tracing::error!(error = %e, "sse line render failed, passing line through");
            line.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run_line(
        line: &str,
        override_body: &BodyOverride,
        input: &mut Value,
        storage: &mut Storage,
    ) -> String {
        let renderer = Renderer::new();
        let out = process_line(
            &Bytes::from(line.to_string()),
            override_body,
            &renderer,
            input,
            storage,
        );
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn no_override_passes_through() {
        let mut input = json!({});
        let mut storage = Storage::new();
        let line = "data: {\"type\":\"delta\"}\n";
        assert_eq!(
            run_line(line, &BodyOverride::default(), &mut input, &mut storage),
            line
        );
    }

    #[test]
    fn heartbeats_pass_through_even_with_override() {
        let override_body = BodyOverride {
            expr: r#""rewritten""#.into(),
            ..BodyOverride::default()
        };
        let mut input = json!({});
        let mut storage = Storage::new();

        assert_eq!(run_line("\n", &override_body, &mut input, &mut storage), "\n");
        assert_eq!(
            run_line("data: \n", &override_body, &mut input, &mut storage),
            "data: \n"
        );
    }

    #[test]
    fn template_only_keeps_non_json_events() {
        let override_body = BodyOverride {
            template: "data: changed\n".into(),
            ..BodyOverride::default()
        };
        let mut input = json!({});
        let mut storage = Storage::new();

        assert_eq!(
            run_line("data: [DONE]\n", &override_body, &mut input, &mut storage),
            "data: [DONE]\n"
        );
        assert_eq!(
            run_line(
                "data: {\"ok\":true}\n",
                &override_body,
                &mut input,
                &mut storage
            ),
            "data: changed\n"
        );
    }

    #[test]
    fn expr_rewrites_using_event_fields() {
        let override_body = BodyOverride {
            expr: r#""data: " + toCompactJson(filterOutKeys(event, ["internal"])) + "\n""#.into(),
            ..BodyOverride::default()
        };
        let mut input = json!({});
        let mut storage = Storage::new();

        let out = run_line(
            "data: {\"keep\":1,\"internal\":2}\n",
            &override_body,
            &mut input,
            &mut storage,
        );
        assert_eq!(out, "data: {\"keep\":1}\n");
    }

    #[test]
    fn storage_accumulates_across_lines() {
        let override_body = BodyOverride {
            template:
                "{{ set \"total\" (sum (get \"total\") .event.usage.output_tokens) }}data: {{ get \"total\" }}\n"
                    .into(),
            ..BodyOverride::default()
        };
        let mut input = json!({});
        let mut storage = Storage::new();

        let first = run_line(
            "data: {\"usage\":{\"output_tokens\":3}}\n",
            &override_body,
            &mut input,
            &mut storage,
        );
        let second = run_line(
            "data: {\"usage\":{\"output_tokens\":4}}\n",
            &override_body,
            &mut input,
            &mut storage,
        );

        assert_eq!(first, "data: 3\n");
        assert_eq!(second, "data: 7\n");
        assert_eq!(storage["total"], "7");
    }

    #[test]
    fn render_failure_passes_line_through() {
        let override_body = BodyOverride {
            expr: "merge(1, 2)".into(),
            ..BodyOverride::default()
        };
        let mut input = json!({});
        let mut storage = Storage::new();

        let line = "data: {\"a\":1}\n";
        assert_eq!(
            run_line(line, &override_body, &mut input, &mut storage),
            line
        );
    }
}
