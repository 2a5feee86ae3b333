//! Body overrides: wholesale template/expr replacement or RFC 6902 patches.

use serde_json::Value;

use crate::config::Body;
use crate::error::{ProxyError, Result};
use crate::render::{Renderer, Storage};

/// Apply a body override in place. Returns whether the body was rewritten,
/// so the caller can fix `Content-Length` and drop `Transfer-Encoding`.
pub fn apply_body_override(
    renderer: &Renderer,
    override_body: &Body,
    body: &mut Vec<u8>,
    tpl: &Value,
    storage: &mut Storage,
) -> Result<bool> {
    // A template or expression replaces the body wholesale; the expression
    // wins when both are present.
    if override_body.has_renderer() {
        if let Some(rendered) =
            renderer.render(&override_body.template, &override_body.expr, tpl, storage)?
        {
            *body = rendered;
            return Ok(true);
        }
    }

    if override_body.patches.is_empty() {
        return Ok(false);
    }

    let mut doc: Value = if body.is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice(body).map_err(|e| ProxyError::Patch(e.to_string()))?
    };

    let patch: json_patch::Patch = serde_json::to_value(&override_body.patches)
        .and_then(serde_json::from_value)
        .map_err(|e| ProxyError::Patch(e.to_string()))?;

    json_patch::patch(&mut doc, &patch).map_err(|e| ProxyError::Patch(e.to_string()))?;

    *body = serde_json::to_vec(&doc).map_err(|e| ProxyError::Patch(e.to_string()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Patch;
    use serde_json::json;

    fn apply(override_body: &Body, body: &str, tpl: Value) -> Result<(Vec<u8>, bool)> {
        let renderer = Renderer::new();
        let mut storage = Storage::new();
        let mut bytes = body.as_bytes().to_vec();
        let rewritten = apply_body_override(&renderer, override_body, &mut bytes, &tpl, &mut storage)?;
        Ok((bytes, rewritten))
    }

    #[test]
    fn empty_override_leaves_body_unchanged() {
        let (body, rewritten) = apply(&Body::default(), r#"{"a":1}"#, json!({})).unwrap();
        assert!(!rewritten);
        assert_eq!(body, br#"{"a":1}"#);
    }

    #[test]
    fn patches_apply_in_order() {
        let override_body = Body {
            patches: vec![
                Patch {
                    op: "replace".into(),
                    path: "/model".into(),
                    value: json!("gpt-4"),
                },
                Patch {
                    op: "add".into(),
                    path: "/stream".into(),
                    value: json!(true),
                },
            ],
            ..Body::default()
        };

        let (body, rewritten) =
            apply(&override_body, r#"{"model":"x","m":1}"#, json!({})).unwrap();
        assert!(rewritten);

        let doc: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(doc, json!({"model": "gpt-4", "m": 1, "stream": true}));
    }

    #[test]
    fn expr_wins_over_template() {
        let override_body = Body {
            template: "from-template".into(),
            expr: r#""from-expr""#.into(),
            ..Body::default()
        };

        let (body, rewritten) = apply(&override_body, "old", json!({})).unwrap();
        assert!(rewritten);
        assert_eq!(body, b"from-expr");
    }

    #[test]
    fn template_renders_against_input() {
        let override_body = Body {
            template: r#"{"model": "{{ .body.model }}"}"#.into(),
            ..Body::default()
        };

        let (body, _) = apply(
            &override_body,
            "ignored",
            json!({"body": {"model": "opus"}}),
        )
        .unwrap();
        assert_eq!(body, br#"{"model": "opus"}"#);
    }

    #[test]
    fn patches_on_empty_body_start_from_empty_object() {
        let override_body = Body {
            patches: vec![Patch {
                op: "add".into(),
                path: "/created".into(),
                value: json!(true),
            }],
            ..Body::default()
        };

        let (body, _) = apply(&override_body, "", json!({})).unwrap();
        let doc: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(doc, json!({"created": true}));
    }

    #[test]
    fn bad_patch_target_is_an_error() {
        let override_body = Body {
            patches: vec![Patch {
                op: "replace".into(),
                path: "/missing".into(),
                value: json!(1),
            }],
            ..Body::default()
        };

        let err = apply(&override_body, r#"{"a":1}"#, json!({})).unwrap_err();
        assert!(matches!(err, ProxyError::Patch(_)));
    }
}
