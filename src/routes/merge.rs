//! Override merging.
//!
//! Combines the global override layer with one route's layer. Headers and
//! patches are additive pipelines (global first, so later ops see earlier
//! effects); scalar renderers are whole-value replacements; forward and
//! fetch exist only at the route layer.

use crate::config::{Body, OverrideConfig, RequestResponse, StatusCodeInput};

/// Merge the global override layer with a per-route layer.
pub fn merge(global: &RequestResponse, per_route: &RequestResponse) -> RequestResponse {
    RequestResponse {
        forward: per_route.forward.clone(),
        fetch: per_route.fetch.clone(),
        request: merge_override(&global.request, &per_route.request),
        response: merge_override(&global.response, &per_route.response),
    }
}

fn merge_override(global: &OverrideConfig, per_route: &OverrideConfig) -> OverrideConfig {
    let mut headers = global.headers.clone();
    headers.extend(per_route.headers.iter().cloned());

    let mut patches = global.body.patches.clone();
    patches.extend(per_route.body.patches.iter().cloned());

    OverrideConfig {
        status_code: StatusCodeInput {
            int: if per_route.status_code.int != 0 {
                per_route.status_code.int
            } else {
                global.status_code.int
            },
            expr: pick(&per_route.status_code.expr, &global.status_code.expr),
        },
        headers,
        body: Body {
            patches,
            text: pick(&per_route.body.text, &global.body.text),
            template: pick(&per_route.body.template, &global.body.template),
            expr: pick(&per_route.body.expr, &global.body.expr),
        },
    }
}

fn pick(per_route: &str, global: &str) -> String {
    if per_route.is_empty() {
        global.to_string()
    } else {
        per_route.to_string()
    }
}
