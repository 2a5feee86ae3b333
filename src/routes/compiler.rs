//! Route compilation.
//!
//! Walks every `UriGroup`, resolves base endpoints, merges override layers,
//! and produces the immutable [`RouteTable`]. All configuration errors are
//! caught here, before the server starts listening.

use http::Method;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

use super::merge::merge;
use super::{EffectiveRoute, PathPattern, RouteMethod, RouteOverrides, RouteTable};
use crate::config::{Config, RequestResponse, UriMap};
use crate::error::{ProxyError, Result};
use crate::render::{Renderer, Storage};

/// Compile the config into a route table.
///
/// The global base endpoint is evaluated as an expression against
/// `{settings}` exactly once here and cached into every route that uses it.
pub fn compile(cfg: &Config, renderer: &Renderer, settings: &Value) -> Result<RouteTable> {
    let global_base = resolve_global_base(cfg, renderer, settings)?;

    let mut routes: Vec<Arc<EffectiveRoute>> = Vec::new();

    for group in &cfg.uri_groups {
        for uri_map in &group.supported_uris {
            let base_endpoint = resolve_map_base(uri_map, &global_base)?;
            let per_uri = cfg.overrides.uris.get(&uri_map.in_path);

            for route in build_routes(cfg, group.name.clone(), uri_map, base_endpoint, per_uri)? {
                check_duplicate(&routes, &route)?;

                tracing::debug!(
                    method = %route.method.label(),
                    path = route.in_path(),
                    group = %route.group,
                    headless = route.is_headless(),
                    "route compiled"
                );

                routes.push(Arc::new(route));
            }
        }
    }

    Ok(RouteTable::new(routes))
}

fn resolve_global_base(
    cfg: &Config,
    renderer: &Renderer,
    settings: &Value,
) -> Result<Option<Url>> {
    let expr = cfg.base_endpoint.trim();
    if expr.is_empty() {
        return Ok(None);
    }

    let input = json!({ "settings": settings });
    let mut storage = Storage::new();

    let rendered = renderer
        .render_expr(expr, &input, &mut storage)
        .map_err(|e| ProxyError::BaseEndpoint {
            endpoint: expr.to_string(),
            reason: e.to_string(),
        })?;

    let endpoint = String::from_utf8_lossy(&rendered).trim().to_string();

    parse_base(&endpoint).map(Some)
}

fn resolve_map_base(uri_map: &UriMap, global: &Option<Url>) -> Result<Option<Url>> {
    if uri_map.base_endpoint.is_empty() {
        return Ok(global.clone());
    }

    parse_base(&uri_map.base_endpoint).map(Some)
}

fn parse_base(endpoint: &str) -> Result<Url> {
    Url::parse(endpoint).map_err(|e| ProxyError::BaseEndpoint {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })
}

fn build_routes(
    cfg: &Config,
    group: String,
    uri_map: &UriMap,
    base_endpoint: Option<Url>,
    per_uri: Option<&BTreeMap<String, RequestResponse>>,
) -> Result<Vec<EffectiveRoute>> {
    let global = &cfg.overrides.global;
    let pattern = PathPattern::parse(&uri_map.in_path);

    // A UriMap without outbound mappings is headless for every method.
    if uri_map.out.is_empty() {
        let by_method = per_uri
            .map(|methods| {
                methods
                    .iter()
                    .map(|(m, rr)| (m.to_uppercase(), merge(global, rr)))
                    .collect()
            })
            .unwrap_or_default();

        return Ok(vec![EffectiveRoute {
            pattern,
            method: RouteMethod::Any,
            group,
            description: uri_map.description.clone(),
            base_endpoint,
            out: None,
            overrides: RouteOverrides::PerMethod {
                by_method,
                fallback: merge(global, &RequestResponse::default()),
            },
        }]);
    }

    let mut routes = Vec::with_capacity(uri_map.out.len());

    for out_method in &uri_map.out {
        let method_name = out_method.method.to_uppercase();
        let method = Method::from_bytes(method_name.as_bytes()).map_err(|_| {
            ProxyError::InvalidMethod {
                method: out_method.method.clone(),
                path: uri_map.in_path.clone(),
            }
        })?;

        // An OutMethod with no value source is headless for that method.
        let out = if out_method.input.is_empty() {
            None
        } else {
            Some(out_method.input.clone())
        };

        if out.is_some() && base_endpoint.is_none() {
            return Err(ProxyError::MissingBaseEndpoint {
                path: uri_map.in_path.clone(),
            });
        }

        let per_route = per_uri
            .and_then(|methods| methods.get(&method_name))
            .cloned()
            .unwrap_or_default();

        routes.push(EffectiveRoute {
            pattern: pattern.clone(),
            method: RouteMethod::Method(method),
            group: group.clone(),
            description: uri_map.description.clone(),
            base_endpoint: base_endpoint.clone(),
            out,
            overrides: RouteOverrides::Single(merge(global, &per_route)),
        });
    }

    Ok(routes)
}

fn check_duplicate(existing: &[Arc<EffectiveRoute>], new: &EffectiveRoute) -> Result<()> {
    for route in existing {
        if route.in_path() == new.in_path() && route.method.overlaps(&new.method) {
            return Err(ProxyError::DuplicateRoute {
                method: new.method.label(),
                path: new.in_path().to_string(),
                first: route.group.clone(),
                second: new.group.clone(),
            });
        }
    }
    Ok(())
}
