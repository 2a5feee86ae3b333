//! Per-request pipeline.
//!
//! # Data Flow
//! ```text
//! InboundRequest
//!     → RouteTable lookup (404 on miss)
//!     → build template input (path, params, headers, body, settings)
//!     → forward?  → rewrite path/headers, re-dispatch (hop-capped)
//!     → fetch?    → concurrent sub-requests into `requests`
//!     → headless? → synthesize response locally
//!     → test mode → echo the fully rendered request as JSON
//!     → otherwise → render outbound request, proxy to upstream,
//!                   rewrite the response (buffered or SSE stream)
//! ```

pub mod body;
pub mod fetch;
pub mod headers;
pub mod input;
pub mod sse;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use http::{HeaderMap, Method, StatusCode};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

use crate::config::{Config, Forward, OverrideConfig, RequestResponse};
use crate::error::{ProxyError, Result};
use crate::render::{Renderer, Storage};
use crate::routes::{self, EffectiveRoute, RouteTable};

/// Forward re-dispatches allowed per request before answering 508.
pub const MAX_FORWARD_HOPS: u8 = 8;

/// A buffered inbound request. Buffering the body up front is what makes
/// internal re-dispatch and test-mode echoing possible.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The request-processing engine: compiled routes plus everything a request
/// needs at runtime. Immutable after construction.
#[derive(Debug)]
pub struct Dispatcher {
    table: RouteTable,
    renderer: Arc<Renderer>,
    client: reqwest::Client,
    settings: Value,
    version: String,
    test_mode: bool,
}

impl Dispatcher {
    pub fn new(
        cfg: &Config,
        settings: Value,
        renderer: Arc<Renderer>,
        test_mode: bool,
    ) -> Result<Self> {
        let table = routes::compile(cfg, &renderer, &settings)?;

        Ok(Self {
            table,
            renderer,
            client: reqwest::Client::new(),
            settings,
            version: env!("CARGO_PKG_VERSION").to_string(),
            test_mode,
        })
    }

    pub fn routes(&self) -> &RouteTable {
        &self.table
    }

    /// Serve one request. Never fails: errors become status responses.
    pub fn dispatch(&self, req: InboundRequest, hops: u8) -> BoxFuture<'_, Response> {
        Box::pin(async move {
            let Some((route, params)) = self.table.lookup(&req.method, &req.path) else {
                tracing::debug!(method = %req.method, path = %req.path, "no route matched");
                return plain_response(StatusCode::NOT_FOUND, "no matching route found");
            };

            let rr = route.overrides_for(&req.method).clone();

            match self.handle(&route, &rr, params, req, hops).await {
                Ok(response) => response,
                Err(err) => {
                    tracing::error!(path = route.in_path(), error = %err, "request failed");
                    plain_response(err.status(), &err.to_string())
                }
            }
        })
    }

    async fn handle(
        &self,
        route: &EffectiveRoute,
        rr: &RequestResponse,
        params: BTreeMap<String, String>,
        req: InboundRequest,
        hops: u8,
    ) -> Result<Response> {
        let mut tpl = input::build_request_input(&req, &params, &self.settings, &self.version);
        let mut storage = Storage::new();

        if let Some(forward) = &rr.forward {
            if hops >= MAX_FORWARD_HOPS {
                return Err(ProxyError::ForwardLoop { hops });
            }
            let next = self.build_forward(&req, forward, &tpl, &mut storage).await?;
            tracing::info!(from = %req.path, to = %next.path, "forwarding request");
            return Ok(self.dispatch(next, hops + 1).await);
        }

        if let Some(fetch) = &rr.fetch {
            fetch::execute_fetch(fetch, &self.client, &self.renderer, &mut tpl).await;
        }

        let Some(out_input) = &route.out else {
            return self.headless(&rr.response, &tpl, &mut storage).await;
        };

        // Render the outbound request: path, then headers, then body.
        let out_path =
            input::render_input(out_input, &self.client, &self.renderer, &tpl, &mut storage)
                .await?
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| req.path.clone());

        let mut out_headers = req.headers.clone();
        headers::apply_header_ops(
            &rr.request.headers,
            &mut out_headers,
            &self.client,
            &self.renderer,
            &tpl,
            &mut storage,
        )
        .await?;

        let mut out_body = req.body.to_vec();
        body::apply_body_override(&self.renderer, &rr.request.body, &mut out_body, &tpl, &mut storage)?;

        if self.test_mode {
            return Ok(rendered_request_response(&req.method, &out_path, &out_headers, &out_body));
        }

        let base = route
            .base_endpoint
            .as_ref()
            .ok_or_else(|| ProxyError::MissingBaseEndpoint {
                path: route.in_path().to_string(),
            })?;

        let url = join_url(base, &out_path, req.query.as_deref());

        tracing::debug!(method = %req.method, url = %url, "proxying upstream");

        let mut send_headers = out_headers;
        strip_hop_by_hop(&mut send_headers);
        send_headers.remove(HOST);
        send_headers.remove(CONTENT_LENGTH);

        let upstream = self
            .client
            .request(req.method.clone(), url)
            .headers(send_headers)
            .body(out_body)
            .send()
            .await
            .map_err(ProxyError::Upstream)?;

        self.rewrite_upstream_response(rr, &tpl, &mut storage, upstream).await
    }

    /// Apply response overrides to an upstream response, branching on
    /// Content-Type: SSE bodies stream through the line transformer, all
    /// other bodies are buffered and rewritten in place.
    async fn rewrite_upstream_response(
        &self,
        rr: &RequestResponse,
        tpl: &Value,
        storage: &mut Storage,
        upstream: reqwest::Response,
    ) -> Result<Response> {
        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if content_type.contains("text/event-stream") {
            // Header rewriting sees no body and a null event.
            let event_input = input::build_event_input(tpl, &headers);

            headers::apply_header_ops(
                &rr.response.headers,
                &mut headers,
                &self.client,
                &self.renderer,
                &event_input,
                storage,
            )
            .await?;

            headers.remove(CONTENT_LENGTH);

            let body = sse::transform(
                upstream,
                rr.response.body.clone(),
                self.renderer.clone(),
                event_input,
            );

            return Ok(build_response(status, headers, body));
        }

        let upstream_body = upstream.bytes().await.map_err(ProxyError::Upstream)?;
        let response_input = input::build_response_input(tpl, &headers, &upstream_body);

        headers::apply_header_ops(
            &rr.response.headers,
            &mut headers,
            &self.client,
            &self.renderer,
            &response_input,
            storage,
        )
        .await?;

        let mut body = upstream_body.to_vec();
        let rewritten =
            body::apply_body_override(&self.renderer, &rr.response.body, &mut body, &response_input, storage)?;

        if rewritten {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            headers.remove(TRANSFER_ENCODING);
        }

        Ok(build_response(status, headers, Body::from(body)))
    }

    /// Synthesize a response locally, with no upstream call.
    async fn headless(
        &self,
        oc: &OverrideConfig,
        tpl: &Value,
        storage: &mut Storage,
    ) -> Result<Response> {
        let status = fetch::evaluate_status_code(&self.renderer, &oc.status_code, tpl);

        let mut headers = HeaderMap::new();
        headers::apply_header_ops(
            &oc.headers,
            &mut headers,
            &self.client,
            &self.renderer,
            tpl,
            storage,
        )
        .await?;

        let mut body = Vec::new();
        if oc.body.has_renderer() {
            if let Some(rendered) =
                self.renderer.render(&oc.body.template, &oc.body.expr, tpl, storage)?
            {
                body = rendered;
            }
        } else if !oc.body.patches.is_empty() {
            // Patches build up from an empty JSON object.
            body::apply_body_override(&self.renderer, &oc.body, &mut body, tpl, storage)?;
        }

        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

        Ok(build_response(status, headers, Body::from(body)))
    }

    /// Rewrite the inbound request per the forward config so it can re-enter
    /// the dispatcher.
    async fn build_forward(
        &self,
        req: &InboundRequest,
        forward: &Forward,
        tpl: &Value,
        storage: &mut Storage,
    ) -> Result<InboundRequest> {
        let path =
            input::render_input(&forward.path, &self.client, &self.renderer, tpl, storage)
                .await?
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ProxyError::EmptyForwardPath {
                    path: req.path.clone(),
                })?;

        let mut headers = req.headers.clone();
        headers::apply_header_ops(
            &forward.headers,
            &mut headers,
            &self.client,
            &self.renderer,
            tpl,
            storage,
        )
        .await?;

        Ok(InboundRequest {
            method: req.method.clone(),
            path,
            query: req.query.clone(),
            headers,
            body: req.body.clone(),
        })
    }
}

/// Test-mode response: the fully rendered request, pretty-printed.
fn rendered_request_response(
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Response {
    let rendered = json!({
        "method": method.as_str(),
        "path": path,
        "headers": input::headers_value(headers),
        "body": input::parse_body(headers, body),
    });

    let text = serde_json::to_string_pretty(&rendered).unwrap_or_default();

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(text.len()));

    build_response(StatusCode::OK, headers, Body::from(text))
}

fn plain_response(status: StatusCode, message: &str) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));

    build_response(status, headers, Body::from(message.to_string()))
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Join the base endpoint's path with the rendered outbound path and carry
/// the inbound query string.
fn join_url(base: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.set_query(query);
    url
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in [
        CONNECTION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
    ] {
        headers.remove(name);
    }
    headers.remove(HeaderName::from_static("keep-alive"));
}
