//! Configuration schema definitions.
//!
//! This module defines the complete declarative proxy specification.
//! All types derive Serde traits for deserialization from YAML, with the
//! camelCase key names the config files use.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Default upstream origin. The value is itself evaluated as an
    /// expression against `{settings}` once at startup, so configs can
    /// derive the origin from user variables.
    pub base_endpoint: String,

    /// Ordered groups of inbound route declarations.
    pub uri_groups: Vec<UriGroup>,

    /// Global and per-route transformation overrides.
    pub overrides: Overrides,
}

/// A named collection of inbound routes.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct UriGroup {
    pub name: String,

    /// Hidden groups are omitted from UI listings. Routing is unaffected.
    pub hidden: bool,

    pub supported_uris: Vec<UriMap>,
}

/// One inbound path and its outbound mappings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct UriMap {
    /// Inbound path pattern. Segments wrapped in `{}` capture path params.
    #[serde(rename = "in")]
    pub in_path: String,

    pub description: String,

    /// Outbound mappings per method. Empty means the route is headless for
    /// every method.
    pub out: Vec<OutMethod>,

    /// Per-route upstream origin, overriding the global base endpoint.
    pub base_endpoint: String,
}

/// Pairs an HTTP method with the outbound path source.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct OutMethod {
    pub method: String,

    #[serde(flatten)]
    pub input: Input,
}

/// The universal value source: exactly one of the fields is expected to be
/// set.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Input {
    /// Literal text.
    pub text: String,

    /// Template string rendered against the request's template input.
    pub template: String,

    /// Expression evaluated against the request's template input.
    pub expr: String,

    /// Path of a file read at request time.
    pub file: String,

    /// An HTTP call whose JSON response supplies the value.
    pub request: SourceRequest,
}

impl Input {
    /// True if no value source is set.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
            && self.template.is_empty()
            && self.expr.is_empty()
            && self.file.is_empty()
            && self.request.url.is_empty()
    }
}

/// An HTTP request embedded as a value source.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceRequest {
    pub method: String,
    pub url: String,
    pub response: SourceResponse,

    /// Optional JSON request body sent with `Content-Type: application/json`.
    pub json_body: String,
}

/// Where to find the value inside the source request's JSON response.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceResponse {
    /// Slash-separated path to a string value, e.g. `data/token`.
    pub result_path: String,
}

/// Header operation kind.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HeaderOp {
    #[default]
    Add,
    Remove,
}

/// One header operation. Operations apply in declared order.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Header {
    pub op: HeaderOp,

    /// Header name. `remove` with an empty name clears all headers except
    /// `Content-Length`.
    pub name: String,

    #[serde(flatten)]
    pub input: Input,
}

/// Body override: template/expr replacement or an ordered patch list.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Body {
    /// RFC 6902 operations applied to the existing JSON body.
    pub patches: Vec<Patch>,

    pub text: String,
    pub template: String,
    pub expr: String,
}

impl Body {
    /// True if the override would replace the body wholesale.
    pub fn has_renderer(&self) -> bool {
        !self.template.trim().is_empty() || !self.expr.trim().is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
            && self.text.is_empty()
            && self.template.is_empty()
            && self.expr.is_empty()
    }
}

/// A single RFC 6902 patch operation.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Patch {
    pub op: String,
    pub path: String,

    /// Omitted when null so `remove`/`copy` ops serialize cleanly.
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub value: serde_json::Value,
}

/// Status code source: a literal or an expression. The expression wins when
/// both are set; neither means 200.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct StatusCodeInput {
    pub int: u16,
    pub expr: String,
}

/// Global and per-route overrides.
///
/// `uris` is keyed by inbound path, then by HTTP method.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Overrides {
    pub global: RequestResponse,
    pub uris: BTreeMap<String, BTreeMap<String, RequestResponse>>,
}

/// The override payload for one route (or the global layer).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct RequestResponse {
    /// Internal re-dispatch to another inbound route.
    pub forward: Option<Forward>,

    /// Named sub-requests fanned out before rendering.
    pub fetch: Option<Fetch>,

    pub request: OverrideConfig,
    pub response: OverrideConfig,
}

/// Transformations for one side of the exchange.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct OverrideConfig {
    /// Only used for headless responses; proxied responses keep the
    /// upstream status code.
    pub status_code: StatusCodeInput,

    pub headers: Vec<Header>,
    pub body: Body,
}

/// Internal re-dispatch: rewrite the inbound path and re-enter the router.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Forward {
    pub path: Input,
    pub headers: Vec<Header>,
}

/// A named set of sub-requests run concurrently; results are exposed to the
/// renderer under `requests.<name>`.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Fetch {
    pub requests: BTreeMap<String, FetchRequest>,
}

/// A single fetch sub-request.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct FetchRequest {
    pub method: String,
    pub url: Input,
    pub headers: Vec<Header>,
    pub body: Input,

    /// Duration string such as `500ms` or `30s`. Defaults to 30s.
    pub timeout: String,
}
