//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Config (uriGroups + overrides)
//!     → compiler.rs (resolve base endpoints, merge overrides,
//!       detect duplicates)
//!     → RouteTable (immutable, one EffectiveRoute per (in, method))
//!
//! Per request:
//!     RouteTable::lookup(method, path)
//!     → EffectiveRoute + captured path params
//! ```
//!
//! # Design Decisions
//! - Routes compiled once at startup, immutable at runtime
//! - Declaration order is match order; first match wins
//! - Duplicate `(in, method)` registration is a fatal config error

pub mod compiler;
pub mod merge;

pub use compiler::compile;

use http::Method;
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

use crate::config::{Input, RequestResponse};

/// An inbound path pattern with `{param}` capture segments.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param(String),
}

impl PathPattern {
    pub fn parse(path: &str) -> Self {
        let segments = split_segments(path)
            .map(|seg| {
                match seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    Some(name) => Segment::Param(name.to_string()),
                    None => Segment::Literal(seg.to_string()),
                }
            })
            .collect();

        Self {
            raw: path.to_string(),
            segments,
        }
    }

    /// The pattern as written in the config.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Match a concrete request path, returning captured params on success.
    pub fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let segments: Vec<&str> = split_segments(path).collect();
        if segments.len() != self.segments.len() {
            return None;
        }

        let mut params = BTreeMap::new();

        for (pattern, actual) in self.segments.iter().zip(segments) {
            match pattern {
                Segment::Literal(expected) if expected == actual => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), actual.to_string());
                }
            }
        }

        Some(params)
    }
}

fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.trim_matches('/').split('/').filter(|s| !s.is_empty())
}

/// Which methods an effective route serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMethod {
    /// Headless routes serve every method.
    Any,
    Method(Method),
}

impl RouteMethod {
    fn accepts(&self, method: &Method) -> bool {
        match self {
            RouteMethod::Any => true,
            RouteMethod::Method(m) => m == method,
        }
    }

    fn overlaps(&self, other: &RouteMethod) -> bool {
        match (self, other) {
            (RouteMethod::Any, _) | (_, RouteMethod::Any) => true,
            (RouteMethod::Method(a), RouteMethod::Method(b)) => a == b,
        }
    }

    pub fn label(&self) -> String {
        match self {
            RouteMethod::Any => "ANY".to_string(),
            RouteMethod::Method(m) => m.to_string(),
        }
    }
}

/// Merged overrides for one effective route.
///
/// Headless routes serve every method, so they pre-merge each per-method
/// override layer and fall back to the plain global merge.
#[derive(Debug, Clone)]
pub(crate) enum RouteOverrides {
    Single(RequestResponse),
    PerMethod {
        by_method: BTreeMap<String, RequestResponse>,
        fallback: RequestResponse,
    },
}

/// The compiled unit serving one `(in, method)` pair.
#[derive(Debug, Clone)]
pub struct EffectiveRoute {
    pub pattern: PathPattern,
    pub method: RouteMethod,
    pub group: String,
    pub description: String,

    /// Resolved upstream origin. `None` only for headless routes without a
    /// configured base.
    pub base_endpoint: Option<Url>,

    /// Outbound path source. `None` means the route is headless.
    pub out: Option<Input>,

    pub(crate) overrides: RouteOverrides,
}

impl EffectiveRoute {
    pub fn in_path(&self) -> &str {
        self.pattern.raw()
    }

    pub fn is_headless(&self) -> bool {
        self.out.is_none()
    }

    /// The merged override layer for a request method.
    pub fn overrides_for(&self, method: &Method) -> &RequestResponse {
        match &self.overrides {
            RouteOverrides::Single(rr) => rr,
            RouteOverrides::PerMethod { by_method, fallback } => {
                by_method.get(method.as_str()).unwrap_or(fallback)
            }
        }
    }
}

/// Immutable routing table, consulted on every request.
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Arc<EffectiveRoute>>,
}

impl RouteTable {
    pub(crate) fn new(routes: Vec<Arc<EffectiveRoute>>) -> Self {
        Self { routes }
    }

    /// Find the first route accepting this method and path.
    pub fn lookup(
        &self,
        method: &Method,
        path: &str,
    ) -> Option<(Arc<EffectiveRoute>, BTreeMap<String, String>)> {
        for route in &self.routes {
            if !route.method.accepts(method) {
                continue;
            }
            if let Some(params) = route.pattern.matches(path) {
                return Some((route.clone(), params));
            }
        }
        None
    }

    /// All compiled routes, in declaration order.
    pub fn routes(&self) -> &[Arc<EffectiveRoute>] {
        &self.routes
    }
}
