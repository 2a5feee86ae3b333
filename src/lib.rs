//! Configuration-driven HTTP rewriting reverse proxy.
//!
//! A YAML document declares inbound routes and how each one is answered:
//! forwarded to an upstream origin with the path, headers, and body
//! rewritten; synthesized locally (headless); re-dispatched internally to
//! another route; or streamed from an upstream SSE response with every event
//! rewritten in flight. Transformations are written in two embedded
//! mini-languages — a `{{...}}` template dialect and an expression dialect —
//! sharing one function library with JSON helpers, regex, per-request and
//! per-process storage, and a JWT-aware credential helper.
//!
//! # Architecture
//!
//! ```text
//! Client ──▶ server (axum surface, /healthz, logging)
//!              │
//!              ▼
//!          pipeline::Dispatcher ──▶ routes::RouteTable (compiled at startup)
//!              │                        ▲
//!              │ forward (re-dispatch) ─┘
//!              ├── fetch fan-out (concurrent sub-requests)
//!              ├── headless response
//!              └── upstream proxy ──▶ response rewrite / SSE transformer
//!                        │
//!                        ▼
//!                  render::Renderer (templates + expressions,
//!                  shared function table, permanent storage)
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod render;
pub mod routes;
pub mod server;
pub mod settings;

pub use config::Config;
pub use error::{ProxyError, Result};
pub use pipeline::{Dispatcher, InboundRequest};
pub use render::{RenderError, Renderer, Storage};
pub use routes::{EffectiveRoute, RouteTable};
pub use settings::Settings;
