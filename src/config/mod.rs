//! Configuration subsystem.
//!
//! # Data Flow
//! ```text
//! YAML file or base64 blob
//!     → loader.rs (decode & deserialize)
//!     → Config (typed, immutable)
//!     → routes::compile (merged + validated route table)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; there is no hot reload
//! - All fields default so minimal configs stay minimal
//! - Semantic validation (duplicate routes, base endpoint resolution)
//!   happens in the route compiler, not here

pub mod loader;
pub mod schema;

pub use loader::{from_base64, from_bytes, load};
pub use schema::{
    Body, Config, Fetch, FetchRequest, Forward, Header, HeaderOp, Input, OutMethod,
    OverrideConfig, Overrides, Patch, RequestResponse, SourceRequest, SourceResponse,
    StatusCodeInput, UriGroup, UriMap,
};
