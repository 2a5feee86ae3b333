//! Dual-language renderer.
//!
//! # Data Flow
//! ```text
//! (template, expr, input, storage)
//!     → expr non-empty?  → expr.rs (compile + evaluate)
//!     → template non-empty? → template.rs (parse + execute)
//!     → neither → None (no rewrite)
//! ```
//!
//! # Design Decisions
//! - The expression wins whenever both languages are present on a field
//! - One shared function table (functions.rs); each dialect adapts the
//!   calling convention
//! - `permanent_storage` is the only process-wide mutable state, guarded by
//!   a read/write lock; callers own the per-invocation temporary storage

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

mod credential;
mod expr;
mod functions;
mod template;

pub use functions::Dialect;

/// Per-invocation key/value storage. One map per render pass, or one per SSE
/// stream so event handlers can accumulate state across lines.
pub type Storage = HashMap<String, String>;

/// Errors from template or expression evaluation.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("template parse error: {0}")]
    TemplateParse(String),

    #[error("template execute error: {0}")]
    TemplateExec(String),

    #[error("expr compile error: {0}")]
    ExprParse(String),

    #[error("expr run error: {0}")]
    ExprEval(String),

    #[error("{name}: {message}")]
    Function { name: String, message: String },

    #[error("atlas slauth token failed: {0}")]
    Credential(String),
}

/// Unified evaluator for template strings and expressions.
///
/// Constructed once at startup and shared by reference across all requests.
#[derive(Debug)]
pub struct Renderer {
    /// Storage which lasts for the lifetime of the proxy.
    permanent_storage: RwLock<HashMap<String, String>>,

    /// Path of the credential CLI. Overridable so tests can stub it.
    credential_command: PathBuf,
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            permanent_storage: RwLock::new(HashMap::new()),
            credential_command: PathBuf::from(credential::DEFAULT_COMMAND),
        }
    }

    /// Use a different credential CLI binary.
    pub fn with_credential_command(mut self, path: impl Into<PathBuf>) -> Self {
        self.credential_command = path.into();
        self
    }

    /// Render content using either the expression or the template, whichever
    /// is provided. The expression takes priority if both are. Returns
    /// `None` if neither is provided, signalling "no rewrite".
    pub fn render(
        &self,
        template_str: &str,
        expr_str: &str,
        input: &Value,
        storage: &mut Storage,
    ) -> Result<Option<Vec<u8>>, RenderError> {
        if !expr_str.trim().is_empty() {
            return self.render_expr(expr_str, input, storage).map(Some);
        }

        if !template_str.trim().is_empty() {
            return self.render_template(template_str, input, storage).map(Some);
        }

        Ok(None)
    }

    /// Execute a template string against the input.
    pub fn render_template(
        &self,
        template_str: &str,
        input: &Value,
        storage: &mut Storage,
    ) -> Result<Vec<u8>, RenderError> {
        let tmpl = template::Template::parse(template_str)?;
        let out = tmpl.execute(self, input, storage)?;
        Ok(out.into_bytes())
    }

    /// Evaluate an expression and stringify the resulting value.
    pub fn render_expr(
        &self,
        expr_str: &str,
        input: &Value,
        storage: &mut Storage,
    ) -> Result<Vec<u8>, RenderError> {
        let value = self.eval_expr(expr_str, input, storage)?;
        Ok(stringify(&value).into_bytes())
    }

    /// Evaluate an expression to its raw value.
    pub fn eval_expr(
        &self,
        expr_str: &str,
        input: &Value,
        storage: &mut Storage,
    ) -> Result<Value, RenderError> {
        let program = expr::Program::compile(expr_str)?;
        program.run(self, input, storage)
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a value to its textual rendering: scalars bare, containers as
/// compact JSON, null as the empty string.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Truthiness: false, 0, "", null, and empty containers are false.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(m) => !m.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expr_takes_priority_over_template() {
        let renderer = Renderer::new();
        let mut storage = Storage::new();

        let out = renderer
            .render("literal {{ .path }}", "path", &json!({"path": "/x"}), &mut storage)
            .unwrap()
            .unwrap();

        assert_eq!(out, b"/x");
    }

    #[test]
    fn neither_language_means_no_rewrite() {
        let renderer = Renderer::new();
        let mut storage = Storage::new();

        let out = renderer
            .render("  ", "", &json!({}), &mut storage)
            .unwrap();

        assert!(out.is_none());
    }

    #[test]
    fn stringify_forms() {
        assert_eq!(stringify(&json!(null)), "");
        assert_eq!(stringify(&json!(true)), "true");
        assert_eq!(stringify(&json!(3)), "3");
        assert_eq!(stringify(&json!("s")), "s");
        assert_eq!(stringify(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!(1.5)));
        assert!(truthy(&json!({"k": 0})));
    }
}
