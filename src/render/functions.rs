//! Shared function library for both renderer dialects.
//!
//! Each dialect exposes a subset of the table under its own names
//! ([`resolve`]); the implementations are shared and operate on
//! `serde_json::Value` uniformly.

use chrono::format::{Item, StrftimeItems};
use chrono::Local;
use regex::Regex;
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{stringify, RenderError, Renderer, Storage};

/// Which mini-language is calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Template,
    Expr,
}

/// State threaded through every function call.
pub(crate) struct CallCtx<'a> {
    pub renderer: &'a Renderer,
    pub storage: &'a mut Storage,
}

/// Map a dialect-facing name to the canonical function it invokes.
/// Returns `None` for names the dialect does not expose.
pub(crate) fn resolve(dialect: Dialect, name: &str) -> Option<&'static str> {
    use Dialect::{Expr, Template};

    let canonical = match (dialect, name) {
        (Template, "toJson") => "toJson",
        (Expr, "toCompactJson") => "toCompactJson",
        (Template, "safeEncode") | (Expr, "safeEncode") => "safeEncode",
        (Template, "getType") | (Expr, "type") => "type",
        (Expr, "has") => "has",
        (Template, "normalize") => "normalize",
        (Template, "trim") | (Expr, "trimStr") => "trim",
        (_, "timestamp") => "timestamp",
        (_, "formattedTimestamp") => "formattedTimestamp",
        (Template, "set") | (Expr, "setToStorage") => "set",
        (Template, "get") | (Expr, "getFromStorage") => "get",
        (Template, "sum") => "sum",
        (Template, "subtract") => "subtract",
        (_, "regexFind") => "regexFind",
        (Expr, "regexReplace") => "regexReplace",
        (Expr, "filterOutKeys") => "filterOutKeys",
        (Expr, "merge") => "merge",
        (Expr, "getIndex") => "getIndex",
        (_, "slauthtoken") => "slauthtoken",
        _ => return None,
    };

    Some(canonical)
}

/// Invoke a canonical function.
pub(crate) fn invoke(
    name: &str,
    ctx: &mut CallCtx<'_>,
    args: &[Value],
) -> Result<Value, RenderError> {
    match name {
        "toJson" | "toCompactJson" => {
            expect_args(name, args, 1, "input")?;
            let encoded = serde_json::to_string(&args[0])
                .map_err(|e| func_err(name, format!("json marshal error: {e}")))?;
            Ok(Value::String(encoded))
        }

        "safeEncode" => {
            expect_args(name, args, 1, "input")?;
            let encoded = serde_json::to_string(&args[0])
                .map_err(|e| func_err(name, format!("json marshal error: {e}")))?;
            let safe = encoded.strip_prefix('"').unwrap_or(&encoded);
            let safe = safe.strip_suffix('"').unwrap_or(safe);
            Ok(Value::String(safe.to_string()))
        }

        "type" => {
            expect_args(name, args, 1, "value")?;
            Ok(Value::String(kind(&args[0]).to_string()))
        }

        "has" => {
            expect_args(name, args, 2, "obj, key")?;
            let key = stringify(&args[1]);
            let found = match &args[0] {
                Value::Object(map) => map.contains_key(&key),
                _ => false,
            };
            Ok(Value::Bool(found))
        }

        "normalize" => {
            expect_args(name, args, 3, "str, prefix, suffix")?;
            let (s, prefix, suffix) = three_strings(args);
            let trimmed = trim_affixes(&s, &prefix, &suffix);
            Ok(Value::String(format!("{prefix}{trimmed}{suffix}")))
        }

        "trim" => {
            expect_args(name, args, 3, "str, prefix, suffix")?;
            let (s, prefix, suffix) = three_strings(args);
            Ok(Value::String(trim_affixes(&s, &prefix, &suffix)))
        }

        "timestamp" => {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            Ok(Value::String(secs.to_string()))
        }

        "formattedTimestamp" => {
            expect_args(name, args, 1, "layout")?;
            let layout = stringify(&args[0]);
            let items: Vec<Item> = StrftimeItems::new(&layout).collect();
            if items.iter().any(|item| matches!(item, Item::Error)) {
                return Err(func_err(name, format!("invalid layout '{layout}'")));
            }
            Ok(Value::String(
                Local::now().format_with_items(items.iter()).to_string(),
            ))
        }

        "set" => {
            expect_args(name, args, 2, "key, value")?;
            let key = stringify(&args[0]);
            ctx.storage.insert(key, stringify(&args[1]));
            Ok(Value::String(String::new()))
        }

        "get" => {
            expect_args(name, args, 1, "key")?;
            let key = stringify(&args[0]);
            Ok(Value::String(ctx.storage.get(&key).cloned().unwrap_or_default()))
        }

        "sum" => {
            let mut total = 0i64;
            for arg in args {
                // An empty string (e.g. a storage key not yet set) counts as zero.
                if matches!(arg, Value::String(s) if s.trim().is_empty()) {
                    continue;
                }
                total += as_int(arg)
                    .ok_or_else(|| func_err(name, format!("not an integer: {}", stringify(arg))))?;
            }
            Ok(Value::String(total.to_string()))
        }

        "subtract" => {
            expect_args(name, args, 2, "a, b")?;
            let a = as_int(&args[0])
                .ok_or_else(|| func_err(name, format!("not an integer: {}", stringify(&args[0]))))?;
            let b = as_int(&args[1])
                .ok_or_else(|| func_err(name, format!("not an integer: {}", stringify(&args[1]))))?;
            Ok(Value::from(a - b))
        }

        "regexFind" => {
            expect_args(name, args, 2, "pattern, string")?;
            let pattern = stringify(&args[0]);
            let re = Regex::new(&pattern).map_err(|e| func_err(name, e.to_string()))?;
            // Only a single capture group is expected.
            let found = re
                .captures(&stringify(&args[1]))
                .and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
                .unwrap_or_default();
            Ok(Value::String(found))
        }

        "regexReplace" => {
            expect_args(name, args, 3, "pattern, replacement, string")?;
            let pattern = stringify(&args[0]);
            let re = Regex::new(&pattern).map_err(|e| func_err(name, e.to_string()))?;
            let replaced = re
                .replace_all(&stringify(&args[2]), stringify(&args[1]).as_str())
                .into_owned();
            Ok(Value::String(replaced))
        }

        "filterOutKeys" => {
            expect_args(name, args, 2, "map, keys")?;
            let Value::Object(map) = &args[0] else {
                return Err(func_err(name, "first argument must be a map"));
            };
            let Value::Array(keys) = &args[1] else {
                return Err(func_err(name, "second argument must be a list of keys"));
            };

            let drop: Vec<String> = keys.iter().map(stringify).collect();
            let filtered: Map<String, Value> = map
                .iter()
                .filter(|(k, _)| !drop.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Ok(Value::Object(filtered))
        }

        "merge" => {
            let mut merged = Map::new();
            for arg in args {
                let Value::Object(map) = arg else {
                    return Err(func_err(name, "arguments must be maps"));
                };
                for (key, value) in map {
                    if merged.contains_key(key) {
                        return Err(func_err(name, format!("duplicate keys {key} found")));
                    }
                    merged.insert(key.clone(), value.clone());
                }
            }
            Ok(Value::Object(merged))
        }

        "getIndex" => {
            expect_args(name, args, 2, "array, index")?;
            if args[0].is_null() {
                return Ok(Value::Null);
            }
            let Value::Array(arr) = &args[0] else {
                return Err(func_err(name, "first argument must be an array"));
            };
            let Some(index) = as_int(&args[1]) else {
                return Err(func_err(name, "index must be an integer"));
            };
            if index < 0 || index as usize >= arr.len() {
                return Ok(Value::Null);
            }
            Ok(arr[index as usize].clone())
        }

        "slauthtoken" => {
            expect_args(name, args, 3, "groups, audience, environment")?;
            let groups = stringify(&args[0]);
            let audience = stringify(&args[1]);
            let environment = stringify(&args[2]);
            let token = ctx.renderer.slauth_token(&groups, &audience, &environment)?;
            Ok(Value::String(token))
        }

        other => Err(func_err(other, "function not defined")),
    }
}

fn expect_args(
    name: &str,
    args: &[Value],
    count: usize,
    shape: &str,
) -> Result<(), RenderError> {
    if args.len() != count {
        let plural = if count == 1 { "argument" } else { "arguments" };
        return Err(func_err(name, format!("expects {count} {plural} ({shape})")));
    }
    Ok(())
}

fn func_err(name: &str, message: impl Into<String>) -> RenderError {
    RenderError::Function {
        name: name.to_string(),
        message: message.into(),
    }
}

fn three_strings(args: &[Value]) -> (String, String, String) {
    (stringify(&args[0]), stringify(&args[1]), stringify(&args[2]))
}

fn trim_affixes(s: &str, prefix: &str, suffix: &str) -> String {
    let s = s.strip_prefix(prefix).unwrap_or(s);
    s.strip_suffix(suffix).unwrap_or(s).to_string()
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float64",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "slice",
        Value::Object(_) => "map",
    }
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: &[Value]) -> Result<Value, RenderError> {
        let renderer = Renderer::new();
        let mut storage = Storage::new();
        let mut ctx = CallCtx {
            renderer: &renderer,
            storage: &mut storage,
        };
        invoke(name, &mut ctx, args)
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = call("normalize", &[json!("claude-v1"), json!("anthropic."), json!("-v2")])
            .unwrap();
        let twice = call("normalize", &[once.clone(), json!("anthropic."), json!("-v2")]).unwrap();
        assert_eq!(once, json!("anthropic.claude-v1-v2"));
        assert_eq!(once, twice);
    }

    #[test]
    fn trim_with_empty_affixes_is_identity() {
        let out = call("trim", &[json!("abc"), json!(""), json!("")]).unwrap();
        assert_eq!(out, json!("abc"));
    }

    #[test]
    fn trim_strips_prefix_and_suffix() {
        let out = call("trim", &[json!("pre-mid-post"), json!("pre-"), json!("-post")]).unwrap();
        assert_eq!(out, json!("mid"));
    }

    #[test]
    fn safe_encode_strips_outer_quotes() {
        assert_eq!(call("safeEncode", &[json!("a\"b")]).unwrap(), json!("a\\\"b"));
        assert_eq!(call("safeEncode", &[json!(7)]).unwrap(), json!("7"));
    }

    #[test]
    fn get_index_bounds() {
        let arr = json!([1, 2, 3]);
        assert_eq!(call("getIndex", &[arr.clone(), json!(-1)]).unwrap(), Value::Null);
        assert_eq!(call("getIndex", &[arr.clone(), json!(3)]).unwrap(), Value::Null);
        assert_eq!(call("getIndex", &[arr, json!(1)]).unwrap(), json!(2));
        assert_eq!(call("getIndex", &[Value::Null, json!(0)]).unwrap(), Value::Null);
    }

    #[test]
    fn merge_rejects_duplicates() {
        let err = call("merge", &[json!({"a": 1}), json!({"a": 2})]).unwrap_err();
        assert!(err.to_string().contains("duplicate keys a"));

        let merged = call("merge", &[json!({"a": 1}), json!({"b": 2})]).unwrap();
        assert_eq!(merged, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn filter_out_keys() {
        let out = call(
            "filterOutKeys",
            &[json!({"a": 1, "b": 2, "c": 3}), json!(["a", "c"])],
        )
        .unwrap();
        assert_eq!(out, json!({"b": 2}));
    }

    #[test]
    fn sum_and_subtract() {
        assert_eq!(call("sum", &[json!(1), json!("2"), json!(3)]).unwrap(), json!("6"));
        assert_eq!(call("subtract", &[json!(5), json!(2)]).unwrap(), json!(3));
        assert!(call("sum", &[json!("nope")]).is_err());
    }

    #[test]
    fn regex_find_first_capture_group() {
        let out = call("regexFind", &[json!(r"model-(\w+)"), json!("model-opus rest")]).unwrap();
        assert_eq!(out, json!("opus"));

        let none = call("regexFind", &[json!(r"(\d+)"), json!("letters")]).unwrap();
        assert_eq!(none, json!(""));
    }

    #[test]
    fn regex_replace() {
        let out = call(
            "regexReplace",
            &[json!(r"v(\d)"), json!("version-$1"), json!("v1 and v2")],
        )
        .unwrap();
        assert_eq!(out, json!("version-1 and version-2"));
    }

    #[test]
    fn storage_round_trip() {
        let renderer = Renderer::new();
        let mut storage = Storage::new();
        let mut ctx = CallCtx {
            renderer: &renderer,
            storage: &mut storage,
        };

        let out = invoke("set", &mut ctx, &[json!("count"), json!(42)]).unwrap();
        assert_eq!(out, json!(""));
        assert_eq!(invoke("get", &mut ctx, &[json!("count")]).unwrap(), json!("42"));
        assert_eq!(invoke("get", &mut ctx, &[json!("absent")]).unwrap(), json!(""));
    }

    #[test]
    fn type_kinds() {
        assert_eq!(call("type", &[json!("s")]).unwrap(), json!("string"));
        assert_eq!(call("type", &[json!({})]).unwrap(), json!("map"));
        assert_eq!(call("type", &[json!([])]).unwrap(), json!("slice"));
        assert_eq!(call("type", &[json!(1.5)]).unwrap(), json!("float64"));
        assert_eq!(call("type", &[json!(1)]).unwrap(), json!("int"));
    }

    #[test]
    fn has_membership() {
        assert_eq!(call("has", &[json!({"k": 1}), json!("k")]).unwrap(), json!(true));
        assert_eq!(call("has", &[json!({"k": 1}), json!("x")]).unwrap(), json!(false));
        assert_eq!(call("has", &[Value::Null, json!("k")]).unwrap(), json!(false));
    }

    #[test]
    fn dialect_visibility() {
        assert_eq!(resolve(Dialect::Template, "toJson"), Some("toJson"));
        assert!(resolve(Dialect::Expr, "toJson").is_none());
        assert_eq!(resolve(Dialect::Expr, "trimStr"), Some("trim"));
        assert!(resolve(Dialect::Template, "trimStr").is_none());
        assert_eq!(resolve(Dialect::Expr, "setToStorage"), Some("set"));
        assert!(resolve(Dialect::Template, "merge").is_none());
    }
}
