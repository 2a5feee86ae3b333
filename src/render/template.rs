//! The `{{...}}` template dialect.
//!
//! Literal text interleaved with actions. An action holds a pipeline:
//! commands separated by `|`, where each command is a function call with
//! space-separated operands or a single value. Operands are dot-paths into
//! the input (`.body.model`, `.` for the whole input), string / number /
//! bool / nil literals, niladic function names, or parenthesized sub-calls.
//! `{{if}}/{{else}}/{{end}}` branches on the usual truthiness rules.

use serde_json::{Number, Value};

use super::functions::{self, CallCtx, Dialect};
use super::{stringify, truthy, RenderError, Renderer, Storage};

#[derive(Debug)]
pub(crate) struct Template {
    nodes: Vec<Node>,
}

#[derive(Debug)]
enum Node {
    Text(String),
    Action(Pipeline),
    If {
        cond: Pipeline,
        then_nodes: Vec<Node>,
        else_nodes: Vec<Node>,
    },
}

#[derive(Debug)]
struct Pipeline {
    cmds: Vec<Command>,
}

#[derive(Debug)]
struct Command {
    ops: Vec<Operand>,
}

#[derive(Debug)]
enum Operand {
    Dot,
    Path(Vec<String>),
    Func(String),
    Str(String),
    Num(Number),
    Bool(bool),
    Nil,
    Paren(Box<Command>),
}

/// Builtins every Go-style template carries, on top of the shared library.
const BUILTINS: [&str; 12] = [
    "eq", "ne", "lt", "le", "gt", "ge", "and", "or", "not", "len", "index", "print",
];

impl Template {
    pub fn parse(src: &str) -> Result<Template, RenderError> {
        let chunks = split_chunks(src)?;
        let mut iter = chunks.into_iter().peekable();
        let (nodes, terminator) = parse_nodes(&mut iter, false)?;

        match terminator {
            Terminator::Eof => Ok(Template { nodes }),
            Terminator::Else | Terminator::End => {
                Err(RenderError::TemplateParse("unexpected {{end}} or {{else}}".into()))
            }
        }
    }

    pub fn execute(
        &self,
        renderer: &Renderer,
        input: &Value,
        storage: &mut Storage,
    ) -> Result<String, RenderError> {
        let mut ctx = CallCtx { renderer, storage };
        let mut out = String::new();
        execute_nodes(&self.nodes, &mut ctx, input, &mut out)?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

enum Chunk {
    Text(String),
    Action(String),
}

enum Terminator {
    Eof,
    Else,
    End,
}

/// Split the source into literal text and `{{ ... }}` action bodies.
/// Quoted strings inside actions may contain `}}`.
fn split_chunks(src: &str) -> Result<Vec<Chunk>, RenderError> {
    let mut chunks = Vec::new();
    let mut rest = src;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            chunks.push(Chunk::Text(rest[..start].to_string()));
        }

        let body = &rest[start + 2..];
        let end = find_action_end(body)
            .ok_or_else(|| RenderError::TemplateParse("unclosed action".into()))?;

        chunks.push(Chunk::Action(body[..end].to_string()));
        rest = &body[end + 2..];
    }

    if !rest.is_empty() {
        chunks.push(Chunk::Text(rest.to_string()));
    }

    Ok(chunks)
}

fn find_action_end(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'}' if bytes.get(i + 1) == Some(&b'}') => return Some(i),
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'`' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'`' {
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    None
}

fn parse_nodes(
    iter: &mut std::iter::Peekable<std::vec::IntoIter<Chunk>>,
    in_branch: bool,
) -> Result<(Vec<Node>, Terminator), RenderError> {
    let mut nodes = Vec::new();

    while let Some(chunk) = iter.next() {
        match chunk {
            Chunk::Text(text) => nodes.push(Node::Text(text)),
            Chunk::Action(body) => {
                let body = body.trim();

                if body == "end" {
                    if !in_branch {
                        return Err(RenderError::TemplateParse("unexpected {{end}}".into()));
                    }
                    return Ok((nodes, Terminator::End));
                }

                if body == "else" {
                    if !in_branch {
                        return Err(RenderError::TemplateParse("unexpected {{else}}".into()));
                    }
                    return Ok((nodes, Terminator::Else));
                }

                if let Some(cond_src) = body.strip_prefix("if ") {
                    let cond = parse_pipeline(cond_src)?;
                    let (then_nodes, term) = parse_nodes(iter, true)?;

                    let (else_nodes, term) = match term {
                        Terminator::Else => parse_nodes(iter, true)?,
                        other => (Vec::new(), other),
                    };

                    match term {
                        Terminator::End => nodes.push(Node::If {
                            cond,
                            then_nodes,
                            else_nodes,
                        }),
                        _ => {
                            return Err(RenderError::TemplateParse(
                                "missing {{end}} for {{if}}".into(),
                            ))
                        }
                    }
                    continue;
                }

                nodes.push(Node::Action(parse_pipeline(body)?));
            }
        }
    }

    if in_branch {
        return Err(RenderError::TemplateParse("missing {{end}} for {{if}}".into()));
    }

    Ok((nodes, Terminator::Eof))
}

fn parse_pipeline(src: &str) -> Result<Pipeline, RenderError> {
    let mut tokens = tokenize(src)?.into_iter().peekable();
    let pipeline = parse_pipeline_tokens(&mut tokens)?;

    if tokens.peek().is_some() {
        return Err(RenderError::TemplateParse(format!("unexpected token in '{src}'")));
    }

    Ok(pipeline)
}

#[derive(Debug, PartialEq)]
enum Token {
    Pipe,
    LParen,
    RParen,
    Dot,
    Path(Vec<String>),
    Ident(String),
    Str(String),
    Num(Number),
}

fn tokenize(src: &str) -> Result<Vec<Token>, RenderError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        match c {
            c if c.is_whitespace() => i += 1,
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' => {
                let (s, next) = lex_quoted(&chars, i + 1)?;
                tokens.push(Token::Str(s));
                i = next;
            }
            '`' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&c| c == '`')
                    .ok_or_else(|| RenderError::TemplateParse("unterminated raw string".into()))?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '.' => {
                let mut segments = Vec::new();
                while i < chars.len() && chars[i] == '.' {
                    i += 1;
                    let start = i;
                    while i < chars.len() && is_ident_char(chars[i]) {
                        i += 1;
                    }
                    if i == start {
                        break;
                    }
                    segments.push(chars[start..i].iter().collect());
                }
                if segments.is_empty() {
                    tokens.push(Token::Dot);
                } else {
                    tokens.push(Token::Path(segments));
                }
            }
            '-' | '0'..='9' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = parse_number(&text)
                    .ok_or_else(|| RenderError::TemplateParse(format!("bad number '{text}'")))?;
                tokens.push(Token::Num(num));
            }
            c if is_ident_start(c) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(RenderError::TemplateParse(format!(
                    "unexpected character '{other}'"
                )))
            }
        }
    }

    Ok(tokens)
}

fn lex_quoted(chars: &[char], mut i: usize) -> Result<(String, usize), RenderError> {
    let mut out = String::new();

    while i < chars.len() {
        match chars[i] {
            '"' => return Ok((out, i + 1)),
            '\\' => {
                i += 1;
                let escaped = chars
                    .get(i)
                    .ok_or_else(|| RenderError::TemplateParse("unterminated string".into()))?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => *other,
                });
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    Err(RenderError::TemplateParse("unterminated string".into()))
}

fn parse_number(text: &str) -> Option<Number> {
    if let Ok(n) = text.parse::<i64>() {
        return Some(Number::from(n));
    }
    text.parse::<f64>().ok().and_then(Number::from_f64)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

type Tokens = std::iter::Peekable<std::vec::IntoIter<Token>>;

fn parse_pipeline_tokens(tokens: &mut Tokens) -> Result<Pipeline, RenderError> {
    let mut cmds = vec![parse_command(tokens)?];

    while matches!(tokens.peek(), Some(Token::Pipe)) {
        tokens.next();
        cmds.push(parse_command(tokens)?);
    }

    Ok(Pipeline { cmds })
}

fn parse_command(tokens: &mut Tokens) -> Result<Command, RenderError> {
    let mut ops = Vec::new();

    loop {
        match tokens.peek() {
            None | Some(Token::Pipe) | Some(Token::RParen) => break,
            _ => {}
        }

        let op = match tokens.next().expect("peeked") {
            Token::Dot => Operand::Dot,
            Token::Path(segments) => Operand::Path(segments),
            Token::Str(s) => Operand::Str(s),
            Token::Num(n) => Operand::Num(n),
            Token::Ident(name) => match name.as_str() {
                "true" => Operand::Bool(true),
                "false" => Operand::Bool(false),
                "nil" => Operand::Nil,
                _ => {
                    if !is_known_function(&name) {
                        return Err(RenderError::TemplateParse(format!(
                            "function \"{name}\" not defined"
                        )));
                    }
                    Operand::Func(name)
                }
            },
            Token::LParen => {
                let inner = parse_command(tokens)?;
                match tokens.next() {
                    Some(Token::RParen) => Operand::Paren(Box::new(inner)),
                    _ => return Err(RenderError::TemplateParse("missing ')'".into())),
                }
            }
            Token::Pipe | Token::RParen => unreachable!("handled by peek"),
        };

        ops.push(op);
    }

    if ops.is_empty() {
        return Err(RenderError::TemplateParse("empty command".into()));
    }

    Ok(Command { ops })
}

fn is_known_function(name: &str) -> bool {
    BUILTINS.contains(&name) || functions::resolve(Dialect::Template, name).is_some()
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

fn execute_nodes(
    nodes: &[Node],
    ctx: &mut CallCtx<'_>,
    input: &Value,
    out: &mut String,
) -> Result<(), RenderError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Action(pipeline) => {
                let value = eval_pipeline(pipeline, ctx, input)?;
                out.push_str(&stringify(&value));
            }
            Node::If {
                cond,
                then_nodes,
                else_nodes,
            } => {
                let branch = if truthy(&eval_pipeline(cond, ctx, input)?) {
                    then_nodes
                } else {
                    else_nodes
                };
                execute_nodes(branch, ctx, input, out)?;
            }
        }
    }

    Ok(())
}

fn eval_pipeline(
    pipeline: &Pipeline,
    ctx: &mut CallCtx<'_>,
    input: &Value,
) -> Result<Value, RenderError> {
    let mut value = eval_command(&pipeline.cmds[0], ctx, input, None)?;

    for cmd in &pipeline.cmds[1..] {
        value = eval_command(cmd, ctx, input, Some(value))?;
    }

    Ok(value)
}

fn eval_command(
    cmd: &Command,
    ctx: &mut CallCtx<'_>,
    input: &Value,
    piped: Option<Value>,
) -> Result<Value, RenderError> {
    if let Operand::Func(name) = &cmd.ops[0] {
        let mut args = Vec::with_capacity(cmd.ops.len());
        for op in &cmd.ops[1..] {
            args.push(eval_operand(op, ctx, input)?);
        }
        if let Some(piped) = piped {
            args.push(piped);
        }
        return call_function(name, ctx, &args);
    }

    if cmd.ops.len() > 1 {
        return Err(RenderError::TemplateExec(
            "can't give an argument to a non-function".into(),
        ));
    }
    if piped.is_some() {
        return Err(RenderError::TemplateExec("expected a function after '|'".into()));
    }

    eval_operand(&cmd.ops[0], ctx, input)
}

fn eval_operand(
    op: &Operand,
    ctx: &mut CallCtx<'_>,
    input: &Value,
) -> Result<Value, RenderError> {
    Ok(match op {
        Operand::Dot => input.clone(),
        Operand::Path(segments) => walk_path(input, segments),
        Operand::Func(name) => call_function(name, ctx, &[])?,
        Operand::Str(s) => Value::String(s.clone()),
        Operand::Num(n) => Value::Number(n.clone()),
        Operand::Bool(b) => Value::Bool(*b),
        Operand::Nil => Value::Null,
        Operand::Paren(inner) => eval_command(inner, ctx, input, None)?,
    })
}

fn walk_path(input: &Value, segments: &[String]) -> Value {
    let mut current = input;

    for segment in segments {
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => current = next,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }

    current.clone()
}

fn call_function(
    name: &str,
    ctx: &mut CallCtx<'_>,
    args: &[Value],
) -> Result<Value, RenderError> {
    if BUILTINS.contains(&name) {
        return call_builtin(name, args);
    }

    match functions::resolve(Dialect::Template, name) {
        Some(canonical) => functions::invoke(canonical, ctx, args),
        None => Err(RenderError::TemplateExec(format!(
            "function \"{name}\" not defined"
        ))),
    }
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, RenderError> {
    let exec_err = |msg: String| RenderError::TemplateExec(msg);

    match name {
        "eq" => {
            if args.len() < 2 {
                return Err(exec_err("eq expects at least 2 arguments".into()));
            }
            Ok(Value::Bool(args[1..].iter().any(|v| loose_eq(&args[0], v))))
        }
        "ne" => {
            if args.len() != 2 {
                return Err(exec_err("ne expects 2 arguments".into()));
            }
            Ok(Value::Bool(!loose_eq(&args[0], &args[1])))
        }
        "lt" | "le" | "gt" | "ge" => {
            if args.len() != 2 {
                return Err(exec_err(format!("{name} expects 2 arguments")));
            }
            let ord = compare(&args[0], &args[1])
                .ok_or_else(|| exec_err(format!("{name}: incomparable values")))?;
            Ok(Value::Bool(match name {
                "lt" => ord.is_lt(),
                "le" => ord.is_le(),
                "gt" => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        "and" => Ok(args
            .iter()
            .find(|v| !truthy(v))
            .cloned()
            .unwrap_or_else(|| args.last().cloned().unwrap_or(Value::Null))),
        "or" => Ok(args
            .iter()
            .find(|v| truthy(v))
            .cloned()
            .unwrap_or_else(|| args.last().cloned().unwrap_or(Value::Null))),
        "not" => {
            if args.len() != 1 {
                return Err(exec_err("not expects 1 argument".into()));
            }
            Ok(Value::Bool(!truthy(&args[0])))
        }
        "len" => {
            if args.len() != 1 {
                return Err(exec_err("len expects 1 argument".into()));
            }
            let len = match &args[0] {
                Value::String(s) => s.len(),
                Value::Array(a) => a.len(),
                Value::Object(m) => m.len(),
                _ => return Err(exec_err("len: unsupported type".into())),
            };
            Ok(Value::from(len as i64))
        }
        "index" => {
            if args.len() < 2 {
                return Err(exec_err("index expects at least 2 arguments".into()));
            }
            let mut current = args[0].clone();
            for key in &args[1..] {
                current = match (&current, key) {
                    (Value::Object(map), _) => {
                        map.get(&stringify(key)).cloned().unwrap_or(Value::Null)
                    }
                    (Value::Array(arr), Value::Number(n)) => n
                        .as_i64()
                        .and_then(|i| usize::try_from(i).ok())
                        .and_then(|i| arr.get(i).cloned())
                        .unwrap_or(Value::Null),
                    _ => Value::Null,
                };
            }
            Ok(current)
        }
        "print" => {
            let mut out = String::new();
            for (i, v) in args.iter().enumerate() {
                if i > 0
                    && !matches!(args[i - 1], Value::String(_))
                    && !matches!(v, Value::String(_))
                {
                    out.push(' ');
                }
                out.push_str(&stringify(v));
            }
            Ok(Value::String(out))
        }
        _ => unreachable!("builtin list is closed"),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
