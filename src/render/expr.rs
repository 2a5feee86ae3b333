//! The expression dialect: one expression, one value.
//!
//! Identifiers resolve against the template input; field access, indexing,
//! arithmetic, comparisons, boolean logic, a ternary, array literals, and
//! calls into the shared function table cover the expression forms configs
//! use (`settings.baseUrl`, `requests.a.error == "" ? 200 : 502`, ...).

use serde_json::{Number, Value};

use super::functions::{self, CallCtx, Dialect};
use super::{stringify, truthy, RenderError, Renderer, Storage};

pub(crate) struct Program {
    root: Expr,
}

impl Program {
    pub fn compile(src: &str) -> Result<Program, RenderError> {
        let tokens = lex(src)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
        };
        let root = parser.ternary()?;
        parser.expect_eof()?;
        Ok(Program { root })
    }

    pub fn run(
        &self,
        renderer: &Renderer,
        input: &Value,
        storage: &mut Storage,
    ) -> Result<Value, RenderError> {
        let mut ctx = CallCtx { renderer, storage };
        eval(&self.root, &mut ctx, input)
    }
}

enum Expr {
    Lit(Value),
    Ident(String),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Array(Vec<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Clone, Copy)]
enum UnOp {
    Not,
    Neg,
}

#[derive(Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Num(Number),
    Str(String),
    True,
    False,
    Nil,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Question,
    Colon,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Eof,
}

fn lex(src: &str) -> Result<Vec<Token>, RenderError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let parse_err = |msg: String| RenderError::ExprParse(msg);

    while i < chars.len() {
        let c = chars[i];

        match c {
            c if c.is_whitespace() => i += 1,
            '+' => push1(&mut tokens, Token::Plus, &mut i),
            '-' => push1(&mut tokens, Token::Minus, &mut i),
            '*' => push1(&mut tokens, Token::Star, &mut i),
            '/' => push1(&mut tokens, Token::Slash, &mut i),
            '%' => push1(&mut tokens, Token::Percent, &mut i),
            '?' => push1(&mut tokens, Token::Question, &mut i),
            ':' => push1(&mut tokens, Token::Colon, &mut i),
            '.' => push1(&mut tokens, Token::Dot, &mut i),
            ',' => push1(&mut tokens, Token::Comma, &mut i),
            '(' => push1(&mut tokens, Token::LParen, &mut i),
            ')' => push1(&mut tokens, Token::RParen, &mut i),
            '[' => push1(&mut tokens, Token::LBracket, &mut i),
            ']' => push1(&mut tokens, Token::RBracket, &mut i),
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(parse_err("unexpected '='; did you mean '=='?".into()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(parse_err("unexpected '&'".into()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(parse_err("unexpected '|'".into()));
                }
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let mut out = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(parse_err("unterminated string".into())),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            i += 1;
                            let escaped = chars
                                .get(i)
                                .ok_or_else(|| parse_err("unterminated string".into()))?;
                            out.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => *other,
                            });
                            i += 1;
                        }
                        Some(&ch) => {
                            out.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(out));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // A digit followed by '.' followed by a non-digit is field
                    // access on a number literal, which configs never write;
                    // treat the dot as part of the number only when digits follow.
                    if chars[i] == '.' && !chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = if let Ok(n) = text.parse::<i64>() {
                    Number::from(n)
                } else {
                    text.parse::<f64>()
                        .ok()
                        .and_then(Number::from_f64)
                        .ok_or_else(|| parse_err(format!("bad number '{text}'")))?
                };
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "nil" => Token::Nil,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(parse_err(format!("unexpected character '{other}'"))),
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

fn push1(tokens: &mut Vec<Token>, token: Token, i: &mut usize) {
    tokens.push(token);
    *i += 1;
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn next(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.next();
            return true;
        }
        false
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), RenderError> {
        if !self.eat(&token) {
            return Err(RenderError::ExprParse(format!(
                "expected {what}, found {:?}",
                self.peek()
            )));
        }
        Ok(())
    }

    fn expect_eof(&mut self) -> Result<(), RenderError> {
        if self.peek() != &Token::Eof {
            return Err(RenderError::ExprParse(format!(
                "unexpected trailing token {:?}",
                self.peek()
            )));
        }
        Ok(())
    }

    fn ternary(&mut self) -> Result<Expr, RenderError> {
        let cond = self.or()?;

        if self.eat(&Token::Question) {
            let then = self.ternary()?;
            self.expect(Token::Colon, "':' in ternary")?;
            let els = self.ternary()?;
            return Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(els)));
        }

        Ok(cond)
    }

    fn or(&mut self) -> Result<Expr, RenderError> {
        let mut left = self.and()?;
        while self.eat(&Token::OrOr) {
            let right = self.and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, RenderError> {
        let mut left = self.equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.equality()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, RenderError> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinOp::Eq,
                Token::NotEq => BinOp::Ne,
                _ => break,
            };
            self.next();
            let right = self.comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, RenderError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinOp::Lt,
                Token::Le => BinOp::Le,
                Token::Gt => BinOp::Gt,
                Token::Ge => BinOp::Ge,
                _ => break,
            };
            self.next();
            let right = self.additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, RenderError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.next();
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, RenderError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.next();
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, RenderError> {
        if self.eat(&Token::Bang) {
            return Ok(Expr::Unary(UnOp::Not, Box::new(self.unary()?)));
        }
        if self.eat(&Token::Minus) {
            return Ok(Expr::Unary(UnOp::Neg, Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, RenderError> {
        let mut expr = self.primary()?;

        loop {
            if self.eat(&Token::Dot) {
                match self.next() {
                    Token::Ident(name) => expr = Expr::Field(Box::new(expr), name),
                    other => {
                        return Err(RenderError::ExprParse(format!(
                            "expected field name after '.', found {other:?}"
                        )))
                    }
                }
                continue;
            }

            if self.eat(&Token::LBracket) {
                let index = self.ternary()?;
                self.expect(Token::RBracket, "']'")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
                continue;
            }

            break;
        }

        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, RenderError> {
        match self.next() {
            Token::Num(n) => Ok(Expr::Lit(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Lit(Value::String(s))),
            Token::True => Ok(Expr::Lit(Value::Bool(true))),
            Token::False => Ok(Expr::Lit(Value::Bool(false))),
            Token::Nil => Ok(Expr::Lit(Value::Null)),
            Token::LParen => {
                let inner = self.ternary()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut elems = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        elems.push(self.ternary()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma, "',' in array literal")?;
                    }
                }
                Ok(Expr::Array(elems))
            }
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.ternary()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(Token::Comma, "',' in argument list")?;
                        }
                    }
                    if functions::resolve(Dialect::Expr, &name).is_none() {
                        return Err(RenderError::ExprParse(format!(
                            "unknown function {name}()"
                        )));
                    }
                    return Ok(Expr::Call(name, args));
                }
                Ok(Expr::Ident(name))
            }
            other => Err(RenderError::ExprParse(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval(expr: &Expr, ctx: &mut CallCtx<'_>, input: &Value) -> Result<Value, RenderError> {
    match expr {
        Expr::Lit(v) => Ok(v.clone()),

        Expr::Ident(name) => Ok(match input {
            Value::Object(map) => map.get(name).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }),

        Expr::Field(base, name) => {
            let base = eval(base, ctx, input)?;
            Ok(match base {
                Value::Object(map) => map.get(name).cloned().unwrap_or(Value::Null),
                _ => Value::Null,
            })
        }

        Expr::Index(base, index) => {
            let base = eval(base, ctx, input)?;
            let index = eval(index, ctx, input)?;
            Ok(match (&base, &index) {
                (Value::Array(arr), Value::Number(n)) => n
                    .as_i64()
                    .and_then(|i| usize::try_from(i).ok())
                    .and_then(|i| arr.get(i).cloned())
                    .unwrap_or(Value::Null),
                (Value::Object(map), _) => {
                    map.get(&stringify(&index)).cloned().unwrap_or(Value::Null)
                }
                _ => Value::Null,
            })
        }

        Expr::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, ctx, input)?);
            }
            let canonical = functions::resolve(Dialect::Expr, name)
                .ok_or_else(|| RenderError::ExprEval(format!("unknown function {name}()")))?;
            functions::invoke(canonical, ctx, &values)
        }

        Expr::Array(elems) => {
            let mut values = Vec::with_capacity(elems.len());
            for elem in elems {
                values.push(eval(elem, ctx, input)?);
            }
            Ok(Value::Array(values))
        }

        Expr::Unary(op, operand) => {
            let value = eval(operand, ctx, input)?;
            match op {
                UnOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnOp::Neg => match &value {
                    Value::Number(n) => {
                        if let Some(i) = n.as_i64() {
                            Ok(Value::from(-i))
                        } else {
                            let f = n.as_f64().unwrap_or_default();
                            Ok(Number::from_f64(-f).map(Value::Number).unwrap_or(Value::Null))
                        }
                    }
                    _ => Err(RenderError::ExprEval(format!(
                        "cannot negate {}",
                        stringify(&value)
                    ))),
                },
            }
        }

        Expr::Binary(op, left, right) => eval_binary(*op, left, right, ctx, input),

        Expr::Ternary(cond, then, els) => {
            if truthy(&eval(cond, ctx, input)?) {
                eval(then, ctx, input)
            } else {
                eval(els, ctx, input)
            }
        }
    }
}

fn eval_binary(
    op: BinOp,
    left: &Expr,
    right: &Expr,
    ctx: &mut CallCtx<'_>,
    input: &Value,
) -> Result<Value, RenderError> {
    // Short-circuit forms first.
    if op == BinOp::And {
        let l = eval(left, ctx, input)?;
        if !truthy(&l) {
            return Ok(Value::Bool(false));
        }
        return Ok(Value::Bool(truthy(&eval(right, ctx, input)?)));
    }
    if op == BinOp::Or {
        let l = eval(left, ctx, input)?;
        if truthy(&l) {
            return Ok(Value::Bool(true));
        }
        return Ok(Value::Bool(truthy(&eval(right, ctx, input)?)));
    }

    let l = eval(left, ctx, input)?;
    let r = eval(right, ctx, input)?;

    match op {
        BinOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
        BinOp::Ne => Ok(Value::Bool(!loose_eq(&l, &r))),

        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = compare(&l, &r).ok_or_else(|| {
                RenderError::ExprEval(format!(
                    "cannot compare {} and {}",
                    stringify(&l),
                    stringify(&r)
                ))
            })?;
            Ok(Value::Bool(match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Le => ord.is_le(),
                BinOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }

        BinOp::Add => match (&l, &r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Number(_), Value::Number(_)) => arith(op, &l, &r),
            _ => Err(RenderError::ExprEval(format!(
                "invalid operands for +: {} and {}",
                stringify(&l),
                stringify(&r)
            ))),
        },

        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => arith(op, &l, &r),

        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn arith(op: BinOp, l: &Value, r: &Value) -> Result<Value, RenderError> {
    let (Value::Number(a), Value::Number(b)) = (l, r) else {
        return Err(RenderError::ExprEval(format!(
            "arithmetic on non-numbers: {} and {}",
            stringify(l),
            stringify(r)
        )));
    };

    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let result = match op {
            BinOp::Add => x.checked_add(y),
            BinOp::Sub => x.checked_sub(y),
            BinOp::Mul => x.checked_mul(y),
            BinOp::Div => {
                if y == 0 {
                    return Err(RenderError::ExprEval("integer divide by zero".into()));
                }
                x.checked_div(y)
            }
            BinOp::Mod => {
                if y == 0 {
                    return Err(RenderError::ExprEval("integer divide by zero".into()));
                }
                x.checked_rem(y)
            }
            _ => unreachable!(),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| RenderError::ExprEval("integer overflow".into()));
    }

    let x = a.as_f64().unwrap_or_default();
    let y = b.as_f64().unwrap_or_default();
    let result = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => x / y,
        BinOp::Mod => x % y,
        _ => unreachable!(),
    };

    Ok(Number::from_f64(result).map(Value::Number).unwrap_or(Value::Null))
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
