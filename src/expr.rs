use crate::render_context::Context;
use crate::tokenizer::split_top_level;
use crate::value::Value;

/// Resolves a template expression against the current scope: literals
/// (numbers, quoted strings, true/false/null), `[a, b, c]` list literals,
/// dotted paths, and a single binary arithmetic operator. Anything that
/// cannot be resolved yields `Value::Null` — expressions are display code
/// and never abort a render.
pub fn resolve(expr: &str, ctx: &Context) -> Value {
    let expr = expr.trim();
    if expr.is_empty() {
        return Value::Null;
    }

    if let Some(lit) = parse_literal(expr) {
        return lit;
    }

    if expr.starts_with('[') && expr.ends_with(']') {
        let inner = &expr[1..expr.len() - 1];
        if inner.trim().is_empty() {
            return Value::List(Vec::new());
        }
        let items = split_top_level(inner, ',')
            .into_iter()
            .map(|e| resolve(e, ctx))
            .collect();
        return Value::List(items);
    }

    // One binary operator, no precedence or parentheses. Operands are
    // resolved recursively (literals or dotted paths).
    if let Some((left, op, right)) = split_binary(expr) {
        return apply_arith(resolve(left, ctx), op, resolve(right, ctx));
    }

    ctx.lookup(expr)
}

fn parse_literal(expr: &str) -> Option<Value> {
    match expr {
        "null" | "none" => return Some(Value::Null),
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        _ => {}
    }

    if expr.len() >= 2 {
        let bytes = expr.as_bytes();
        if (bytes[0] == b'"' && bytes[expr.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[expr.len() - 1] == b'\'')
        {
            return Some(Value::Str(expr[1..expr.len() - 1].to_string()));
        }
    }

    let first = expr.as_bytes()[0];
    if first.is_ascii_digit() || (first == b'-' && expr.len() > 1) {
        if let Ok(n) = expr.parse::<i64>() {
            return Some(Value::I64(n));
        }
        if let Ok(n) = expr.parse::<f64>() {
            return Some(Value::F64(n));
        }
    }
    None
}

/// Splits `left OP right` at the first top-level whitespace-delimited
/// arithmetic operator. `a - b` is arithmetic; `a-b` is a plain key.
fn split_binary(expr: &str) -> Option<(&str, char, &str)> {
    let parts: Vec<&str> = split_top_level(expr, ' ')
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() == 3 && parts[1].len() == 1 {
        let op = parts[1].chars().next()?;
        if matches!(op, '+' | '-' | '*' | '/') {
            // parts are sub-slices of expr, so offsets are exact even when
            // the operator character also appears inside an operand.
            let op_at = parts[1].as_ptr() as usize - expr.as_ptr() as usize;
            return Some((&expr[..op_at], op, &expr[op_at + 1..]));
        }
    }
    None
}

fn apply_arith(left: Value, op: char, right: Value) -> Value {
    // String concatenation rides on '+'.
    if op == '+' {
        if let (Value::Str(a), b) = (&left, &right) {
            return Value::Str(format!("{}{}", a, b.to_display_string()));
        }
    }

    let (a, b) = match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Value::Null,
    };
    let result = match op {
        '+' => a + b,
        '-' => a - b,
        '*' => a * b,
        '/' => {
            // Division by zero is defined as zero for display code.
            if b == 0.0 {
                return Value::I64(0);
            }
            a / b
        }
        _ => return Value::Null,
    };
    if result.fract() == 0.0 && result.abs() < 1e15 {
        Value::I64(result as i64)
    } else {
        Value::F64(result)
    }
}

/// Evaluates an `if` condition: atoms joined by `and` / `or` (no
/// parentheses), where an atom is either a comparison
/// (`== != >= <= > <`) or a bare expression tested for truthiness.
pub fn eval_condition(expr: &str, ctx: &Context) -> bool {
    for or_part in split_keyword(expr, " or ") {
        let mut and_satisfied = true;
        for atom in split_keyword(or_part, " and ") {
            if !eval_atom(atom, ctx) {
                and_satisfied = false;
                break;
            }
        }
        if and_satisfied {
            return true;
        }
    }
    false
}

/// Splits on a keyword delimiter (spaces included) outside quotes, so a
/// string literal like `'a and b'` stays one atom.
fn split_keyword<'a>(s: &'a str, kw: &str) -> Vec<&'a str> {
    let bytes = s.as_bytes();
    let kw_bytes = kw.as_bytes();
    let mut parts = Vec::new();
    let mut quote: Option<u8> = None;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match quote {
            Some(q) => {
                if bytes[i] == q {
                    quote = None;
                }
                i += 1;
            }
            None => {
                if bytes[i] == b'\'' || bytes[i] == b'"' {
                    quote = Some(bytes[i]);
                    i += 1;
                } else if bytes[i..].starts_with(kw_bytes) {
                    parts.push(&s[start..i]);
                    start = i + kw.len();
                    i = start;
                } else {
                    i += 1;
                }
            }
        }
    }
    parts.push(&s[start..]);
    parts
}

fn eval_atom(atom: &str, ctx: &Context) -> bool {
    let atom = atom.trim();
    if atom.is_empty() {
        return false;
    }

    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some(at) = find_operator(atom, op) {
            let left = resolve(&atom[..at], ctx);
            let right = resolve(&atom[at + op.len()..], ctx);
            return compare(&left, op, &right);
        }
    }

    resolve(atom, ctx).is_truthy()
}

/// Position of an operator outside quotes. `>` must not match inside `>=`,
/// so two-character operators are searched first by the caller.
fn find_operator(s: &str, op: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let bytes = s.as_bytes();
    let op_bytes = op.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                } else if bytes[i..].starts_with(op_bytes) {
                    // Reject '>' that is really the head of '>=' etc.
                    let next = bytes.get(i + op_bytes.len()).copied();
                    if op.len() == 1 && next == Some(b'=') {
                        i += 1;
                        continue;
                    }
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

fn compare(left: &Value, op: &str, right: &Value) -> bool {
    match op {
        "==" => values_equal(left, right),
        "!=" => !values_equal(left, right),
        _ => {
            let (a, b) = match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return false,
            };
            match op {
                ">=" => a >= b,
                "<=" => a <= b,
                ">" => a > b,
                "<" => a < b,
                _ => false,
            }
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a == b;
    }
    left == right
}
