use crate::error::TplError;
use serde::{Deserialize, Serialize};

/// One stage of a variable's filter pipeline: `upper` or `truncate(20, "...")`.
/// Arguments are kept as raw source strings and evaluated against the data
/// scope at render time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCall {
    pub name: String,
    pub args: Vec<String>,
}

/// Flat token produced by the scan pass. Control tokens carry no structure
/// yet; nesting is established by the control-flow grouping pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Text(String),
    Var {
        expr: String,
        filters: Vec<FilterCall>,
        offset: usize,
    },
    Control {
        command: String,
        expr: String,
        offset: usize,
    },
}

const VAR_OPEN: &str = "{{";
const VAR_CLOSE: &str = "}}";
const CTRL_OPEN: &str = "{%";
const CTRL_CLOSE: &str = "%}";

/// Scans raw template source into a flat token list. Unterminated `{{` or
/// `{%` is a hard parse error carrying the byte offset of the opener.
pub fn tokenize(source: &str, template: &str) -> Result<Vec<Token>, TplError> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut pos = 0;
    let len = source.len();

    while pos < len {
        let remaining = &source[pos..];

        if remaining.starts_with(VAR_OPEN) {
            let end = remaining.find(VAR_CLOSE).ok_or_else(|| {
                TplError::parse(template, pos, "unterminated '{{' delimiter")
            })?;
            let inner = remaining[VAR_OPEN.len()..end].trim();
            if inner.is_empty() {
                return Err(TplError::parse(template, pos, "empty '{{ }}' expression"));
            }
            let (expr, filters) = parse_filter_chain(inner, template, pos)?;
            tokens.push(Token::Var {
                expr,
                filters,
                offset: pos,
            });
            pos += end + VAR_CLOSE.len();
            continue;
        }

        if remaining.starts_with(CTRL_OPEN) {
            let end = remaining.find(CTRL_CLOSE).ok_or_else(|| {
                TplError::parse(template, pos, "unterminated '{%' delimiter")
            })?;
            let inner = remaining[CTRL_OPEN.len()..end].trim();
            let (command, expr) = match inner.split_once(char::is_whitespace) {
                Some((cmd, rest)) => (cmd.to_string(), rest.trim().to_string()),
                None => (inner.to_string(), String::new()),
            };
            if command.is_empty() {
                return Err(TplError::parse(template, pos, "empty '{% %}' statement"));
            }
            tokens.push(Token::Control {
                command,
                expr,
                offset: pos,
            });
            pos += end + CTRL_CLOSE.len();
            continue;
        }

        // Literal text up to the next delimiter opener.
        let next_var = remaining.find(VAR_OPEN).unwrap_or(remaining.len());
        let next_ctrl = remaining.find(CTRL_OPEN).unwrap_or(remaining.len());
        let next_stop = std::cmp::min(next_var, next_ctrl);

        if next_stop > 0 {
            append_text(&mut tokens, &remaining[..next_stop]);
            pos += next_stop;
        } else {
            append_text(&mut tokens, &remaining[0..1]);
            pos += 1;
        }
    }

    Ok(tokens)
}

fn append_text(tokens: &mut Vec<Token>, text: &str) {
    if let Some(Token::Text(last)) = tokens.last_mut() {
        last.push_str(text);
    } else {
        tokens.push(Token::Text(text.to_string()));
    }
}

/// Splits `expr|f1|f2(a, b)` into the head expression and its filter chain,
/// in left-to-right application order.
fn parse_filter_chain(
    inner: &str,
    template: &str,
    offset: usize,
) -> Result<(String, Vec<FilterCall>), TplError> {
    let segments = split_top_level(inner, '|');
    let expr = segments[0].trim().to_string();
    if expr.is_empty() {
        return Err(TplError::parse(template, offset, "missing expression before '|'"));
    }

    let mut filters = Vec::new();
    for segment in &segments[1..] {
        let segment = segment.trim();
        if segment.is_empty() {
            return Err(TplError::parse(template, offset, "empty filter name in chain"));
        }
        filters.push(parse_filter_call(segment, template, offset)?);
    }
    Ok((expr, filters))
}

fn parse_filter_call(segment: &str, template: &str, offset: usize) -> Result<FilterCall, TplError> {
    if let Some(open) = segment.find('(') {
        if !segment.ends_with(')') {
            return Err(TplError::parse(
                template,
                offset,
                format!("unterminated filter arguments in '{}'", segment),
            ));
        }
        let name = segment[..open].trim().to_string();
        let arg_src = &segment[open + 1..segment.len() - 1];
        let args = if arg_src.trim().is_empty() {
            Vec::new()
        } else {
            split_top_level(arg_src, ',')
                .into_iter()
                .map(|a| a.trim().to_string())
                .collect()
        };
        Ok(FilterCall { name, args })
    } else {
        Ok(FilterCall {
            name: segment.to_string(),
            args: Vec::new(),
        })
    }
}

/// Splits on a delimiter at depth zero, ignoring occurrences inside quotes,
/// parentheses or brackets.
pub fn split_top_level(s: &str, delim: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' => depth += 1,
                ')' | ']' => depth = depth.saturating_sub(1),
                _ if c == delim && depth == 0 => {
                    parts.push(&s[start..i]);
                    start = i + c.len_utf8();
                }
                _ => {}
            },
        }
    }
    parts.push(&s[start..]);
    parts
}
