use crate::filters::{FilterRegistry, Translator};
use crate::value::Value;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::HashMap;
use std::sync::Arc;

/// Escapes the five HTML-significant characters.
pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn str_arg(args: &[Value], idx: usize, default: &str) -> String {
    args.get(idx)
        .map(|v| v.to_display_string())
        .unwrap_or_else(|| default.to_string())
}

fn int_arg(args: &[Value], idx: usize, default: i64) -> i64 {
    args.get(idx)
        .and_then(|v| v.as_f64())
        .map(|f| f as i64)
        .unwrap_or(default)
}

/// Registers the built-in catalog. Every filter here is null-safe: a null
/// input produces the filter's safe default, never an error.
pub fn register_builtins(registry: &mut FilterRegistry, translator: Option<Arc<dyn Translator>>) {
    registry.register("upper", |v: &Value, _: &[Value]| {
        Ok(Value::Str(v.to_display_string().to_uppercase()))
    });

    registry.register("lower", |v: &Value, _: &[Value]| {
        Ok(Value::Str(v.to_display_string().to_lowercase()))
    });

    registry.register("capitalize", |v: &Value, _: &[Value]| {
        let s = v.to_display_string();
        let mut chars = s.chars();
        let out = match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => String::new(),
        };
        Ok(Value::Str(out))
    });

    registry.register("truncate", |v: &Value, args: &[Value]| {
        let s = v.to_display_string();
        let len = int_arg(args, 0, 50).max(0) as usize;
        let suffix = str_arg(args, 1, "...");
        let out = if s.chars().count() > len {
            let cut: String = s.chars().take(len).collect();
            cut + &suffix
        } else {
            s
        };
        Ok(Value::Str(out))
    });

    registry.register("default", |v: &Value, args: &[Value]| {
        if v.is_truthy() {
            Ok(v.clone())
        } else {
            Ok(args.first().cloned().unwrap_or(Value::Str(String::new())))
        }
    });

    registry.register("escape", |v: &Value, _: &[Value]| {
        Ok(Value::Str(html_escape(&v.to_display_string())))
    });

    // Marker for the renderer: a trailing `raw` disables auto-escaping.
    // The function itself is the identity.
    registry.register("raw", |v: &Value, _: &[Value]| Ok(v.clone()));

    registry.register("number_format", |v: &Value, args: &[Value]| {
        let n = v.as_f64().unwrap_or(0.0);
        let decimals = int_arg(args, 0, 0).clamp(0, 12) as usize;
        let dec_sep = str_arg(args, 1, ".");
        let thou_sep = str_arg(args, 2, ",");
        Ok(Value::Str(format_number(n, decimals, &dec_sep, &thou_sep)))
    });

    registry.register("currency", |v: &Value, args: &[Value]| {
        let n = v.as_f64().unwrap_or(0.0);
        let symbol = str_arg(args, 0, "$");
        let position = str_arg(args, 1, "before");
        let amount = format_number(n, 2, ".", ",");
        let out = if position == "after" {
            format!("{} {}", amount, symbol)
        } else {
            format!("{}{}", symbol, amount)
        };
        Ok(Value::Str(out))
    });

    registry.register("date", |v: &Value, args: &[Value]| {
        let format = str_arg(args, 0, "%Y-%m-%d");
        let out = match parse_datetime(v) {
            Some(dt) => dt.format(&format).to_string(),
            None => String::new(),
        };
        Ok(Value::Str(out))
    });

    registry.register("length", |v: &Value, _: &[Value]| {
        let n = match v {
            Value::Str(s) => s.chars().count(),
            Value::List(items) => items.len(),
            Value::Map(m) => m.len(),
            Value::Null => 0,
            other => other.to_display_string().chars().count(),
        };
        Ok(Value::I64(n as i64))
    });

    registry.register("slug", |v: &Value, _: &[Value]| {
        let s = v.to_display_string().to_lowercase();
        let mut out = String::with_capacity(s.len());
        let mut last_hyphen = true; // suppress a leading hyphen
        for c in s.chars() {
            if c.is_ascii_alphanumeric() {
                out.push(c);
                last_hyphen = false;
            } else if !last_hyphen {
                out.push('-');
                last_hyphen = true;
            }
        }
        while out.ends_with('-') {
            out.pop();
        }
        Ok(Value::Str(out))
    });

    registry.register("json", |v: &Value, _: &[Value]| {
        let out = serde_json::to_string(&value_to_json(v)).unwrap_or_default();
        Ok(Value::Str(out))
    });

    registry.register("first", |v: &Value, _: &[Value]| {
        let out = match v {
            Value::List(items) => items.first().cloned().unwrap_or(Value::Null),
            Value::Str(s) => s
                .chars()
                .next()
                .map(|c| Value::Str(c.to_string()))
                .unwrap_or(Value::Null),
            _ => Value::Null,
        };
        Ok(out)
    });

    registry.register("last", |v: &Value, _: &[Value]| {
        let out = match v {
            Value::List(items) => items.last().cloned().unwrap_or(Value::Null),
            Value::Str(s) => s
                .chars()
                .last()
                .map(|c| Value::Str(c.to_string()))
                .unwrap_or(Value::Null),
            _ => Value::Null,
        };
        Ok(out)
    });

    // Translation filters fall back to the key itself when no translator
    // is wired; a missing catalog must never break rendering.
    let t = translator.clone();
    registry.register("trans", move |v: &Value, _: &[Value]| {
        let key = v.to_display_string();
        let out = match &t {
            Some(tr) => tr.translate(&key, &HashMap::new()),
            None => key,
        };
        Ok(Value::Str(out))
    });

    let t = translator;
    registry.register("trans_plural", move |v: &Value, args: &[Value]| {
        let key = v.to_display_string();
        let count = int_arg(args, 0, 1);
        let out = match &t {
            Some(tr) => tr.translate_plural(&key, count, &HashMap::new()),
            None => key,
        };
        Ok(Value::Str(out))
    });
}

fn format_number(n: f64, decimals: usize, dec_sep: &str, thou_sep: &str) -> String {
    let formatted = format!("{:.*}", decimals, n.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i.to_string(), Some(f.to_string())),
        None => (formatted, None),
    };

    let mut grouped = String::new();
    let digits: Vec<char> = int_part.chars().collect();
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push_str(thou_sep);
        }
        grouped.push(*c);
    }

    let sign = if n < 0.0 && grouped.chars().any(|c| c != '0') {
        "-"
    } else {
        ""
    };
    match frac_part {
        Some(f) => format!("{}{}{}{}", sign, grouped, dec_sep, f),
        None => format!("{}{}", sign, grouped),
    }
}

/// Accepts epoch seconds, common date strings or date-typed values.
fn parse_datetime(v: &Value) -> Option<NaiveDateTime> {
    match v {
        Value::I64(epoch) => DateTime::from_timestamp(*epoch, 0).map(|dt| dt.naive_utc()),
        Value::F64(epoch) => DateTime::from_timestamp(*epoch as i64, 0).map(|dt| dt.naive_utc()),
        Value::Date(d) => d.and_hms_opt(0, 0, 0),
        Value::DateTime(dt) => Some(*dt),
        Value::Str(s) => {
            let s = s.trim();
            if let Ok(epoch) = s.parse::<i64>() {
                return DateTime::from_timestamp(epoch, 0).map(|dt| dt.naive_utc());
            }
            for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
                if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(dt);
                }
            }
            for fmt in ["%Y-%m-%d", "%d/%m/%Y"] {
                if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
                    return d.and_hms_opt(0, 0, 0);
                }
            }
            None
        }
        _ => None,
    }
}

/// Bridges the engine's value model into serde_json for the `json` filter.
/// Map keys are emitted sorted, so the output is a canonical form usable
/// as a hash input.
pub(crate) fn value_to_json(v: &Value) -> serde_json::Value {
    use serde_json::json;
    match v {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::I64(n) => json!(n),
        Value::F64(n) => json!(n),
        Value::Str(s) => json!(s),
        Value::Date(d) => json!(d.format("%Y-%m-%d").to_string()),
        Value::DateTime(d) => json!(d.format("%Y-%m-%d %H:%M:%S").to_string()),
        Value::Decimal(d) => json!(d.to_string()),
        Value::List(items) => {
            serde_json::Value::Array(items.iter().map(value_to_json).collect())
        }
        Value::Map(m) => {
            let mut obj = serde_json::Map::new();
            let mut keys: Vec<&String> = m.keys().collect();
            keys.sort();
            for k in keys {
                obj.insert(k.clone(), value_to_json(&m[k]));
            }
            serde_json::Value::Object(obj)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::FilterExecutor;

    fn registry() -> FilterRegistry {
        FilterRegistry::with_builtins(None)
    }

    fn run(name: &str, v: Value, args: Vec<Value>) -> Value {
        let registry = registry();
        let executor = FilterExecutor::new(&registry);
        executor.execute(name, &v, &args).unwrap()
    }

    #[test]
    fn test_case_filters() {
        assert_eq!(run("upper", "ada".into(), vec![]), Value::Str("ADA".into()));
        assert_eq!(run("lower", "ADA".into(), vec![]), Value::Str("ada".into()));
        assert_eq!(
            run("capitalize", "ada lovelace".into(), vec![]),
            Value::Str("Ada lovelace".into())
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(
            run("truncate", "hello world".into(), vec![Value::I64(5)]),
            Value::Str("hello...".into())
        );
        assert_eq!(
            run(
                "truncate",
                "hello world".into(),
                vec![Value::I64(5), Value::Str("…".into())]
            ),
            Value::Str("hello…".into())
        );
        assert_eq!(
            run("truncate", "hi".into(), vec![Value::I64(5)]),
            Value::Str("hi".into())
        );
    }

    #[test]
    fn test_default() {
        assert_eq!(
            run("default", Value::Null, vec![Value::Str("n/a".into())]),
            Value::Str("n/a".into())
        );
        assert_eq!(
            run("default", Value::Str("".into()), vec![Value::Str("n/a".into())]),
            Value::Str("n/a".into())
        );
        assert_eq!(
            run("default", Value::Str("x".into()), vec![Value::Str("n/a".into())]),
            Value::Str("x".into())
        );
    }

    #[test]
    fn test_escape() {
        assert_eq!(
            run("escape", "<b>\"&'</b>".into(), vec![]),
            Value::Str("&lt;b&gt;&quot;&amp;&#39;&lt;/b&gt;".into())
        );
    }

    #[test]
    fn test_number_format() {
        assert_eq!(
            run("number_format", Value::F64(1234567.891), vec![Value::I64(2)]),
            Value::Str("1,234,567.89".into())
        );
        assert_eq!(
            run(
                "number_format",
                Value::F64(1234.5),
                vec![Value::I64(2), Value::Str(",".into()), Value::Str(".".into())]
            ),
            Value::Str("1.234,50".into())
        );
        assert_eq!(
            run("number_format", Value::I64(1000), vec![]),
            Value::Str("1,000".into())
        );
        assert_eq!(
            run("number_format", Value::I64(-1234), vec![]),
            Value::Str("-1,234".into())
        );
    }

    #[test]
    fn test_currency() {
        assert_eq!(
            run("currency", Value::F64(19.9), vec![]),
            Value::Str("$19.90".into())
        );
        assert_eq!(
            run(
                "currency",
                Value::F64(19.9),
                vec![Value::Str("€".into()), Value::Str("after".into())]
            ),
            Value::Str("19.90 €".into())
        );
    }

    #[test]
    fn test_date() {
        // 2021-01-01T00:00:00Z
        assert_eq!(
            run("date", Value::I64(1609459200), vec![]),
            Value::Str("2021-01-01".into())
        );
        assert_eq!(
            run(
                "date",
                Value::Str("2021-06-15".into()),
                vec![Value::Str("%d/%m/%Y".into())]
            ),
            Value::Str("15/06/2021".into())
        );
        assert_eq!(
            run("date", Value::Str("not a date".into()), vec![]),
            Value::Str("".into())
        );
    }

    #[test]
    fn test_length() {
        assert_eq!(run("length", "héllo".into(), vec![]), Value::I64(5));
        assert_eq!(
            run("length", Value::List(vec![Value::I64(1), Value::I64(2)]), vec![]),
            Value::I64(2)
        );
        assert_eq!(run("length", Value::Null, vec![]), Value::I64(0));
    }

    #[test]
    fn test_slug() {
        assert_eq!(
            run("slug", "Hello, World! 2x".into(), vec![]),
            Value::Str("hello-world-2x".into())
        );
        assert_eq!(run("slug", "--a--".into(), vec![]), Value::Str("a".into()));
    }

    #[test]
    fn test_json() {
        assert_eq!(
            run("json", Value::List(vec![Value::I64(1), Value::Null]), vec![]),
            Value::Str("[1,null]".into())
        );
    }

    #[test]
    fn test_first_last() {
        let list = Value::List(vec![Value::I64(1), Value::I64(2), Value::I64(3)]);
        assert_eq!(run("first", list.clone(), vec![]), Value::I64(1));
        assert_eq!(run("last", list, vec![]), Value::I64(3));
        assert_eq!(run("first", "abc".into(), vec![]), Value::Str("a".into()));
        assert_eq!(run("last", Value::Null, vec![]), Value::Null);
    }

    #[test]
    fn test_trans_without_translator_passes_key_through() {
        assert_eq!(
            run("trans", "app.title".into(), vec![]),
            Value::Str("app.title".into())
        );
        assert_eq!(
            run("trans_plural", "app.items".into(), vec![Value::I64(3)]),
            Value::Str("app.items".into())
        );
    }

    #[test]
    fn test_trans_with_translator() {
        struct UpperTranslator;
        impl Translator for UpperTranslator {
            fn translate(&self, key: &str, _: &HashMap<String, Value>) -> String {
                format!("T:{}", key)
            }
            fn translate_plural(&self, key: &str, count: i64, _: &HashMap<String, Value>) -> String {
                format!("T:{}:{}", key, count)
            }
        }
        let registry = FilterRegistry::with_builtins(Some(Arc::new(UpperTranslator)));
        let executor = FilterExecutor::new(&registry);
        assert_eq!(
            executor.execute("trans", &"k".into(), &[]).unwrap(),
            Value::Str("T:k".into())
        );
        assert_eq!(
            executor
                .execute("trans_plural", &"k".into(), &[Value::I64(2)])
                .unwrap(),
            Value::Str("T:k:2".into())
        );
    }

    #[test]
    fn test_every_builtin_is_null_safe() {
        let registry = registry();
        let executor = FilterExecutor::new(&registry);
        for name in [
            "upper", "lower", "capitalize", "truncate", "default", "escape", "raw",
            "number_format", "currency", "date", "length", "slug", "json", "first",
            "last", "trans", "trans_plural",
        ] {
            let result = executor.execute(name, &Value::Null, &[]);
            assert!(result.is_ok(), "filter '{}' failed on null input", name);
        }
    }
}
