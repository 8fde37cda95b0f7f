use crate::parser::Node;
use crate::value::Value;
use std::collections::BTreeMap;

/// Per-render variable scope: the caller's data map as the root plus a
/// stack of local bindings (loop variables, include locals). Locals shadow
/// root keys; later locals shadow earlier ones.
pub struct Context {
    root: Value,
    locals: Vec<(String, Value)>,
}

impl Context {
    pub fn new(root: Value) -> Self {
        Self {
            root,
            locals: Vec::new(),
        }
    }

    pub fn push(&mut self, key: &str, value: Value) {
        self.locals.push((key.to_string(), value));
    }

    pub fn pop(&mut self) {
        self.locals.pop();
    }

    /// Number of active local bindings; used to restore the scope after a
    /// nested render so nothing leaks to siblings.
    pub fn depth(&self) -> usize {
        self.locals.len()
    }

    pub fn truncate(&mut self, depth: usize) {
        self.locals.truncate(depth);
    }

    /// Resolves a plain or dotted key against the scope. Missing keys and
    /// missing intermediate segments yield `Value::Null`, never an error.
    pub fn lookup(&self, key: &str) -> Value {
        // 1. Whole key in locals (reverse order) then root.
        if let Some(v) = self.lookup_flat(key) {
            return v.clone();
        }

        // 2. Dotted path: resolve the head, then walk map keys.
        if key.contains('.') {
            let mut parts = key.split('.');
            let head = match parts.next() {
                Some(h) => h,
                None => return Value::Null,
            };
            let mut current = match self.lookup_flat(head) {
                Some(v) => v,
                None => return Value::Null,
            };
            for part in parts {
                match current {
                    Value::Map(m) => match m.get(part) {
                        Some(v) => current = v,
                        None => return Value::Null,
                    },
                    Value::List(items) => match part.parse::<usize>().ok().and_then(|i| items.get(i)) {
                        Some(v) => current = v,
                        None => return Value::Null,
                    },
                    _ => return Value::Null,
                }
            }
            return current.clone();
        }

        Value::Null
    }

    fn lookup_flat(&self, key: &str) -> Option<&Value> {
        for (k, v) in self.locals.iter().rev() {
            if k == key {
                return Some(v);
            }
        }
        if let Value::Map(m) = &self.root {
            return m.get(key);
        }
        None
    }
}

/// Block-override frames for template inheritance, ordered most-derived
/// first. Rendering a block consults frames from the top; `parent()` inside
/// a block body continues the search below the frame that supplied it.
pub struct BlockFrames {
    frames: Vec<BTreeMap<String, Vec<Node>>>,
}

impl BlockFrames {
    pub fn new(frames: Vec<BTreeMap<String, Vec<Node>>>) -> Self {
        Self { frames }
    }

    pub fn empty() -> Self {
        Self { frames: Vec::new() }
    }

    /// First frame at or below `from` that defines `name`.
    pub fn find(&self, name: &str, from: usize) -> Option<(usize, &[Node])> {
        for (i, frame) in self.frames.iter().enumerate().skip(from) {
            if let Some(body) = frame.get(name) {
                return Some((i, body.as_slice()));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn root_with(entries: &[(&str, Value)]) -> Value {
        let mut m = HashMap::new();
        for (k, v) in entries {
            m.insert(k.to_string(), v.clone());
        }
        Value::Map(m)
    }

    #[test]
    fn test_lookup_root_and_locals() {
        let mut ctx = Context::new(root_with(&[("name", Value::Str("ada".into()))]));
        assert_eq!(ctx.lookup("name"), Value::Str("ada".into()));
        assert_eq!(ctx.lookup("missing"), Value::Null);

        ctx.push("name", Value::Str("li".into()));
        assert_eq!(ctx.lookup("name"), Value::Str("li".into()));
        ctx.pop();
        assert_eq!(ctx.lookup("name"), Value::Str("ada".into()));
    }

    #[test]
    fn test_dotted_path() {
        let team = root_with(&[("name", Value::Str("core".into()))]);
        let user = root_with(&[("team", team)]);
        let ctx = Context::new(root_with(&[("user", user)]));

        assert_eq!(ctx.lookup("user.team.name"), Value::Str("core".into()));
        assert_eq!(ctx.lookup("user.team.size"), Value::Null);
        assert_eq!(ctx.lookup("user.missing.name"), Value::Null);
    }

    #[test]
    fn test_list_index_path() {
        let ctx = Context::new(root_with(&[(
            "items",
            Value::List(vec![Value::I64(10), Value::I64(20)]),
        )]));
        assert_eq!(ctx.lookup("items.1"), Value::I64(20));
        assert_eq!(ctx.lookup("items.9"), Value::Null);
    }

    #[test]
    fn test_truncate_restores_scope() {
        let mut ctx = Context::new(root_with(&[]));
        let depth = ctx.depth();
        ctx.push("a", Value::I64(1));
        ctx.push("b", Value::I64(2));
        ctx.truncate(depth);
        assert_eq!(ctx.lookup("a"), Value::Null);
        assert_eq!(ctx.lookup("b"), Value::Null);
    }

    #[test]
    fn test_block_frames_search() {
        let mut child = BTreeMap::new();
        child.insert("title".to_string(), vec![Node::Text("B".into())]);
        let mut parent = BTreeMap::new();
        parent.insert("title".to_string(), vec![Node::Text("A".into())]);
        parent.insert("footer".to_string(), vec![Node::Text("F".into())]);

        let frames = BlockFrames::new(vec![child, parent]);
        let (idx, body) = frames.find("title", 0).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(body, &[Node::Text("B".into())]);

        let (idx, body) = frames.find("title", 1).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(body, &[Node::Text("A".into())]);

        assert_eq!(frames.find("footer", 0).unwrap().0, 1);
        assert!(frames.find("missing", 0).is_none());
    }
}
