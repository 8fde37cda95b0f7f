use crate::builtin_filters::html_escape;
use crate::error::TplError;
use crate::expr;
use crate::filters::FilterManager;
use crate::parser::{Node, ParsedTemplate};
use crate::render_context::{BlockFrames, Context};
use crate::value::Value;
use std::sync::Arc;
use tracing::warn;

/// Supplies parsed templates to the renderer for `include` targets and
/// `extends` chains. The engine implements this on top of its cache.
pub trait TemplateLoader {
    fn load(&self, name: &str) -> Result<Arc<ParsedTemplate>, TplError>;
}

/// Walks a `ParsedTemplate` tree against a data scope and produces the
/// output string. In strict mode every failure propagates; otherwise broken
/// includes and filter errors degrade to inert HTML comments in place so a
/// single bad fragment cannot blank the page.
pub struct TemplateRenderer<'a> {
    filters: &'a FilterManager,
    loader: &'a dyn TemplateLoader,
    auto_escape: bool,
    strict: bool,
}

struct RenderState {
    ctx: Context,
    frames: BlockFrames,
    /// Active block renders: (block name, frame index that supplied the
    /// body). `parent()` continues the frame search below the top entry.
    block_pos: Vec<(String, usize)>,
    /// Templates currently being rendered, for include-cycle detection.
    active: Vec<String>,
    out: String,
}

impl<'a> TemplateRenderer<'a> {
    pub fn new(
        filters: &'a FilterManager,
        loader: &'a dyn TemplateLoader,
        auto_escape: bool,
        strict: bool,
    ) -> Self {
        Self {
            filters,
            loader,
            auto_escape,
            strict,
        }
    }

    pub fn render(
        &self,
        name: &str,
        template: &ParsedTemplate,
        data: Value,
    ) -> Result<String, TplError> {
        let mut state = RenderState {
            ctx: Context::new(data),
            frames: BlockFrames::empty(),
            block_pos: Vec::new(),
            active: Vec::new(),
            out: String::new(),
        };
        self.render_template(name, template, &mut state)?;
        Ok(state.out)
    }

    /// Emergency path used by the engine when a normal render fails in
    /// production: text and variables only, every error swallowed to an
    /// empty value. Control structures are skipped entirely.
    pub fn render_degraded(&self, template: &ParsedTemplate, data: Value) -> String {
        let ctx = Context::new(data);
        let mut out = String::new();
        for node in &template.nodes {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Var { expr: e, .. } => {
                    let s = expr::resolve(e, &ctx).to_display_string();
                    if self.auto_escape {
                        out.push_str(&html_escape(&s));
                    } else {
                        out.push_str(&s);
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Resolves the inheritance chain for `template` and renders the
    /// root-most ancestor's skeleton with block overrides layered
    /// most-derived-first.
    fn render_template(
        &self,
        name: &str,
        template: &ParsedTemplate,
        state: &mut RenderState,
    ) -> Result<(), TplError> {
        let mut chain: Vec<Arc<ParsedTemplate>> = Vec::new();
        let mut current_parent = template.parent.clone();
        while let Some(parent_name) = current_parent {
            let parent = self.loader.load(&parent_name)?;
            current_parent = parent.parent.clone();
            chain.push(parent);
        }

        let mut frames = vec![template.blocks.clone()];
        frames.extend(chain.iter().map(|t| t.blocks.clone()));

        let saved_frames = std::mem::replace(&mut state.frames, BlockFrames::new(frames));
        let saved_blocks = std::mem::take(&mut state.block_pos);
        state.active.push(name.to_string());

        let result = match chain.last() {
            Some(root) => {
                let root = Arc::clone(root);
                self.walk(&root.nodes, state)
            }
            None => self.walk(&template.nodes, state),
        };

        state.active.pop();
        state.frames = saved_frames;
        state.block_pos = saved_blocks;
        result
    }

    fn walk(&self, nodes: &[Node], state: &mut RenderState) -> Result<(), TplError> {
        for node in nodes {
            match node {
                Node::Text(t) => state.out.push_str(t),
                Node::Var { expr: e, filters } => self.render_var(e, filters, state)?,
                Node::If {
                    cond,
                    body,
                    else_body,
                } => {
                    if expr::eval_condition(cond, &state.ctx) {
                        self.walk(body, state)?;
                    } else {
                        self.walk(else_body, state)?;
                    }
                }
                Node::For {
                    item,
                    iterable,
                    body,
                } => self.render_for(item, iterable, body, state)?,
                Node::Block { name, body } => self.render_block(name, body, state)?,
                Node::Extends { .. } => {
                    // Consumed during chain resolution; inert here.
                }
                Node::Include { name } => self.render_include(name, state)?,
            }
        }
        Ok(())
    }

    fn render_var(
        &self,
        e: &str,
        filters: &[crate::tokenizer::FilterCall],
        state: &mut RenderState,
    ) -> Result<(), TplError> {
        // `parent()` inside a block body splices in the shadowed block.
        if e == "parent()" {
            return self.render_parent_block(state);
        }

        let value = expr::resolve(e, &state.ctx);

        let pipeline: Vec<(String, Vec<Value>)> = filters
            .iter()
            .map(|f| {
                let args = f
                    .args
                    .iter()
                    .map(|a| expr::resolve(a, &state.ctx))
                    .collect();
                (f.name.clone(), args)
            })
            .collect();

        let filtered = match self.filters.apply_pipeline(value, &pipeline) {
            Ok(v) => v,
            Err(err) if !self.strict => {
                // One broken expression must not take the page down.
                warn!(expr = e, error = %err, "filter pipeline failed, emitting placeholder");
                state.out.push_str("<!-- template error -->");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let s = filtered.to_display_string();
        // `raw` as the last stage opts out of escaping; an explicit
        // `escape` stage already produced escaped output.
        let already_safe = matches!(
            filters.last().map(|f| f.name.as_str()),
            Some("raw") | Some("escape")
        );
        if self.auto_escape && !already_safe {
            state.out.push_str(&html_escape(&s));
        } else {
            state.out.push_str(&s);
        }
        Ok(())
    }

    fn render_for(
        &self,
        item: &str,
        iterable: &str,
        body: &[Node],
        state: &mut RenderState,
    ) -> Result<(), TplError> {
        let collection = match expr::resolve(iterable, &state.ctx) {
            Value::List(items) => items,
            // Empty or non-iterable renders nothing.
            _ => return Ok(()),
        };
        for element in collection {
            let depth = state.ctx.depth();
            state.ctx.push(item, element);
            let result = self.walk(body, state);
            // The binding and anything pushed inside the body must not
            // leak into the next iteration or the outer scope.
            state.ctx.truncate(depth);
            result?;
        }
        Ok(())
    }

    fn render_block(
        &self,
        name: &str,
        own_body: &[Node],
        state: &mut RenderState,
    ) -> Result<(), TplError> {
        match state.frames.find(name, 0) {
            Some((idx, body)) => {
                let body = body.to_vec();
                state.block_pos.push((name.to_string(), idx));
                let result = self.walk(&body, state);
                state.block_pos.pop();
                result
            }
            None => self.walk(own_body, state),
        }
    }

    fn render_parent_block(&self, state: &mut RenderState) -> Result<(), TplError> {
        let Some((name, idx)) = state.block_pos.last().cloned() else {
            // parent() outside a block renders nothing.
            return Ok(());
        };
        let Some((parent_idx, body)) = state.frames.find(&name, idx + 1) else {
            return Ok(());
        };
        let body = body.to_vec();
        state.block_pos.push((name, parent_idx));
        let result = self.walk(&body, state);
        state.block_pos.pop();
        result
    }

    /// Includes render through the engine's load pipeline with the
    /// includer's current data scope but a fresh block stack: an included
    /// partial's blocks never participate in the including template's
    /// inheritance (isolated-scope policy).
    fn render_include(&self, name: &str, state: &mut RenderState) -> Result<(), TplError> {
        if state.active.iter().any(|n| n == name) {
            let err = TplError::IncludeCycle(format!(
                "{} -> {}",
                state.active.join(" -> "),
                name
            ));
            if self.strict {
                return Err(err);
            }
            warn!(include = name, "include cycle detected, emitting placeholder");
            state.out.push_str("<!-- template error: include cycle -->");
            return Ok(());
        }

        let included = match self.loader.load(name) {
            Ok(t) => t,
            Err(err) => {
                if self.strict {
                    return Err(err);
                }
                warn!(include = name, error = %err, "include failed, emitting placeholder");
                state.out.push_str("<!-- template error: include failed -->");
                return Ok(());
            }
        };

        let depth = state.ctx.depth();
        let result = self.render_template(name, &included, state);
        state.ctx.truncate(depth);
        match result {
            Ok(()) => Ok(()),
            Err(err) if !self.strict => {
                warn!(include = name, error = %err, "include render failed, emitting placeholder");
                state.out.push_str("<!-- template error: include failed -->");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::FilterRegistry;
    use crate::parser::{TemplateParser, group_tokens};
    use crate::path::PathResolver;
    use crate::serializer::to_value;
    use crate::tokenizer::tokenize;
    use serde::Serialize;
    use std::collections::HashMap;

    struct NoLoader;
    impl TemplateLoader for NoLoader {
        fn load(&self, name: &str) -> Result<Arc<ParsedTemplate>, TplError> {
            Err(TplError::NotFound(name.to_string()))
        }
    }

    fn parse_source(src: &str) -> ParsedTemplate {
        let nodes = group_tokens(tokenize(src, "test").unwrap(), "test").unwrap();
        let mut blocks = std::collections::BTreeMap::new();
        fn collect(nodes: &[Node], blocks: &mut std::collections::BTreeMap<String, Vec<Node>>) {
            for n in nodes {
                if let Node::Block { name, body } = n {
                    blocks.insert(name.clone(), body.clone());
                    collect(body, blocks);
                }
            }
        }
        collect(&nodes, &mut blocks);
        ParsedTemplate {
            nodes,
            template_path: "test".to_string(),
            parent: None,
            blocks,
            dependencies: Default::default(),
        }
    }

    fn render_str<T: Serialize>(src: &str, data: &T) -> String {
        let filters = FilterManager::new(FilterRegistry::with_builtins(None));
        let renderer = TemplateRenderer::new(&filters, &NoLoader, true, true);
        renderer
            .render("test", &parse_source(src), to_value(data))
            .unwrap()
    }

    #[test]
    fn test_hello_upper() {
        let mut data = HashMap::new();
        data.insert("name", "ada");
        assert_eq!(render_str("Hello {{ name|upper }}!", &data), "Hello ADA!");
    }

    #[test]
    fn test_if_else_guest() {
        #[derive(Serialize)]
        struct User {
            name: String,
        }
        #[derive(Serialize)]
        struct Data {
            user: Option<User>,
        }
        let src = "{% if user %}Welcome {{ user.name }}{% else %}Guest{% endif %}";
        assert_eq!(render_str(src, &Data { user: None }), "Guest");
        assert_eq!(
            render_str(
                src,
                &Data {
                    user: Some(User {
                        name: "Li".to_string()
                    })
                }
            ),
            "Welcome Li"
        );
    }

    #[test]
    fn test_for_list_literal() {
        let src = "{% for n in [1,2,3] %}{{ n }},{% endfor %}";
        assert_eq!(render_str(src, &()), "1,2,3,");
    }

    #[test]
    fn test_for_over_data_collection() {
        #[derive(Serialize)]
        struct Data {
            items: Vec<String>,
        }
        let src = "{% for item in items %}[{{ item }}]{% endfor %}";
        assert_eq!(
            render_str(
                src,
                &Data {
                    items: vec!["a".to_string(), "b".to_string()]
                }
            ),
            "[a][b]"
        );
    }

    #[test]
    fn test_empty_collection_renders_nothing() {
        #[derive(Serialize)]
        struct Data {
            items: Vec<i32>,
        }
        let src = "x{% for i in items %}{{ i }}{% endfor %}y";
        assert_eq!(render_str(src, &Data { items: vec![] }), "xy");
        // Non-iterable is also silent.
        assert_eq!(render_str("x{% for i in missing %}{{ i }}{% endfor %}y", &()), "xy");
    }

    #[test]
    fn test_loop_variable_does_not_leak() {
        let src = "{% for n in [1] %}{{ n }}{% endfor %}|{{ n }}";
        assert_eq!(render_str(src, &()), "1|");
    }

    #[test]
    fn test_sequential_loops_no_stale_binding() {
        #[derive(Serialize)]
        struct Data {
            a: Vec<i32>,
            b: Vec<i32>,
        }
        let src = "{% for n in a %}{{ n }}{% endfor %}-{% for n in b %}{{ n }}{% endfor %}";
        assert_eq!(
            render_str(src, &Data { a: vec![1], b: vec![2] }),
            "1-2"
        );
    }

    #[test]
    fn test_auto_escape_and_raw() {
        let mut data = HashMap::new();
        data.insert("html", "<b>&\"</b>");
        assert_eq!(
            render_str("{{ html }}", &data),
            "&lt;b&gt;&amp;&quot;&lt;/b&gt;"
        );
        assert_eq!(render_str("{{ html|raw }}", &data), "<b>&\"</b>");
    }

    #[test]
    fn test_explicit_escape_not_double_escaped() {
        let mut data = HashMap::new();
        data.insert("html", "<p>");
        assert_eq!(render_str("{{ html|escape }}", &data), "&lt;p&gt;");
    }

    #[test]
    fn test_missing_variable_renders_empty() {
        assert_eq!(render_str("[{{ missing }}]", &()), "[]");
        assert_eq!(render_str("[{{ user.name }}]", &()), "[]");
    }

    #[test]
    fn test_unknown_filter_strict_errors() {
        let filters = FilterManager::new(FilterRegistry::with_builtins(None));
        let renderer = TemplateRenderer::new(&filters, &NoLoader, true, true);
        let tpl = parse_source("{{ x|nope }}");
        match renderer.render("test", &tpl, Value::Null) {
            Err(TplError::UnknownFilter(name)) => assert_eq!(name, "nope"),
            other => panic!("Expected UnknownFilter, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_filter_lenient_placeholder() {
        let filters = FilterManager::new(FilterRegistry::with_builtins(None));
        let renderer = TemplateRenderer::new(&filters, &NoLoader, true, false);
        let tpl = parse_source("a{{ x|nope }}b");
        let out = renderer.render("test", &tpl, Value::Null).unwrap();
        assert_eq!(out, "a<!-- template error -->b");
    }

    #[test]
    fn test_arithmetic_in_interpolation() {
        #[derive(Serialize)]
        struct Data {
            total: i64,
            count: i64,
        }
        assert_eq!(
            render_str("{{ total / count }}", &Data { total: 10, count: 4 }),
            "2.5"
        );
        assert_eq!(
            render_str("{{ total / count }}", &Data { total: 10, count: 0 }),
            "0"
        );
    }

    #[test]
    fn test_block_without_inheritance_renders_inline() {
        let src = "A{% block mid %}B{% endblock %}C";
        assert_eq!(render_str(src, &()), "ABC");
    }

    #[test]
    fn test_degraded_render_skips_control_flow() {
        let filters = FilterManager::new(FilterRegistry::with_builtins(None));
        let renderer = TemplateRenderer::new(&filters, &NoLoader, true, false);
        let tpl = parse_source("hi {{ name }}{% if x %}never{% endif %}");
        let mut data = HashMap::new();
        data.insert("name", "a&b");
        let out = renderer.render_degraded(&tpl, to_value(&data));
        assert_eq!(out, "hi a&amp;b");
    }

    #[test]
    fn test_include_missing_lenient() {
        let filters = FilterManager::new(FilterRegistry::with_builtins(None));
        let renderer = TemplateRenderer::new(&filters, &NoLoader, true, false);
        let tpl = parse_source("a{% include \"gone\" %}b");
        let out = renderer.render("test", &tpl, Value::Null).unwrap();
        assert_eq!(out, "a<!-- template error: include failed -->b");
    }

    // Inheritance across real files is covered in tests/inheritance_test.rs;
    // here we exercise the block stack directly.
    #[test]
    fn test_block_override_via_frames() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("base.tpl"),
            "<t>{% block title %}A{% endblock %}</t>",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("child.tpl"),
            "{% extends \"base\" %}{% block title %}B{% endblock %}",
        )
        .unwrap();

        let resolver = PathResolver::new(vec![dir.path().to_path_buf()]);
        struct ParserLoader(PathResolver);
        impl TemplateLoader for ParserLoader {
            fn load(&self, name: &str) -> Result<Arc<ParsedTemplate>, TplError> {
                Ok(Arc::new(TemplateParser::new(&self.0).parse(name)?))
            }
        }
        let loader = ParserLoader(resolver.clone());
        let child = TemplateParser::new(&resolver).parse("child").unwrap();

        let filters = FilterManager::new(FilterRegistry::with_builtins(None));
        let renderer = TemplateRenderer::new(&filters, &loader, true, true);
        let out = renderer.render("child", &child, Value::Null).unwrap();
        assert_eq!(out, "<t>B</t>");
    }
}
