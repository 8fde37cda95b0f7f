use crate::cache::TemplateCache;
use crate::error::TplError;
use crate::filters::{FilterManager, FilterRegistry, Translator};
use crate::parser::{Node, ParsedTemplate, TemplateParser};
use crate::path::PathResolver;
use crate::render::{TemplateLoader, TemplateRenderer};
use crate::serializer::to_value;
use crate::value::Value;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Engine configuration. `debug` picks surface-vs-degrade behavior: in
/// debug mode template bugs return errors with full context; in production
/// mode the engine always returns displayable HTML, degrading broken pieces
/// to inert placeholders.
pub struct EngineOptions {
    pub search_paths: Vec<PathBuf>,
    pub cache_dir: PathBuf,
    pub default_extension: String,
    pub auto_escape: bool,
    pub debug: bool,
    pub translator: Option<Arc<dyn Translator>>,
}

impl EngineOptions {
    pub fn new(search_paths: Vec<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            search_paths,
            cache_dir: cache_dir.into(),
            default_extension: "tpl".to_string(),
            auto_escape: true,
            debug: false,
            translator: None,
        }
    }
}

/// Top-level façade: resolve → cache check → parse on miss → store → render.
pub struct TemplateEngine {
    resolver: PathResolver,
    cache: TemplateCache,
    filters: FilterManager,
    auto_escape: bool,
    debug: bool,
}

struct EngineLoader<'a>(&'a TemplateEngine);

impl TemplateLoader for EngineLoader<'_> {
    fn load(&self, name: &str) -> Result<Arc<ParsedTemplate>, TplError> {
        self.0.load_parsed(name, &[])
    }
}

impl TemplateEngine {
    pub fn new(options: EngineOptions) -> Self {
        let resolver = PathResolver::new(options.search_paths)
            .with_extension(options.default_extension);
        let cache = TemplateCache::new(options.cache_dir);
        let filters = FilterManager::new(FilterRegistry::with_builtins(options.translator));
        Self {
            resolver,
            cache,
            filters,
            auto_escape: options.auto_escape,
            debug: options.debug,
        }
    }

    /// Registers a template root under a namespace (`@name/...`).
    pub fn add_namespace(&mut self, name: impl Into<String>, root: impl Into<PathBuf>) {
        self.resolver.add_namespace(name, root);
    }

    /// Registers or overrides a filter. Applications call this at startup;
    /// the table is fixed for the engine's lifetime after that.
    pub fn register_filter(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&Value, &[Value]) -> Result<Value, TplError> + Send + Sync + 'static,
    ) {
        self.filters.registry_mut().register(name, f);
    }

    /// Renders a template against serializable data.
    ///
    /// In production mode this only fails for an unresolvable top-level
    /// template; everything else degrades internally to placeholder
    /// comments or a best-effort text/variable render.
    pub fn render<T: Serialize>(&self, name: &str, data: &T) -> Result<String, TplError> {
        self.render_value(name, to_value(data), &[])
    }

    /// Like `render`, but the stored cache entry carries tags for later
    /// bulk invalidation via `invalidate_tag`.
    pub fn render_tagged<T: Serialize>(
        &self,
        name: &str,
        data: &T,
        tags: &[String],
    ) -> Result<String, TplError> {
        self.render_value(name, to_value(data), tags)
    }

    /// Fragment-cached render for widgets: a positive TTL serves a stored
    /// fragment keyed by template name plus data until it expires.
    pub fn render_widget<T: Serialize>(
        &self,
        name: &str,
        data: &T,
        ttl_seconds: u64,
    ) -> Result<String, TplError> {
        let value = to_value(data);
        let key = fragment_key(name, &value);

        if ttl_seconds > 0 {
            if let Some(content) = self.cache.get_fragment(&key) {
                debug!(template = name, "fragment cache hit");
                return Ok(content);
            }
        }

        let content = self.render_value(name, value, &[])?;
        if ttl_seconds > 0 {
            self.cache.store_fragment(&key, &content, ttl_seconds);
        }
        Ok(content)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.resolver.exists(name)
    }

    pub fn clear_cache(&self, name: &str) -> bool {
        self.cache.remove(name)
    }

    pub fn clear_all_cache(&self) -> bool {
        self.cache.clear_all()
    }

    /// Removes every cache entry stored with the given tag.
    pub fn invalidate_tag(&self, tag: &str) {
        self.cache.invalidate_by_tag(tag);
    }

    fn render_value(&self, name: &str, data: Value, tags: &[String]) -> Result<String, TplError> {
        let template = self.load_parsed(name, tags)?;
        let loader = EngineLoader(self);
        let renderer =
            TemplateRenderer::new(&self.filters, &loader, self.auto_escape, self.debug);

        match renderer.render(name, &template, data.clone()) {
            Ok(out) => Ok(out),
            Err(err) if !self.debug => {
                // Emergency degraded rendering: the page still completes.
                error!(template = name, error = %err, "render failed, degrading to text/variable walk");
                Ok(renderer.render_degraded(&template, data))
            }
            Err(err) => Err(err),
        }
    }

    /// Cache-or-parse. `TemplateNotFound` always surfaces: a template that
    /// cannot be resolved at all is a hard failure. A parse failure in
    /// production degrades to an inert placeholder template (not cached) so
    /// one broken file cannot take down the response.
    fn load_parsed(&self, name: &str, tags: &[String]) -> Result<Arc<ParsedTemplate>, TplError> {
        let path = self.resolver.resolve(name)?;

        if let Some(cached) = self.cache.load(name) {
            debug!(template = name, "compiled-template cache hit");
            return Ok(cached);
        }

        let parser = TemplateParser::new(&self.resolver);
        match parser.parse(name) {
            Ok(template) => {
                self.cache.store(name, &template, tags);
                Ok(Arc::new(template))
            }
            Err(err @ TplError::NotFound(_)) => Err(err),
            Err(err) if !self.debug => {
                warn!(template = name, error = %err, "parse failed, serving placeholder");
                Ok(Arc::new(placeholder_template(
                    &path.to_string_lossy(),
                    &err,
                )))
            }
            Err(err) => Err(err),
        }
    }
}

fn placeholder_template(path: &str, err: &TplError) -> ParsedTemplate {
    ParsedTemplate {
        nodes: vec![Node::Text(format!("<!-- template error: {} -->", err))],
        template_path: path.to_string(),
        parent: None,
        blocks: Default::default(),
        dependencies: Default::default(),
    }
}

/// Fragment keys hash the template name together with the serialized data
/// so distinct data sets cache independently. Maps are hashed in their
/// key-sorted JSON form: `HashMap` iteration order varies per instance, and
/// equal data must always land on the same fragment.
fn fragment_key(name: &str, data: &Value) -> String {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    crate::builtin_filters::value_to_json(data)
        .to_string()
        .hash(&mut hasher);
    format!("{}:{:016x}", name, hasher.finish())
}
