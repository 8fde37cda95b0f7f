//! utpl — HTML template engine with inheritance, filters and a compiled-
//! template cache.
//!
//! Pipeline: tokenizer → control-flow grouping → `ParsedTemplate` →
//! disk cache (dependency-mtime invalidation) → renderer. The
//! [`TemplateEngine`] façade ties it together:
//!
//! ```no_run
//! use utpl::{EngineOptions, TemplateEngine};
//! use std::collections::HashMap;
//!
//! let engine = TemplateEngine::new(EngineOptions::new(
//!     vec!["templates".into()],
//!     "cache/templates",
//! ));
//! let mut data = HashMap::new();
//! data.insert("name", "ada");
//! let html = engine.render("hello", &data).unwrap();
//! ```

mod builtin_filters;
mod cache;
mod engine;
mod error;
mod expr;
mod filters;
mod parser;
mod path;
mod render;
mod render_context;
mod serializer;
mod tokenizer;
mod value;

pub use builtin_filters::html_escape;
pub use cache::{CACHE_VERSION, TemplateCache};
pub use engine::{EngineOptions, TemplateEngine};
pub use error::TplError;
pub use filters::{FilterExecutor, FilterManager, FilterRegistry, Translator};
pub use parser::{Node, ParsedTemplate, TemplateParser};
pub use path::PathResolver;
pub use render::{TemplateLoader, TemplateRenderer};
pub use serializer::to_value;
pub use tokenizer::FilterCall;
pub use value::Value;
