use crate::error::TplError;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A filter transforms a resolved value for display. Filters must be
/// null-safe: a `Value::Null` input yields the filter's documented safe
/// default, never an error.
pub type FilterFn = Box<dyn Fn(&Value, &[Value]) -> Result<Value, TplError> + Send + Sync>;

/// Message-catalog capability consumed by the `trans` / `trans_plural`
/// filters. Optional; rendering never breaks when no translator is wired.
pub trait Translator: Send + Sync {
    fn translate(&self, key: &str, params: &HashMap<String, Value>) -> String;
    fn translate_plural(&self, key: &str, count: i64, params: &HashMap<String, Value>) -> String;
}

/// Name → function table, built once at engine construction. The last
/// registration for a name wins, so applications can override built-ins.
#[derive(Default)]
pub struct FilterRegistry {
    filters: HashMap<String, FilterFn>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            filters: HashMap::new(),
        }
    }

    pub fn with_builtins(translator: Option<Arc<dyn Translator>>) -> Self {
        let mut registry = Self::new();
        crate::builtin_filters::register_builtins(&mut registry, translator);
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&Value, &[Value]) -> Result<Value, TplError> + Send + Sync + 'static,
    ) {
        self.filters.insert(name.into(), Box::new(f));
    }

    pub fn has(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<&FilterFn> {
        self.filters.get(name)
    }
}

/// Applies a single named filter; the only failure it introduces itself is
/// `UnknownFilter`.
pub struct FilterExecutor<'a> {
    registry: &'a FilterRegistry,
}

impl<'a> FilterExecutor<'a> {
    pub fn new(registry: &'a FilterRegistry) -> Self {
        Self { registry }
    }

    pub fn execute(&self, name: &str, value: &Value, args: &[Value]) -> Result<Value, TplError> {
        let f = self
            .registry
            .get(name)
            .ok_or_else(|| TplError::UnknownFilter(name.to_string()))?;
        f(value, args)
    }
}

/// Folds an ordered pipeline over a value, each stage feeding the next.
/// Stage errors propagate unchanged; the engine façade decides whether to
/// surface or degrade them.
pub struct FilterManager {
    registry: FilterRegistry,
}

impl FilterManager {
    pub fn new(registry: FilterRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut FilterRegistry {
        &mut self.registry
    }

    pub fn apply_pipeline(
        &self,
        value: Value,
        pipeline: &[(String, Vec<Value>)],
    ) -> Result<Value, TplError> {
        let executor = FilterExecutor::new(&self.registry);
        let mut current = value;
        for (name, args) in pipeline {
            current = executor.execute(name, &current, args)?;
        }
        Ok(current)
    }
}
