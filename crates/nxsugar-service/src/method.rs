use async_trait::async_trait;
use nxsugar_core::{JsonRpcError, Task, METADATA_KEY};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result type for method handlers
pub type MethodResult = Result<Value, JsonRpcError>;

/// Trait for method handlers
#[async_trait]
pub trait Handler: Send + Sync {
    /// Serve the task. The returned value or error becomes the reply
    /// unless the handler already replied.
    async fn call(&self, task: &mut Task) -> MethodResult;
}

/// Handler built from a plain closure, see [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap a synchronous closure as a [`Handler`].
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&Task) -> MethodResult + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&Task) -> MethodResult + Send + Sync,
{
    async fn call(&self, task: &mut Task) -> MethodResult {
        (self.0)(task)
    }
}

/// Per-method logging switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodOptions {
    pub disable_pull_log: bool,
    pub enable_response_result_log: bool,
    pub enable_response_error_log: bool,
}

/// Recorded input/output pair answering mock calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pact {
    pub input: Value,
    pub output: Value,
}

impl Pact {
    pub fn new(input: Value, output: Value) -> Self {
        Pact { input, output }
    }

    /// Whether `params` equal the recorded input once the call's metadata is injected.
    /// Only object inputs can match.
    pub fn matches(&self, metadata: Option<&Value>, params: &Value) -> bool {
        let Value::Object(mut input) = self.input.clone() else {
            return false;
        };
        if let Some(metadata) = metadata {
            input.insert(METADATA_KEY.to_string(), metadata.clone());
        }
        Value::Object(input) == *params
    }
}

/// Schema documents attached to a method. Published by `@schema`, never enforced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pacts: Vec<Pact>,
}

/// A registered method.
pub struct Method {
    handler: Arc<dyn Handler>,
    test_handler: Option<Arc<dyn Handler>>,
    pub options: MethodOptions,
    pub schema: Option<MethodSchema>,
}

impl Method {
    pub fn new<H: Handler + 'static>(handler: H) -> Self {
        Method {
            handler: Arc::new(handler),
            test_handler: None,
            options: MethodOptions::default(),
            schema: None,
        }
    }

    pub fn with_test_handler<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.test_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_options(mut self, options: MethodOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_schema(mut self, schema: MethodSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn test_handler(&self) -> Option<&Arc<dyn Handler>> {
        self.test_handler.as_ref()
    }

    pub fn pacts(&self) -> &[Pact] {
        self.schema.as_ref().map(|s| s.pacts.as_slice()).unwrap_or(&[])
    }

    /// Entry published by `@schema` for this method.
    pub fn describe(&self) -> Value {
        self.schema
            .as_ref()
            .and_then(|s| serde_json::to_value(s).ok())
            .unwrap_or_else(|| Value::Object(Map::new()))
    }
}

/// How a task method name was resolved.
#[derive(Clone)]
pub enum Dispatch {
    /// A method registered under the task's name.
    Named(Arc<Method>),
    /// The catch-all handler, which takes every name.
    Global(Arc<Method>),
}

impl Dispatch {
    pub fn method(&self) -> &Arc<Method> {
        match self {
            Dispatch::Named(m) | Dispatch::Global(m) => m,
        }
    }
}

/// Registry of methods by name
pub struct MethodRegistry {
    methods: RwLock<BTreeMap<String, Arc<Method>>>,
    global: RwLock<Option<Arc<Method>>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        MethodRegistry {
            methods: RwLock::new(BTreeMap::new()),
            global: RwLock::new(None),
        }
    }

    /// Register a method, replacing any previous one with the same name
    pub fn register(&self, name: impl Into<String>, method: Method) {
        self.methods.write().insert(name.into(), Arc::new(method));
    }

    pub fn set_global(&self, method: Method) {
        *self.global.write() = Some(Arc::new(method));
    }

    pub fn has_global(&self) -> bool {
        self.global.read().is_some()
    }

    /// Resolve a task method name. The global handler takes priority.
    pub fn resolve(&self, name: &str) -> Option<Dispatch> {
        if let Some(global) = self.global.read().as_ref() {
            return Some(Dispatch::Global(global.clone()));
        }
        self.methods.read().get(name).cloned().map(Dispatch::Named)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.read().contains_key(name)
    }

    /// Nothing to dispatch to: no methods and no global handler.
    pub fn is_empty(&self) -> bool {
        self.methods.read().is_empty() && !self.has_global()
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.methods.read().keys().cloned().collect()
    }

    /// `{name: {input, result, error, pacts}}` for every registered method.
    pub fn schema(&self) -> Value {
        let methods = self.methods.read();
        let map: Map<String, Value> = methods
            .iter()
            .map(|(name, m)| (name.clone(), m.describe()))
            .collect();
        Value::Object(map)
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nxsugar_core::error::ERR_INVALID_PARAMS;
    use serde_json::json;

    fn echo() -> Method {
        Method::new(handler_fn(|task: &Task| Ok(task.params.clone())))
    }

    #[test]
    fn test_registry() {
        let registry = MethodRegistry::new();
        assert!(registry.is_empty());

        registry.register("echo", echo());
        assert!(registry.contains("echo"));
        assert!(!registry.contains("unknown"));
        assert!(matches!(registry.resolve("echo"), Some(Dispatch::Named(_))));
        assert!(registry.resolve("unknown").is_none());
    }

    #[test]
    fn test_global_handler_takes_priority() {
        let registry = MethodRegistry::new();
        registry.register("echo", echo());
        registry.set_global(Method::new(handler_fn(|_: &Task| {
            Err(JsonRpcError::from_code(ERR_INVALID_PARAMS))
        })));

        assert!(matches!(registry.resolve("echo"), Some(Dispatch::Global(_))));
        assert!(matches!(registry.resolve("anything"), Some(Dispatch::Global(_))));
        assert_eq!(registry.names(), vec!["echo".to_string()]);
    }

    #[test]
    fn test_pact_matching() {
        let pact = Pact::new(json!({"a": 1}), json!("one"));
        let meta = json!({"pact": true});

        assert!(pact.matches(Some(&meta), &json!({"a": 1, "@metadata": {"pact": true}})));
        assert!(!pact.matches(Some(&meta), &json!({"a": 2, "@metadata": {"pact": true}})));
        assert!(!pact.matches(Some(&meta), &json!({"a": 1})));

        let scalar = Pact::new(json!(1), json!("one"));
        assert!(!scalar.matches(Some(&meta), &json!(1)));
    }

    #[test]
    fn test_schema_description() {
        let registry = MethodRegistry::new();
        registry.register("echo", echo());
        registry.register(
            "sum",
            echo().with_schema(MethodSchema {
                input: Some(json!({"type": "object"})),
                pacts: vec![Pact::new(json!({"a": 1}), json!(1))],
                ..Default::default()
            }),
        );

        assert_eq!(
            registry.schema(),
            json!({
                "echo": {},
                "sum": {
                    "input": {"type": "object"},
                    "pacts": [{"input": {"a": 1}, "output": 1}],
                },
            })
        );
    }
}
