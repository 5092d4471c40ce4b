//! Action model collaborator surface
//!
//! The action/type model (definitions, parameter typing, inheritance,
//! persistence) is maintained outside this engine. These traits are the
//! surface the engine requires from it, together with an in-memory catalog
//! and two plain parameter types that hosts and tests can register directly.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::error::MarshalError;
use super::invocation::Invocation;
use super::message::ErrorInfo;

/// Runtime parameter value
pub type Value = serde_json::Value;

/// Marshaling contract of one parameter position
pub trait ParamType: Send + Sync {
    /// Convert a runtime value to its wire form.
    fn marshal(&self, value: &Value) -> Result<String, MarshalError>;

    /// Convert a wire form back to a runtime value.
    fn unmarshal(&self, wire: &str) -> Result<Value, MarshalError>;

    /// Serialized size of a wire form, used for the payload size limit.
    fn wire_size(&self, wire: &str) -> usize {
        wire.len()
    }
}

/// Parameter type whose wire form is the raw text of a string value
pub struct TextParam;

impl ParamType for TextParam {
    fn marshal(&self, value: &Value) -> Result<String, MarshalError> {
        match value {
            Value::String(s) => Ok(s.clone()),
            other => Err(MarshalError::Value(format!(
                "expected a string value, got {other}"
            ))),
        }
    }

    fn unmarshal(&self, wire: &str) -> Result<Value, MarshalError> {
        Ok(Value::String(wire.to_string()))
    }
}

/// Parameter type whose wire form is the JSON encoding of the value
pub struct JsonParam;

impl ParamType for JsonParam {
    fn marshal(&self, value: &Value) -> Result<String, MarshalError> {
        serde_json::to_string(value).map_err(|e| MarshalError::Value(e.to_string()))
    }

    fn unmarshal(&self, wire: &str) -> Result<Value, MarshalError> {
        serde_json::from_str(wire).map_err(|e| MarshalError::Value(e.to_string()))
    }
}

/// Component that actually carries out an action
///
/// Executors run on a dedicated worker thread and drive the invocation they
/// are handed: binding output parameters, reporting breakpoints when
/// stepped. Returning an error fails the invocation.
pub trait ActionExecutor: Send + Sync {
    /// Carry out the action for one invocation.
    fn execute(&self, invocation: &Arc<Invocation>) -> Result<(), ErrorInfo>;
}

/// Opaque handle into the external action model for one definition
pub trait ActionDefinition: Send + Sync {
    /// Name this definition is registered under.
    fn name(&self) -> &str;

    /// Number of input parameters. Inputs occupy positions
    /// `0..num_inputs()`; outputs occupy the rest.
    fn num_inputs(&self) -> usize;

    /// Total number of parameters, inputs and outputs.
    fn num_params(&self) -> usize;

    /// Marshaling contract for the parameter at `index`.
    fn param_type(&self, index: usize) -> Arc<dyn ParamType>;

    /// Executor registered in this process, if any.
    fn local_executor(&self) -> Option<Arc<dyn ActionExecutor>>;

    /// Whether the given executor is the procedure-learning engine. The
    /// dispatcher declines requests for learning-engine actions; the engine
    /// claims its own work.
    fn is_learning_engine(&self, _executor: &Arc<dyn ActionExecutor>) -> bool {
        false
    }
}

/// Lookup surface of the external action model
pub trait ActionModel: Send + Sync {
    /// Resolve a definition by name.
    fn lookup(&self, name: &str) -> Option<Arc<dyn ActionDefinition>>;
}

/// In-memory action model
///
/// A plain catalog of definitions keyed by name. Constructed by the host and
/// injected into the engine; registration after construction is visible to
/// subsequent lookups.
pub struct ActionCatalog {
    actions: RwLock<HashMap<String, Arc<dyn ActionDefinition>>>,
}

impl ActionCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a definition under its own name, replacing any previous one
    pub fn register(&self, definition: Arc<dyn ActionDefinition>) {
        let mut actions = self.actions.write();
        actions.insert(definition.name().to_string(), definition);
    }

    /// Check whether a definition is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.actions.read().contains_key(name)
    }

    /// List all registered action names
    pub fn list(&self) -> Vec<String> {
        self.actions.read().keys().cloned().collect()
    }
}

impl Default for ActionCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionModel for ActionCatalog {
    fn lookup(&self, name: &str) -> Option<Arc<dyn ActionDefinition>> {
        self.actions.read().get(name).cloned()
    }
}

/// Straightforward definition backed by per-position parameter types
pub struct SimpleAction {
    name: String,
    num_inputs: usize,
    param_types: Vec<Arc<dyn ParamType>>,
    executor: Option<Arc<dyn ActionExecutor>>,
    learning: bool,
}

impl SimpleAction {
    /// Create a definition with `inputs` input and `outputs` output
    /// parameters, all typed as [`TextParam`]
    pub fn new(name: impl Into<String>, inputs: usize, outputs: usize) -> Self {
        let text: Arc<dyn ParamType> = Arc::new(TextParam);
        Self {
            name: name.into(),
            num_inputs: inputs,
            param_types: vec![text; inputs + outputs],
            executor: None,
            learning: false,
        }
    }

    /// Replace the parameter type at `index`
    pub fn with_param_type(mut self, index: usize, param_type: Arc<dyn ParamType>) -> Self {
        self.param_types[index] = param_type;
        self
    }

    /// Attach a local executor
    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Mark the attached executor as the procedure-learning engine
    pub fn learning_engine(mut self) -> Self {
        self.learning = true;
        self
    }
}

impl ActionDefinition for SimpleAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    fn num_params(&self) -> usize {
        self.param_types.len()
    }

    fn param_type(&self, index: usize) -> Arc<dyn ParamType> {
        self.param_types[index].clone()
    }

    fn local_executor(&self) -> Option<Arc<dyn ActionExecutor>> {
        self.executor.clone()
    }

    fn is_learning_engine(&self, _executor: &Arc<dyn ActionExecutor>) -> bool {
        self.learning
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_param_roundtrip() {
        let param = TextParam;
        let wire = param.marshal(&Value::String("doc.txt".into())).unwrap();
        assert_eq!(wire, "doc.txt");
        assert_eq!(param.unmarshal(&wire).unwrap(), Value::String("doc.txt".into()));
        assert_eq!(param.wire_size(&wire), 7);
    }

    #[test]
    fn test_text_param_rejects_non_string() {
        let param = TextParam;
        assert!(param.marshal(&serde_json::json!(42)).is_err());
    }

    #[test]
    fn test_json_param_roundtrip() {
        let param = JsonParam;
        let value = serde_json::json!({"path": "doc.txt", "lines": 3});
        let wire = param.marshal(&value).unwrap();
        assert_eq!(param.unmarshal(&wire).unwrap(), value);
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = ActionCatalog::new();
        assert!(catalog.lookup("Open").is_none());

        catalog.register(Arc::new(SimpleAction::new("Open", 1, 0)));
        let def = catalog.lookup("Open").unwrap();
        assert_eq!(def.name(), "Open");
        assert_eq!(def.num_inputs(), 1);
        assert_eq!(def.num_params(), 1);
        assert!(def.local_executor().is_none());
        assert!(catalog.contains("Open"));
    }
}
