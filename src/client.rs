//! Unified evaluation dispatch over a loaded engine binding.

use std::sync::Arc;

use serde_json::Value;

use crate::binding::{EngineBinding, FunctionRegistration, NativeBinding};
use crate::error::Result;

/// Client handle over the engine: one `evaluate` entry point that routes to
/// the right engine primitive, plus registry passthroughs.
///
/// Routing is decided per call from live registry state; nothing is cached,
/// so registering or unregistering a function between two calls is reflected
/// by the very next one.
#[derive(Clone)]
pub struct GriddleClient {
    binding: Arc<dyn EngineBinding>,
}

impl GriddleClient {
    /// Connect to the process-wide native engine binding, loading it on
    /// first use.
    pub fn connect() -> Result<Self> {
        let binding = NativeBinding::global()?.clone();
        Ok(Self::with_binding(Arc::new(binding)))
    }

    /// Build a client over an explicit binding implementation.
    pub fn with_binding(binding: Arc<dyn EngineBinding>) -> Self {
        Self { binding }
    }

    /// Evaluate a formula, choosing the engine primitive from live registry
    /// state and the shape of `vars`.
    ///
    /// `None` and `Some(Value::Null)` both mean "no variables supplied".
    /// While any custom function is registered, the custom-aware primitive
    /// is used regardless of whether this particular formula references one:
    /// the engine cannot know statically whether it will. With no custom
    /// functions, variable-bearing calls use the variable-aware synchronous
    /// primitive and bare calls use the zero-variable one; both complete
    /// without suspension behind the same async contract.
    pub async fn evaluate(&self, formula: &str, vars: Option<Value>) -> Result<Value> {
        let vars = match vars {
            None | Some(Value::Null) => None,
            Some(other) => Some(other),
        };

        let registered = self.binding.list_custom_functions();
        if !registered.is_empty() {
            log::trace!(
                "routing to custom-aware evaluation ({} function(s) registered)",
                registered.len()
            );
            self.binding
                .eval_formula_with_custom(formula, vars.as_ref())
                .await
        } else if let Some(vars) = vars {
            log::trace!("routing to variable-aware evaluation");
            self.binding.eval_formula_with(formula, &vars)
        } else {
            log::trace!("routing to zero-variable evaluation");
            self.binding.eval_formula(formula)
        }
    }

    /// Register or replace a custom function in the engine registry.
    pub fn register_function(&self, registration: FunctionRegistration) -> Result<()> {
        self.binding.register_function(registration)
    }

    /// Remove a custom function registration.
    ///
    /// Never fails: `false` reports that the name was not registered.
    pub fn unregister_function(&self, name: &str) -> bool {
        self.binding.unregister_function(name)
    }

    /// Names currently registered with the engine, in registration order.
    pub fn list_custom_functions(&self) -> Vec<String> {
        self.binding.list_custom_functions()
    }

    /// Engine version identifier.
    pub fn version(&self) -> String {
        self.binding.version()
    }

    /// Zero-variable synchronous evaluation, bypassing dispatch.
    pub fn eval_formula(&self, formula: &str) -> Result<Value> {
        self.binding.eval_formula(formula)
    }

    /// Variable-aware synchronous evaluation, bypassing dispatch.
    pub fn eval_formula_with(&self, formula: &str, vars: &Value) -> Result<Value> {
        self.binding.eval_formula_with(formula, vars)
    }

    /// Custom-function-aware evaluation, bypassing dispatch.
    pub async fn eval_formula_with_custom(
        &self,
        formula: &str,
        vars: Option<&Value>,
    ) -> Result<Value> {
        self.binding.eval_formula_with_custom(formula, vars).await
    }
}

impl std::fmt::Debug for GriddleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GriddleClient").finish_non_exhaustive()
    }
}
