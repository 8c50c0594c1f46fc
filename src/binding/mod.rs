//! The engine binding surface: the three evaluation primitives plus the
//! custom-function registry.
//!
//! The engine owns the authoritative registry. Implementations must answer
//! [`EngineBinding::list_custom_functions`] from live engine state, never
//! from a cache, because the dispatcher re-queries it on every call.

mod native;

pub use native::NativeBinding;

use std::fmt;
use std::sync::Arc;
use std::sync::mpsc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::Result;

/// Outcome a custom function settles its call with: the computed value, or
/// an error message surfaced through the enclosing evaluation.
pub type CompletionResult = std::result::Result<Value, String>;

/// Callback signature for caller-supplied custom functions.
///
/// A handler receives the call context, the already-evaluated argument
/// values, and a [`Completion`] it must settle exactly once. The handler may
/// settle from another thread after performing its own asynchronous work. A
/// handler that keeps its completion alive without ever settling it hangs
/// the enclosing evaluation; the engine provides no timeout and neither does
/// this layer.
pub type FunctionHandler = Arc<dyn Fn(CallContext, Vec<Value>, Completion) + Send + Sync>;

/// Context passed to a custom function handler.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Name the function was registered, and is being invoked, under.
    pub name: String,
}

/// One-shot completion slot for a custom function call.
///
/// The first [`resolve`](Completion::resolve) or
/// [`reject`](Completion::reject) settles the call; later settlements are
/// inert. Dropping an unsettled completion surfaces as an evaluation error
/// ("did not respond") rather than a hang.
pub struct Completion {
    slot: Mutex<Option<mpsc::Sender<CompletionResult>>>,
}

impl Completion {
    /// Create a completion together with the receiver the evaluation blocks
    /// on.
    pub fn channel() -> (Self, mpsc::Receiver<CompletionResult>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                slot: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Settle the call with a computed value.
    pub fn resolve(&self, value: Value) {
        if let Some(tx) = self.slot.lock().take() {
            let _ = tx.send(Ok(value));
        }
    }

    /// Settle the call with an error message.
    pub fn reject(&self, message: impl Into<String>) {
        if let Some(tx) = self.slot.lock().take() {
            let _ = tx.send(Err(message.into()));
        }
    }

    /// Whether the call has already been settled.
    pub fn is_settled(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// A custom function registration, forwarded verbatim to the engine
/// registry.
///
/// Names are unique and case-sensitive; registering an existing name
/// replaces it. Arity bounds are enforced by the engine, not here.
#[derive(Clone)]
pub struct FunctionRegistration {
    /// Unique, case-sensitive function name.
    pub name: String,
    /// Handler invoked when the engine evaluates a call to `name`.
    pub handler: FunctionHandler,
    /// Minimum accepted argument count.
    pub min_args: usize,
    /// Maximum accepted argument count; `None` means unbounded.
    pub max_args: Option<usize>,
}

impl FunctionRegistration {
    /// Create a registration from a plain closure.
    pub fn new(
        name: impl Into<String>,
        min_args: usize,
        max_args: Option<usize>,
        handler: impl Fn(CallContext, Vec<Value>, Completion) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            min_args,
            max_args,
        }
    }
}

impl fmt::Debug for FunctionRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistration")
            .field("name", &self.name)
            .field("min_args", &self.min_args)
            .field("max_args", &self.max_args)
            .finish_non_exhaustive()
    }
}

/// The primitives exposed by a loaded engine.
///
/// The production implementation is [`NativeBinding`]; tests substitute
/// their own binding to observe routing decisions.
#[async_trait]
pub trait EngineBinding: Send + Sync {
    /// Zero-variable synchronous evaluation.
    fn eval_formula(&self, formula: &str) -> Result<Value>;

    /// Variable-aware synchronous evaluation.
    fn eval_formula_with(&self, formula: &str, vars: &Value) -> Result<Value>;

    /// Custom-function-aware evaluation. May suspend while registered
    /// handlers run their own asynchronous work.
    async fn eval_formula_with_custom(&self, formula: &str, vars: Option<&Value>)
    -> Result<Value>;

    /// Register or replace a custom function in the engine registry.
    fn register_function(&self, registration: FunctionRegistration) -> Result<()>;

    /// Remove a registration; `true` if the name was present.
    fn unregister_function(&self, name: &str) -> bool;

    /// Names currently registered with the engine, in registration order.
    fn list_custom_functions(&self) -> Vec<String>;

    /// Engine version identifier.
    fn version(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completion_delivers_first_settlement_only() {
        let (completion, rx) = Completion::channel();
        assert!(!completion.is_settled());

        completion.resolve(json!(42));
        completion.resolve(json!(7));
        completion.reject("too late");

        assert!(completion.is_settled());
        assert_eq!(rx.recv().unwrap(), Ok(json!(42)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn completion_carries_rejections() {
        let (completion, rx) = Completion::channel();
        completion.reject("handler failed");
        assert_eq!(rx.recv().unwrap(), Err("handler failed".to_string()));
    }

    #[test]
    fn dropping_an_unsettled_completion_closes_the_channel() {
        let (completion, rx) = Completion::channel();
        drop(completion);
        assert!(rx.recv().is_err());
    }
}
