//! `libloading`-backed binding over the engine's C ABI.
//!
//! Values cross the boundary as JSON text. Strings allocated by the engine
//! are released through `griddle_string_free`; strings this side hands to
//! the engine (custom function results) are released by the engine through
//! the host-release callback installed at bind time.

use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::ptr;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::Value;

use super::{CallContext, Completion, EngineBinding, FunctionHandler, FunctionRegistration};
use crate::error::{GriddleError, LoadError, Result};
use crate::loader::{self, EngineHost, EngineModule};

type VersionFn = unsafe extern "C" fn() -> *mut c_char;
type EvalFn = unsafe extern "C" fn(
    formula: *const c_char,
    out_value: *mut *mut c_char,
    out_error: *mut *mut c_char,
) -> c_int;
type EvalWithFn = unsafe extern "C" fn(
    formula: *const c_char,
    vars_json: *const c_char,
    out_value: *mut *mut c_char,
    out_error: *mut *mut c_char,
) -> c_int;
type CustomCallbackFn = unsafe extern "C" fn(
    data: *mut c_void,
    args_json: *const c_char,
    out_value: *mut *mut c_char,
    out_error: *mut *mut c_char,
) -> c_int;
type RegisterFn = unsafe extern "C" fn(
    name: *const c_char,
    min_args: u32,
    max_args: i64,
    callback: CustomCallbackFn,
    data: *mut c_void,
) -> c_int;
type UnregisterFn = unsafe extern "C" fn(name: *const c_char) -> c_int;
type ListFn = unsafe extern "C" fn() -> *mut c_char;
type StringFreeFn = unsafe extern "C" fn(s: *mut c_char);
type HostReleaseFn = unsafe extern "C" fn(s: *mut c_char);
type SetHostReleaseFn = unsafe extern "C" fn(release: HostReleaseFn);

#[derive(Clone, Copy)]
struct EngineSymbols {
    version: VersionFn,
    eval: EvalFn,
    eval_with: EvalWithFn,
    eval_with_custom: EvalWithFn,
    register: RegisterFn,
    unregister: UnregisterFn,
    list: ListFn,
    string_free: StringFreeFn,
}

/// Closure storage backing one registered custom function. The box stays in
/// the handler table for as long as the engine may call the trampoline, so
/// the raw data pointer handed to the engine remains valid.
struct HandlerData {
    name: String,
    handler: FunctionHandler,
}

struct BindingInner {
    module: EngineModule,
    symbols: EngineSymbols,
    handlers: Mutex<HashMap<String, Box<HandlerData>>>,
}

/// The loaded native engine binding.
///
/// Cheap to clone; all clones share the same engine module and handler
/// table.
#[derive(Clone)]
pub struct NativeBinding {
    inner: Arc<BindingInner>,
}

static GLOBAL_BINDING: OnceCell<NativeBinding> = OnceCell::new();

impl NativeBinding {
    /// The process-wide binding, loaded on first use and never reassigned
    /// after a successful initialization.
    pub fn global() -> std::result::Result<&'static NativeBinding, LoadError> {
        GLOBAL_BINDING.get_or_try_init(|| {
            let host = EngineHost::with_default_roots();
            let module = loader::load_binding(&host)?;
            NativeBinding::from_module(module)
        })
    }

    /// Bind the C ABI symbols of a loaded engine module.
    pub fn from_module(module: EngineModule) -> std::result::Result<Self, LoadError> {
        let symbols = {
            let lib = module.library();
            macro_rules! bind {
                ($ty:ty, $name:literal) => {
                    unsafe {
                        *lib.get::<$ty>(concat!($name, "\0").as_bytes())
                            .map_err(|_| LoadError::missing_symbol($name))?
                    }
                };
            }
            let set_host_release = bind!(SetHostReleaseFn, "griddle_set_host_release");
            unsafe { set_host_release(host_string_release) };
            EngineSymbols {
                version: bind!(VersionFn, "griddle_version"),
                eval: bind!(EvalFn, "griddle_eval"),
                eval_with: bind!(EvalWithFn, "griddle_eval_with"),
                eval_with_custom: bind!(EvalWithFn, "griddle_eval_with_custom"),
                register: bind!(RegisterFn, "griddle_register_function"),
                unregister: bind!(UnregisterFn, "griddle_unregister_function"),
                list: bind!(ListFn, "griddle_list_functions"),
                string_free: bind!(StringFreeFn, "griddle_string_free"),
            }
        };

        Ok(Self {
            inner: Arc::new(BindingInner {
                module,
                symbols,
                handlers: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Path the engine module was loaded from.
    pub fn module_path(&self) -> &std::path::Path {
        self.inner.module.path()
    }

    /// Take ownership of an engine-allocated string, releasing the engine's
    /// allocation.
    fn take_engine_string(&self, ptr: *mut c_char) -> Option<String> {
        if ptr.is_null() {
            return None;
        }
        let text = unsafe { CStr::from_ptr(ptr) }
            .to_string_lossy()
            .into_owned();
        unsafe { (self.inner.symbols.string_free)(ptr) };
        Some(text)
    }

    fn finish_eval(
        &self,
        status: c_int,
        out_value: *mut c_char,
        out_error: *mut c_char,
    ) -> Result<Value> {
        // Always reclaim both out-strings, whichever one the status selects.
        let value_text = self.take_engine_string(out_value);
        let error_text = self.take_engine_string(out_error);
        if status == 0 {
            let text = value_text.unwrap_or_else(|| "null".to_string());
            serde_json::from_str(&text).map_err(|err| {
                GriddleError::evaluation(format!("engine returned malformed JSON: {err}"))
            })
        } else {
            let message =
                error_text.unwrap_or_else(|| "unknown engine failure".to_string());
            Err(GriddleError::evaluation(message))
        }
    }

    fn eval_with_custom_blocking(&self, formula: &str, vars_json: &str) -> Result<Value> {
        let formula = to_c_string(formula)?;
        let vars = to_c_string(vars_json)?;
        let mut out_value: *mut c_char = ptr::null_mut();
        let mut out_error: *mut c_char = ptr::null_mut();
        let status = unsafe {
            (self.inner.symbols.eval_with_custom)(
                formula.as_ptr(),
                vars.as_ptr(),
                &mut out_value,
                &mut out_error,
            )
        };
        self.finish_eval(status, out_value, out_error)
    }
}

#[async_trait]
impl EngineBinding for NativeBinding {
    fn eval_formula(&self, formula: &str) -> Result<Value> {
        let formula = to_c_string(formula)?;
        let mut out_value: *mut c_char = ptr::null_mut();
        let mut out_error: *mut c_char = ptr::null_mut();
        let status = unsafe {
            (self.inner.symbols.eval)(formula.as_ptr(), &mut out_value, &mut out_error)
        };
        self.finish_eval(status, out_value, out_error)
    }

    fn eval_formula_with(&self, formula: &str, vars: &Value) -> Result<Value> {
        let formula = to_c_string(formula)?;
        let vars = to_c_string(&vars.to_string())?;
        let mut out_value: *mut c_char = ptr::null_mut();
        let mut out_error: *mut c_char = ptr::null_mut();
        let status = unsafe {
            (self.inner.symbols.eval_with)(
                formula.as_ptr(),
                vars.as_ptr(),
                &mut out_value,
                &mut out_error,
            )
        };
        self.finish_eval(status, out_value, out_error)
    }

    /// Runs the engine's blocking custom-aware evaluation on the blocking
    /// thread pool; registered handlers settle their completions from
    /// whatever context they like.
    async fn eval_formula_with_custom(
        &self,
        formula: &str,
        vars: Option<&Value>,
    ) -> Result<Value> {
        let binding = self.clone();
        let formula = formula.to_owned();
        let vars_json = vars
            .map(ToString::to_string)
            .unwrap_or_else(|| "{}".to_string());
        tokio::task::spawn_blocking(move || binding.eval_with_custom_blocking(&formula, &vars_json))
            .await
            .map_err(|err| GriddleError::evaluation(format!("evaluation task failed: {err}")))?
    }

    fn register_function(&self, registration: FunctionRegistration) -> Result<()> {
        let FunctionRegistration {
            name,
            handler,
            min_args,
            max_args,
        } = registration;
        let c_name = CString::new(name.as_str()).map_err(|_| {
            GriddleError::registration(&name, "name contains an interior NUL byte")
        })?;
        let (min, max) = encode_arity(&name, min_args, max_args)?;
        let data = Box::new(HandlerData {
            name: name.clone(),
            handler,
        });
        let data_ptr = &*data as *const HandlerData as *mut c_void;
        let status = unsafe {
            (self.inner.symbols.register)(
                c_name.as_ptr(),
                min,
                max,
                handler_trampoline,
                data_ptr,
            )
        };
        if status != 0 {
            return Err(GriddleError::registration(
                &name,
                "engine rejected the registration",
            ));
        }
        // Replacing a name drops the previous closure; the engine already
        // holds the new data pointer at this point.
        self.inner.handlers.lock().insert(name, data);
        Ok(())
    }

    fn unregister_function(&self, name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        let removed = unsafe { (self.inner.symbols.unregister)(c_name.as_ptr()) } != 0;
        if removed {
            self.inner.handlers.lock().remove(name);
        }
        removed
    }

    fn list_custom_functions(&self) -> Vec<String> {
        let ptr = unsafe { (self.inner.symbols.list)() };
        let Some(text) = self.take_engine_string(ptr) else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<String>>(&text) {
            Ok(names) => names,
            Err(err) => {
                log::warn!("engine returned a malformed function list: {err}");
                Vec::new()
            }
        }
    }

    fn version(&self) -> String {
        let ptr = unsafe { (self.inner.symbols.version)() };
        self.take_engine_string(ptr)
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Trampoline the engine calls to run a registered custom function.
///
/// Blocks the engine's evaluation until the handler settles its completion.
/// A handler that keeps the completion alive without settling blocks here
/// indefinitely, which is the engine's documented behavior for
/// non-responding functions.
unsafe extern "C" fn handler_trampoline(
    data: *mut c_void,
    args_json: *const c_char,
    out_value: *mut *mut c_char,
    out_error: *mut *mut c_char,
) -> c_int {
    let entry = unsafe { &*(data as *const HandlerData) };
    let args = parse_args(unsafe { opt_cstr(args_json) });

    let (completion, rx) = Completion::channel();
    (entry.handler)(
        CallContext {
            name: entry.name.clone(),
        },
        args,
        completion,
    );

    let outcome = match rx.recv() {
        Ok(outcome) => outcome,
        Err(_) => Err(format!(
            "custom function '{}' did not respond",
            entry.name
        )),
    };

    match outcome {
        Ok(value) => {
            unsafe { *out_value = into_host_string(&value.to_string()) };
            0
        }
        Err(message) => {
            unsafe { *out_error = into_host_string(&message) };
            1
        }
    }
}

/// Release callback installed into the engine for strings allocated on this
/// side of the boundary.
unsafe extern "C" fn host_string_release(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr) });
    }
}

unsafe fn opt_cstr<'a>(ptr: *const c_char) -> Option<&'a CStr> {
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(ptr) })
    }
}

fn parse_args(raw: Option<&CStr>) -> Vec<Value> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    match serde_json::from_slice::<Value>(raw.to_bytes()) {
        Ok(Value::Array(items)) => items,
        Ok(other) => vec![other],
        Err(err) => {
            log::warn!("engine sent malformed custom function arguments: {err}");
            Vec::new()
        }
    }
}

fn into_host_string(text: &str) -> *mut c_char {
    match CString::new(text) {
        Ok(s) => s.into_raw(),
        // JSON encoding escapes NUL, so this only happens for pathological
        // rejection messages; hand back an empty string rather than truncate.
        Err(_) => CString::default().into_raw(),
    }
}

fn to_c_string(text: &str) -> Result<CString> {
    CString::new(text)
        .map_err(|_| GriddleError::invalid_input("text contains an interior NUL byte"))
}

/// Convert arity bounds into the engine's wire representation (`-1` for an
/// unbounded maximum), rejecting values the C ABI cannot carry instead of
/// truncating them.
fn encode_arity(name: &str, min_args: usize, max_args: Option<usize>) -> Result<(u32, i64)> {
    let min = u32::try_from(min_args).map_err(|_| {
        GriddleError::registration(name, "min_args exceeds the engine's arity range")
    })?;
    let max = match max_args {
        Some(max) => i64::try_from(max).map_err(|_| {
            GriddleError::registration(name, "max_args exceeds the engine's arity range")
        })?,
        None => -1,
    };
    Ok((min, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_args_unwraps_argument_arrays() {
        let raw = CString::new("[37, \"x\"]").unwrap();
        assert_eq!(
            parse_args(Some(raw.as_c_str())),
            vec![json!(37), json!("x")]
        );
    }

    #[test]
    fn parse_args_wraps_single_values() {
        let raw = CString::new("37").unwrap();
        assert_eq!(parse_args(Some(raw.as_c_str())), vec![json!(37)]);
    }

    #[test]
    fn parse_args_tolerates_missing_or_malformed_input() {
        assert!(parse_args(None).is_empty());
        let raw = CString::new("{not json").unwrap();
        assert!(parse_args(Some(raw.as_c_str())).is_empty());
    }

    #[test]
    fn host_strings_round_trip() {
        let ptr = into_host_string("{\"a\":1}");
        let text = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_owned();
        unsafe { host_string_release(ptr) };
        assert_eq!(text, "{\"a\":1}");
    }

    #[test]
    fn interior_nul_input_is_rejected_before_the_engine_sees_it() {
        assert!(to_c_string("= 2 \0+ 3").is_err());
    }

    #[test]
    fn arity_bounds_encode_without_truncation() {
        assert_eq!(encode_arity("F", 1, Some(3)).unwrap(), (1, 3));
        assert_eq!(encode_arity("F", 0, None).unwrap(), (0, -1));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn out_of_range_arity_is_rejected_rather_than_truncated() {
        let err = encode_arity("F", usize::MAX, None).unwrap_err();
        assert!(err.to_string().contains("min_args"));

        let err = encode_arity("F", 0, Some(usize::MAX)).unwrap_err();
        assert!(err.to_string().contains("max_args"));
    }
}
