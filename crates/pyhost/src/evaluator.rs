//! Evaluation entry point and runtime context

use std::env;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::OnceCell;
use pyo3::prelude::*;
use pyo3::types::{PyList, PyModule};

use crate::config::EvaluatorConfig;
use crate::convert::FromValue;
use crate::error::{EvalError, EvalResult};
use crate::handle::{GlobalNamespace, Handle, HandleRegistry, Release};
use crate::lock::{ExclusiveRuntimeLock, InterpreterToken};
use crate::marshal::{InboundMarshaler, OutboundMarshaler};
use crate::registry::TypeConverterRegistry;
use crate::reload::{ReloadCoordinator, ReloadReport};
use crate::scope::{ExecutionScope, OutputRedirect, ScopeReader, ScopeWriter, ScriptOutput};
use crate::value::Value;

/// Identity token accepted by [`PythonEvaluator::reset`]
pub const ENGINE_NAME: &str = "pyhost";

/// `sys.path` as the interpreter set it up, before any evaluator touched it
static INTERPRETER_SYS_PATH: OnceCell<Vec<String>> = OnceCell::new();

/// Whether a script run completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationState {
    Success,
    Failed,
}

/// Collaborator notifications around each evaluation.
///
/// Hooks run inside the runtime lock. They must use the scope accessors they are
/// given; calling back into the evaluator from a hook fails with
/// [`EvalError::ReentrantLock`].
pub trait EvaluationHooks: Send + Sync {
    /// Before the script runs; `scope` can inject extra bindings
    fn evaluation_started(&self, _code: &str, _bindings: &[Value], _scope: &mut ScopeWriter<'_, '_, '_>) {}

    /// After the script ran or failed; `scope` can read bindings back out
    fn evaluation_finished(
        &self,
        _state: EvaluationState,
        _code: &str,
        _bindings: &[Value],
        _scope: &ScopeReader<'_, '_, '_>,
    ) {
    }

    /// One line of script output, without its newline
    fn script_output(&self, _label: &str, _line: &str) {}
}

/// State created on first use of the interpreter
struct RuntimeState {
    handles: HandleRegistry,
    default_sys_path: Vec<String>,
}

/// Embedded Python evaluator.
///
/// One instance is the explicit runtime context: it owns the converter table, the
/// handle registry and its global namespace. Construction registers the built-in
/// converters; the interpreter itself starts lazily on the first call that needs it.
///
/// # Example
///
/// ```no_run
/// use pyhost::{PythonEvaluator, Value};
///
/// let evaluator = PythonEvaluator::new();
/// let out = evaluator.evaluate("OUT = x + 1", &["x"], &[Value::Int(41)])?;
/// assert_eq!(out, Value::Int(42));
/// # Ok::<(), pyhost::EvalError>(())
/// ```
pub struct PythonEvaluator {
    config: EvaluatorConfig,
    converters: TypeConverterRegistry,
    lock: ExclusiveRuntimeLock,
    runtime: OnceCell<RuntimeState>,
    hooks: RwLock<Vec<Arc<dyn EvaluationHooks>>>,
}

impl PythonEvaluator {
    /// Evaluator configured from the process environment
    pub fn new() -> Self {
        Self::with_config(EvaluatorConfig::from_env())
    }

    pub fn with_config(config: EvaluatorConfig) -> Self {
        log::debug!(
            "[Evaluator] Creating evaluator (isolated: {}, {} library path(s))",
            config.isolated,
            config.library_paths.len()
        );
        Self {
            config,
            converters: TypeConverterRegistry::with_defaults(),
            lock: ExclusiveRuntimeLock,
            runtime: OnceCell::new(),
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    pub fn converters(&self) -> &TypeConverterRegistry {
        &self.converters
    }

    /// Register additional converters before the evaluator is shared
    pub fn converters_mut(&mut self) -> &mut TypeConverterRegistry {
        &mut self.converters
    }

    pub fn add_hooks(&self, hooks: Arc<dyn EvaluationHooks>) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hooks);
    }

    /// Whether the interpreter runtime has been started
    pub fn is_started(&self) -> bool {
        self.runtime.get().is_some()
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Run `code` with positional bindings and return the output binding.
    ///
    /// Names and values pair up positionally, `min(names, values)` of them. A first
    /// name equal to the label binding (`"Name"`) is consumed together with its value
    /// as the caller's label and never reaches the script. The result is the value
    /// of the output binding (`"OUT"`), or [`Value::Null`] when the script leaves it
    /// unset.
    ///
    /// Script failures are the only errors: failed conversions degrade, and if the
    /// interpreter cannot be started the call logs and returns [`Value::Null`].
    pub fn evaluate<S: AsRef<str>>(&self, code: &str, names: &[S], values: &[Value]) -> EvalResult<Value> {
        let (label, bindings) = self.split_bindings(names, values);
        let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner).clone();

        self.lock.with(|token| {
            let runtime = match self.ensure_started(token) {
                Ok(runtime) => runtime,
                Err(err) => {
                    log::error!("[Evaluator] Failed to start the interpreter runtime: {err}");
                    return Ok(Value::Null);
                }
            };
            self.evaluate_locked(token, runtime, code, &label, &bindings, &hooks)
        })?
    }

    /// Evaluate without bindings
    pub fn evaluate_code(&self, code: &str) -> EvalResult<Value> {
        self.evaluate::<&str>(code, &[], &[])
    }

    /// Evaluate and extract a typed result
    pub fn evaluate_as<T: FromValue, S: AsRef<str>>(
        &self,
        code: &str,
        names: &[S],
        values: &[Value],
    ) -> EvalResult<T> {
        let value = self.evaluate(code, names, values)?;
        Ok(T::from_value(value)?)
    }

    fn split_bindings<'v, S: AsRef<str>>(&self, names: &[S], values: &'v [Value]) -> (String, Vec<(String, &'v Value)>) {
        let mut names: Vec<&str> = names.iter().map(|n| n.as_ref()).collect();
        let mut values = values;
        let mut label = self.config.default_label.clone();

        if names.first().copied() == Some(self.config.label_binding.as_str()) {
            names.remove(0);
            if let Some((first, rest)) = values.split_first() {
                label = match first {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                values = rest;
            }
        }

        if names.len() != values.len() {
            log::debug!(
                "[Evaluator] {} binding name(s) for {} value(s); extra entries ignored",
                names.len(),
                values.len()
            );
        }

        let mut bindings: Vec<(String, &Value)> = Vec::with_capacity(names.len().min(values.len()));
        for (name, value) in names.into_iter().zip(values) {
            if bindings.iter().any(|(seen, _)| seen == name) {
                log::warn!("[Evaluator] binding '{name}' given more than once; the last value wins");
            }
            bindings.push((name.to_string(), value));
        }
        (label, bindings)
    }

    fn evaluate_locked(
        &self,
        token: InterpreterToken<'_>,
        runtime: &RuntimeState,
        code: &str,
        label: &str,
        bindings: &[(String, &Value)],
        hooks: &[Arc<dyn EvaluationHooks>],
    ) -> EvalResult<Value> {
        log::debug!("[Evaluator] Evaluating for {label} with {} binding(s)", bindings.len());

        // Only the script itself may fail a call; set-up problems degrade to null.
        if self.config.reset_sys_path {
            if let Err(err) = reset_sys_path(token, &runtime.default_sys_path) {
                return Ok(setup_failed(label, "reset sys.path", &err));
            }
        }

        let mut scope = match ExecutionScope::new(token, &self.converters, &runtime.handles) {
            Ok(scope) => scope,
            Err(err) => return Ok(setup_failed(label, "create the scope", &err)),
        };
        if let Err(err) = scope.seed(bindings.iter().map(|(name, value)| (name.as_str(), *value))) {
            scope.tear_down();
            return Ok(setup_failed(label, "bind inputs", &err));
        }

        let _redirect = if self.config.redirect_output {
            match OutputRedirect::install(token, ScriptOutput::new(label, hooks.to_vec())) {
                Ok(redirect) => Some(redirect),
                Err(err) => {
                    scope.tear_down();
                    return Ok(setup_failed(label, "redirect output", &err));
                }
            }
        } else {
            None
        };

        let values: Vec<Value> = bindings.iter().map(|(_, v)| (*v).clone()).collect();
        for hook in hooks {
            hook.evaluation_started(code, &values, &mut ScopeWriter::new(&scope));
        }

        let outcome = scope
            .execute(code)
            .and_then(|()| scope.read(&self.config.output_binding));

        let state = if outcome.is_ok() {
            EvaluationState::Success
        } else {
            EvaluationState::Failed
        };
        for hook in hooks {
            hook.evaluation_finished(state, code, &values, &ScopeReader::new(&scope));
        }
        scope.tear_down();

        match outcome {
            Ok(value) => Ok(value.unwrap_or(Value::Null)),
            Err(err) => {
                log::debug!("[Evaluator] Evaluation for {label} failed: {err}");
                Err(err)
            }
        }
    }

    // ========================================================================
    // Runtime lifecycle
    // ========================================================================

    fn ensure_started(&self, token: InterpreterToken<'_>) -> PyResult<&RuntimeState> {
        self.runtime.get_or_try_init(|| {
            log::info!("[Evaluator] Starting interpreter runtime");
            let interpreter_path = INTERPRETER_SYS_PATH.get_or_try_init(|| read_sys_path(token))?;
            let default_sys_path = self.default_sys_path(interpreter_path);
            let namespace = GlobalNamespace::create(token, &self.config.session_imports)?;
            Ok(RuntimeState {
                handles: HandleRegistry::new(namespace),
                default_sys_path,
            })
        })
    }

    /// Library paths first, then the interpreter's own entries
    fn default_sys_path(&self, interpreter_path: &[String]) -> Vec<String> {
        let mut excluded: Vec<PathBuf> = Vec::new();
        if self.config.isolated {
            if let Some(paths) = env::var_os("PYTHONPATH") {
                excluded.extend(env::split_paths(&paths));
            }
        }

        let mut path: Vec<String> = self
            .config
            .library_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        for entry in interpreter_path {
            let is_excluded = !entry.is_empty() && excluded.iter().any(|e| PathBuf::from(entry) == *e);
            let is_user_site = self.config.isolated && is_user_site_packages(entry);
            if !is_excluded && !is_user_site && !path.contains(entry) {
                path.push(entry.clone());
            }
        }
        path
    }

    /// Reload previously imported modules if `engine_name` names this engine.
    ///
    /// Returns `Ok(None)` when the name does not match or the runtime has not been
    /// started yet.
    pub fn reset(&self, engine_name: &str) -> EvalResult<Option<ReloadReport>> {
        if engine_name != ENGINE_NAME {
            log::trace!("[Evaluator] reset for engine '{engine_name}' ignored");
            return Ok(None);
        }
        if !self.is_started() {
            log::debug!("[Evaluator] reset requested before the runtime started; nothing to reload");
            return Ok(None);
        }
        let coordinator = ReloadCoordinator::new(self.config.reload_policy.clone());
        let report = self.lock.with(|token| {
            let runtime = self.ensure_started(token)?;
            // module specs are looked up again on reload
            if self.config.reset_sys_path {
                reset_sys_path(token, &runtime.default_sys_path)?;
            }
            coordinator.reload(token)
        })??;
        Ok(Some(report))
    }

    // ========================================================================
    // Handles and direct access
    // ========================================================================

    /// Run `f` with token-gated access to the marshalers and the handle registry
    pub fn with_session<F, R>(&self, f: F) -> EvalResult<R>
    where
        F: for<'s, 'py> FnOnce(&Session<'s, 'py>) -> R,
    {
        self.lock.with(|token| {
            let runtime = self.ensure_started(token)?;
            let session = Session {
                token,
                converters: &self.converters,
                handles: &runtime.handles,
            };
            Ok::<R, EvalError>(f(&session))
        })?
    }

    /// Drop one reference to `handle`
    pub fn release(&self, handle: &Handle) -> EvalResult<Release> {
        let runtime = self.runtime.get().ok_or(EvalError::NotStarted)?;
        self.lock.with(|token| runtime.handles.release(token, handle))
    }

    /// Release every handle inside `value`; returns how many objects were destroyed
    pub fn release_value(&self, value: &Value) -> EvalResult<usize> {
        let runtime = self.runtime.get().ok_or(EvalError::NotStarted)?;
        self.lock.with(|token| runtime.handles.release_value(token, value))
    }

    /// Wrap `handle` so it is released when the guard drops
    pub fn guard(&self, handle: Handle) -> HandleGuard<'_> {
        HandleGuard {
            evaluator: self,
            handle,
            armed: true,
        }
    }

    /// String form of the object behind `handle`, or its identity when it is gone
    pub fn handle_to_string(&self, handle: &Handle) -> EvalResult<String> {
        let runtime = self.runtime.get().ok_or(EvalError::NotStarted)?;
        self.lock.with(|token| runtime.handles.display(token, handle))
    }

    /// Number of distinct objects currently held by handles
    pub fn handle_count(&self) -> usize {
        self.runtime.get().map_or(0, |r| r.handles.len())
    }

    pub fn ref_count(&self, handle: &Handle) -> usize {
        self.runtime.get().map_or(0, |r| r.handles.ref_count(handle))
    }
}

impl Default for PythonEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PythonEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PythonEvaluator")
            .field("config", &self.config)
            .field("started", &self.is_started())
            .field("handles", &self.handle_count())
            .finish_non_exhaustive()
    }
}

fn setup_failed(label: &str, step: &str, err: &PyErr) -> Value {
    log::error!("[Evaluator] Could not {step} for {label}: {err}");
    Value::Null
}

fn read_sys_path(token: InterpreterToken<'_>) -> PyResult<Vec<String>> {
    let sys = PyModule::import_bound(token.py(), "sys")?;
    sys.getattr("path")?.extract()
}

fn reset_sys_path(token: InterpreterToken<'_>, path: &[String]) -> PyResult<()> {
    let py = token.py();
    let sys = PyModule::import_bound(py, "sys")?;
    sys.setattr("path", PyList::new_bound(py, path))
}

fn is_user_site_packages(entry: &str) -> bool {
    let Some(home) = env::var_os("HOME").or_else(|| env::var_os("USERPROFILE")) else {
        return false;
    };
    let entry = PathBuf::from(entry);
    entry.starts_with(PathBuf::from(home).join(".local").join("lib"))
        && entry.ends_with("site-packages")
}

// ============================================================================
// Session
// ============================================================================

/// Locked access to the runtime, handed out by [`PythonEvaluator::with_session`].
pub struct Session<'s, 'py> {
    token: InterpreterToken<'py>,
    converters: &'s TypeConverterRegistry,
    handles: &'s HandleRegistry,
}

impl<'s, 'py> Session<'s, 'py> {
    pub fn token(&self) -> InterpreterToken<'py> {
        self.token
    }

    pub fn py(&self) -> Python<'py> {
        self.token.py()
    }

    pub fn handles(&self) -> &'s HandleRegistry {
        self.handles
    }

    pub fn inbound(&self) -> InboundMarshaler<'s, 'py> {
        InboundMarshaler::new(self.token, self.converters, self.handles)
    }

    pub fn outbound(&self) -> OutboundMarshaler<'s, 'py> {
        OutboundMarshaler::new(self.token, self.converters, self.handles)
    }

    /// Convert a host value; failures degrade to the unconverted value
    pub fn inbound_or_passthrough(&self, value: &Value) -> PyResult<Bound<'py, PyAny>> {
        self.inbound().marshal_or_passthrough(value)
    }

    /// Convert an interpreter object; failures degrade to a handle
    pub fn outbound_or_handle(&self, obj: &Bound<'py, PyAny>) -> PyResult<Value> {
        self.outbound().marshal_or_handle(obj)
    }

    pub fn resolve(&self, handle: &Handle) -> Option<Bound<'py, PyAny>> {
        self.handles.resolve(self.token, handle)
    }

    pub fn release(&self, handle: &Handle) -> Release {
        self.handles.release(self.token, handle)
    }
}

// ============================================================================
// HandleGuard
// ============================================================================

/// Releases its handle when dropped.
#[derive(Debug)]
pub struct HandleGuard<'e> {
    evaluator: &'e PythonEvaluator,
    handle: Handle,
    armed: bool,
}

impl HandleGuard<'_> {
    /// Take the handle back without releasing it
    pub fn into_inner(mut self) -> Handle {
        self.armed = false;
        self.handle.clone()
    }
}

impl Deref for HandleGuard<'_> {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.evaluator.release(&self.handle) {
            log::warn!("[Handles] failed to release {} on drop: {err}", self.handle.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_is_consumed() {
        let evaluator = PythonEvaluator::with_config(EvaluatorConfig::default());
        let values = [Value::from("caller"), Value::Int(5)];
        let (label, bindings) = evaluator.split_bindings(&["Name", "x"], &values);
        assert_eq!(label, "caller");
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].0, "x");
        assert_eq!(*bindings[0].1, Value::Int(5));
    }

    #[test]
    fn test_default_label_and_min_pairing() {
        let evaluator = PythonEvaluator::with_config(EvaluatorConfig::default());
        let values = [Value::Int(1)];
        let (label, bindings) = evaluator.split_bindings(&["a", "b", "c"], &values);
        assert_eq!(label, "USER");
        assert_eq!(bindings.len(), 1);

        let (_, bindings) = evaluator.split_bindings::<&str>(&[], &values);
        assert!(bindings.is_empty());
    }

    #[test]
    fn test_label_without_value() {
        let evaluator = PythonEvaluator::with_config(EvaluatorConfig::default());
        let (label, bindings) = evaluator.split_bindings(&["Name"], &[]);
        assert_eq!(label, "USER");
        assert!(bindings.is_empty());
    }

    #[test]
    fn test_reset_ignores_other_engines() {
        let evaluator = PythonEvaluator::with_config(EvaluatorConfig::default());
        assert!(evaluator.reset("other").unwrap().is_none());
        assert!(evaluator.reset(ENGINE_NAME).unwrap().is_none());
    }
}
