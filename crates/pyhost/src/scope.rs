//! Per-call execution scope
//!
//! Every evaluation runs in a fresh globals dictionary layered over the session names
//! of the [`GlobalNamespace`](crate::handle::GlobalNamespace). Script writes land in
//! that dictionary only; the global namespace is never written from a scope.

use std::sync::Arc;

use pyo3::prelude::*;
use pyo3::types::{PyDict, PyModule};

use crate::error::{EvalError, EvalResult};
use crate::evaluator::EvaluationHooks;
use crate::handle::HandleRegistry;
use crate::lock::InterpreterToken;
use crate::marshal::{InboundMarshaler, OutboundMarshaler};
use crate::registry::TypeConverterRegistry;
use crate::value::Value;

/// Lifecycle of an [`ExecutionScope`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Uninitialized,
    /// Bindings applied
    Seeded,
    Executing,
    /// Output binding being marshaled out
    ReadBack,
    TornDown,
}

/// Disposable namespace for a single evaluation.
pub struct ExecutionScope<'m, 'py> {
    token: InterpreterToken<'py>,
    converters: &'m TypeConverterRegistry,
    handles: &'m HandleRegistry,
    globals: Bound<'py, PyDict>,
    state: ScopeState,
}

impl<'m, 'py> ExecutionScope<'m, 'py> {
    /// Fresh scope carrying the session names of the global namespace
    pub fn new(
        token: InterpreterToken<'py>,
        converters: &'m TypeConverterRegistry,
        handles: &'m HandleRegistry,
    ) -> PyResult<Self> {
        let py = token.py();
        let globals = PyDict::new_bound(py);
        handles.namespace().layer_into(token, &globals)?;
        globals.set_item("__builtins__", PyModule::import_bound(py, "builtins")?)?;
        globals.set_item("__name__", "__main__")?;
        Ok(Self {
            token,
            converters,
            handles,
            globals,
            state: ScopeState::Uninitialized,
        })
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    pub fn globals(&self) -> &Bound<'py, PyDict> {
        &self.globals
    }

    /// Apply the caller's bindings, in order
    pub fn seed<'a>(&mut self, bindings: impl IntoIterator<Item = (&'a str, &'a Value)>) -> PyResult<()> {
        for (name, value) in bindings {
            self.bind(name, value)?;
        }
        self.state = ScopeState::Seeded;
        Ok(())
    }

    /// Marshal `value` inbound and bind it; a failed conversion binds the raw value
    pub fn bind(&self, name: &str, value: &Value) -> PyResult<()> {
        let obj = self.inbound().marshal_or_passthrough(value)?;
        self.globals.set_item(name, obj)
    }

    /// Run `code` in this scope.
    ///
    /// On failure the scope is torn down at once and the error carries the formatted
    /// traceback when the interpreter produced one.
    pub fn execute(&mut self, code: &str) -> EvalResult<()> {
        self.state = ScopeState::Executing;
        let py = self.token.py();
        match py.run_bound(code, Some(&self.globals), None) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.state = ScopeState::TornDown;
                let traceback = err.traceback_bound(py).and_then(|tb| tb.format().ok());
                log::debug!("[Scope] script raised: {err}");
                Err(EvalError::from_script_failure(err, traceback))
            }
        }
    }

    /// Marshal the binding `name` outbound, or `None` if it is not set.
    pub fn read(&mut self, name: &str) -> EvalResult<Option<Value>> {
        if self.state == ScopeState::TornDown {
            return Ok(None);
        }
        self.state = ScopeState::ReadBack;
        Ok(self.get(name)?)
    }

    /// Read a binding without moving the lifecycle; conversion failures degrade to a handle
    pub fn get(&self, name: &str) -> PyResult<Option<Value>> {
        match self.globals.get_item(name)? {
            Some(obj) => self.outbound().marshal_or_handle(&obj).map(Some),
            None => Ok(None),
        }
    }

    /// Discard the scope. Objects still referenced from returned handles stay alive.
    pub fn tear_down(mut self) {
        self.state = ScopeState::TornDown;
    }

    fn inbound(&self) -> InboundMarshaler<'m, 'py> {
        InboundMarshaler::new(self.token, self.converters, self.handles)
    }

    fn outbound(&self) -> OutboundMarshaler<'m, 'py> {
        OutboundMarshaler::new(self.token, self.converters, self.handles)
    }
}

/// Write access to a scope, handed to `evaluation_started` hooks.
pub struct ScopeWriter<'s, 'm, 'py> {
    scope: &'s ExecutionScope<'m, 'py>,
}

impl<'s, 'm, 'py> ScopeWriter<'s, 'm, 'py> {
    pub(crate) fn new(scope: &'s ExecutionScope<'m, 'py>) -> Self {
        Self { scope }
    }

    /// Inject an extra binding before the script runs
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> PyResult<()> {
        self.scope.bind(name, &value.into())
    }
}

/// Read access to a scope, handed to `evaluation_finished` hooks.
pub struct ScopeReader<'s, 'm, 'py> {
    scope: &'s ExecutionScope<'m, 'py>,
}

impl<'s, 'm, 'py> ScopeReader<'s, 'm, 'py> {
    pub(crate) fn new(scope: &'s ExecutionScope<'m, 'py>) -> Self {
        Self { scope }
    }

    /// Read a binding; `None` when it is unset or cannot be read
    pub fn get(&self, name: &str) -> Option<Value> {
        match self.scope.get(name) {
            Ok(value) => value,
            Err(err) => {
                log::warn!("[Scope] could not read '{name}' back: {err}");
                None
            }
        }
    }
}

// ============================================================================
// Output redirection
// ============================================================================

/// Replacement `sys.stdout` that forwards complete lines to the log and to hooks.
#[pyclass(name = "ScriptOutput", module = "pyhost")]
pub struct ScriptOutput {
    label: String,
    hooks: Vec<Arc<dyn EvaluationHooks>>,
    pending: String,
}

impl ScriptOutput {
    pub fn new(label: impl Into<String>, hooks: Vec<Arc<dyn EvaluationHooks>>) -> Self {
        Self {
            label: label.into(),
            hooks,
            pending: String::new(),
        }
    }

    fn emit(&self, line: &str) {
        log::info!(target: "pyhost::script", "{}: {line}", self.label);
        for hook in &self.hooks {
            hook.script_output(&self.label, line);
        }
    }
}

#[pymethods]
impl ScriptOutput {
    fn write(&mut self, text: &str) -> usize {
        self.pending.push_str(text);
        while let Some(at) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=at).collect();
            self.emit(line.trim_end_matches(|c: char| c == '\n' || c == '\r'));
        }
        text.chars().count()
    }

    fn flush(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line);
        }
    }
}

/// Swaps `sys.stdout` for a [`ScriptOutput`] until dropped.
pub(crate) struct OutputRedirect<'py> {
    sys: Bound<'py, PyModule>,
    previous: Bound<'py, PyAny>,
    writer: Bound<'py, ScriptOutput>,
}

impl<'py> OutputRedirect<'py> {
    pub(crate) fn install(token: InterpreterToken<'py>, output: ScriptOutput) -> PyResult<Self> {
        let py = token.py();
        let sys = PyModule::import_bound(py, "sys")?;
        let previous = sys.getattr("stdout")?;
        let writer = Bound::new(py, output)?;
        sys.setattr("stdout", &writer)?;
        Ok(Self {
            sys,
            previous,
            writer,
        })
    }
}

impl Drop for OutputRedirect<'_> {
    fn drop(&mut self) {
        match self.writer.try_borrow_mut() {
            Ok(mut writer) => writer.flush(),
            Err(err) => log::warn!("[Scope] could not flush script output: {err}"),
        }
        if let Err(err) = self.sys.setattr("stdout", &self.previous) {
            log::warn!("[Scope] could not restore sys.stdout: {err}");
        }
    }
}
