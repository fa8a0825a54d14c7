//! Reference-counted handles to interpreter objects
//!
//! An interpreter object with no faithful host representation is parked in the
//! [`GlobalNamespace`] under a key derived from its identity, and the host receives a
//! [`Handle`] instead. The [`HandleRegistry`] counts outstanding handles per identity
//! and erases the namespace entry when the last one is released.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use pyo3::prelude::*;
use pyo3::types::{PyDict, PyModule};

use crate::lock::InterpreterToken;
use crate::value::Value;

/// Prefix of the namespace keys that back handles
pub const HANDLE_KEY_PREFIX: &str = "__pyhost_handle_";

/// Name of the persistent interpreter module backing the global namespace
pub const GLOBAL_NAMESPACE_NAME: &str = "global";

/// Identity of an interpreter object (CPython's `id()`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(usize);

impl HandleId {
    pub fn of(obj: &Bound<'_, PyAny>) -> Self {
        HandleId(obj.as_ptr() as usize)
    }

    pub fn raw(self) -> usize {
        self.0
    }

    /// Key of the namespace entry backing this identity
    pub fn namespace_key(self) -> String {
        format!("{HANDLE_KEY_PREFIX}{}__", self.0)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque surrogate for an interpreter object.
///
/// Two handles are equal when they denote the same identity. Cloning copies the
/// reference, it does not count as a new acquisition: use
/// [`HandleRegistry::retain`] for that.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    id: HandleId,
}

impl Handle {
    pub fn id(&self) -> HandleId {
        self.id
    }
}

/// Outcome of [`HandleRegistry::release`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other handles remain; the count dropped to the given value
    Decremented(usize),
    /// That was the last handle; the namespace entry is gone
    Destroyed,
    /// No handle with this identity is registered
    Unknown,
}

// ============================================================================
// GlobalNamespace
// ============================================================================

/// Process-lifetime interpreter namespace.
///
/// Holds session-level imports and the objects backing live handles. Only the
/// [`HandleRegistry`] mutates it; execution scopes read session names through
/// [`GlobalNamespace::layer_into`].
pub struct GlobalNamespace {
    module: Py<PyModule>,
}

impl GlobalNamespace {
    /// Create the namespace and run the session-level imports inside it
    pub(crate) fn create(token: InterpreterToken<'_>, session_imports: &[String]) -> PyResult<Self> {
        let py = token.py();
        let module = PyModule::new_bound(py, GLOBAL_NAMESPACE_NAME)?;
        let dict = module.dict();
        dict.set_item("__builtins__", PyModule::import_bound(py, "builtins")?)?;
        for statement in session_imports {
            log::debug!("[Handles] Session import: {statement}");
            py.run_bound(statement, Some(&dict), None)?;
        }
        Ok(Self {
            module: module.unbind(),
        })
    }

    fn dict<'py>(&self, token: InterpreterToken<'py>) -> Bound<'py, PyDict> {
        self.module.bind(token.py()).dict()
    }

    /// Copy the session-level names (not handle entries) into a scope dictionary
    pub(crate) fn layer_into(&self, token: InterpreterToken<'_>, scope: &Bound<'_, PyDict>) -> PyResult<()> {
        for (key, value) in self.dict(token).iter() {
            let is_handle_entry = key
                .extract::<String>()
                .map(|k| k.starts_with(HANDLE_KEY_PREFIX))
                .unwrap_or(false);
            if !is_handle_entry {
                scope.set_item(key, value)?;
            }
        }
        Ok(())
    }

    fn store(&self, token: InterpreterToken<'_>, id: HandleId, obj: &Bound<'_, PyAny>) -> PyResult<()> {
        self.dict(token).set_item(id.namespace_key(), obj)
    }

    fn load<'py>(&self, token: InterpreterToken<'py>, id: HandleId) -> PyResult<Option<Bound<'py, PyAny>>> {
        self.dict(token).get_item(id.namespace_key())
    }

    fn erase(&self, token: InterpreterToken<'_>, id: HandleId) -> PyResult<()> {
        self.dict(token).del_item(id.namespace_key())
    }

    fn has(&self, token: InterpreterToken<'_>, id: HandleId) -> bool {
        self.dict(token).contains(id.namespace_key()).unwrap_or(false)
    }
}

impl fmt::Debug for GlobalNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalNamespace").finish_non_exhaustive()
    }
}

// ============================================================================
// HandleRegistry
// ============================================================================

/// Reference-counted table of handles, backed by the global namespace.
///
/// The count table and the namespace are one logical resource: every mutation of a
/// namespace entry happens while the count mutex is held, and callers additionally
/// prove they hold the runtime lock through an [`InterpreterToken`].
#[derive(Debug)]
pub struct HandleRegistry {
    namespace: GlobalNamespace,
    counts: Mutex<HashMap<HandleId, usize>>,
}

impl HandleRegistry {
    pub(crate) fn new(namespace: GlobalNamespace) -> Self {
        Self {
            namespace,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn namespace(&self) -> &GlobalNamespace {
        &self.namespace
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<HandleId, usize>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park `obj` in the global namespace and return a handle for it.
    ///
    /// Acquiring an object that already has handles increments its count.
    pub fn acquire(&self, token: InterpreterToken<'_>, obj: &Bound<'_, PyAny>) -> PyResult<Handle> {
        let id = HandleId::of(obj);
        let mut counts = self.counts();
        self.namespace.store(token, id, obj)?;
        let count = counts.entry(id).or_insert(0);
        *count += 1;
        log::trace!("[Handles] acquire {id} -> {count}");
        Ok(Handle { id })
    }

    /// Construct another handle equal to `handle`, counting it.
    ///
    /// Returns `None` if the handle is no longer registered.
    pub fn retain(&self, handle: &Handle) -> Option<Handle> {
        let mut counts = self.counts();
        let count = counts.get_mut(&handle.id)?;
        *count += 1;
        log::trace!("[Handles] retain {} -> {count}", handle.id);
        Some(handle.clone())
    }

    /// Drop one reference; the last one erases the namespace entry.
    pub fn release(&self, token: InterpreterToken<'_>, handle: &Handle) -> Release {
        let id = handle.id;
        let mut counts = self.counts();
        let Some(count) = counts.get_mut(&id) else {
            log::trace!("[Handles] release of unknown handle {id}");
            return Release::Unknown;
        };
        if *count > 1 {
            *count -= 1;
            log::trace!("[Handles] release {id} -> {count}");
            return Release::Decremented(*count);
        }

        counts.remove(&id);
        if let Err(err) = self.namespace.erase(token, id) {
            log::warn!("[Handles] error removing object {id} from the global namespace: {err}");
        }
        log::trace!("[Handles] destroyed {id}");
        Release::Destroyed
    }

    /// Release every handle contained in `value`; returns how many were destroyed
    pub fn release_value(&self, token: InterpreterToken<'_>, value: &Value) -> usize {
        value
            .handles()
            .iter()
            .filter(|h| self.release(token, h) == Release::Destroyed)
            .count()
    }

    /// Look the backing object up by identity
    pub fn resolve<'py>(&self, token: InterpreterToken<'py>, handle: &Handle) -> Option<Bound<'py, PyAny>> {
        match self.namespace.load(token, handle.id) {
            Ok(found) => found,
            Err(err) => {
                log::warn!("[Handles] error resolving {}: {err}", handle.id);
                None
            }
        }
    }

    /// String form of the backing object, or of the identity when it is gone
    pub fn display(&self, token: InterpreterToken<'_>, handle: &Handle) -> String {
        let rendered = self
            .resolve(token, handle)
            .ok_or_else(|| "not in the global namespace".to_string())
            .and_then(|obj| {
                obj.str()
                    .map(|s| s.to_string())
                    .map_err(|err| err.to_string())
            });
        match rendered {
            Ok(text) => text,
            Err(reason) => {
                log::warn!("[Handles] error getting string rep of {}: {reason}", handle.id);
                handle.id.to_string()
            }
        }
    }

    /// Outstanding acquisitions for this handle's identity
    pub fn ref_count(&self, handle: &Handle) -> usize {
        self.counts().get(&handle.id).copied().unwrap_or(0)
    }

    /// Whether the global namespace still holds an entry for this handle
    pub fn contains(&self, token: InterpreterToken<'_>, handle: &Handle) -> bool {
        self.namespace.has(token, handle.id)
    }

    /// Number of distinct live identities
    pub fn len(&self) -> usize {
        self.counts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts().is_empty()
    }
}
