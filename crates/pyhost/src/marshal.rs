//! Inbound and outbound value marshaling
//!
//! Both marshalers consult the [`TypeConverterRegistry`] first and fall back to a
//! structural conversion when no converter claims the value. Converters recurse by
//! calling back into the marshaler they are handed.
//!
//! Outbound resolution order (the built-in converters followed by the fallback):
//!
//! 1. `host_object`: a wrapped host value is returned as that host value
//! 2. `skip_conversion`: objects carrying [`SKIP_CONVERSION_ATTR`] become handles
//! 3. `mapping`: mappings become [`ValueMap`]s, keys and values marshaled
//! 4. `iterable`: other iterables except strings become lists
//! 5. `integer`: ints become `Int`, or `BigInt` when they overflow 64 bits
//! 6. fallback: structural unwrap; an unchanged object becomes a handle, a
//!    different interpreter object is marshaled again
//! 7. fallback: the unwrapped native value is returned as-is
//!
//! Mappings are also iterable, so 3 must stay ahead of 4. The "unchanged" check in 6
//! is what stops the recursion for objects with no conversion path.

use std::cell::RefCell;
use std::collections::HashSet;

use num_bigint::BigInt;
use pyo3::exceptions::PyOverflowError;
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyFloat, PyList, PyLong, PyMapping, PyString};

use crate::handle::{Handle, HandleId, HandleRegistry};
use crate::lock::InterpreterToken;
use crate::registry::TypeConverterRegistry;
use crate::value::{Value, ValueMap};

/// Attribute marking an interpreter object to be returned as a handle, unconverted
pub const SKIP_CONVERSION_ATTR: &str = "__pyhostskipconversion__";

/// Interpreter-side wrapper around a host value that has no native counterpart.
///
/// Scripts see it as `pyhost.HostObject`; it carries the value back out untouched.
#[pyclass(name = "HostObject", module = "pyhost", frozen)]
pub struct PyHostObject {
    value: Value,
}

impl PyHostObject {
    pub fn value(&self) -> &Value {
        &self.value
    }
}

#[pymethods]
impl PyHostObject {
    fn __repr__(&self) -> String {
        match &self.value {
            Value::Host(obj) => format!("<HostObject {}>", obj.type_name()),
            other => format!("<HostObject {other}>"),
        }
    }
}

// ============================================================================
// Inbound (host -> interpreter)
// ============================================================================

/// Converts host values into interpreter objects.
pub struct InboundMarshaler<'m, 'py> {
    token: InterpreterToken<'py>,
    converters: &'m TypeConverterRegistry,
    handles: &'m HandleRegistry,
}

impl<'m, 'py> InboundMarshaler<'m, 'py> {
    pub(crate) fn new(
        token: InterpreterToken<'py>,
        converters: &'m TypeConverterRegistry,
        handles: &'m HandleRegistry,
    ) -> Self {
        Self {
            token,
            converters,
            handles,
        }
    }

    pub fn py(&self) -> Python<'py> {
        self.token.py()
    }

    pub fn token(&self) -> InterpreterToken<'py> {
        self.token
    }

    pub fn handles(&self) -> &'m HandleRegistry {
        self.handles
    }

    /// Convert `value`, recursing into containers
    pub fn marshal(&self, value: &Value) -> PyResult<Bound<'py, PyAny>> {
        if let Some(converter) = self.converters.resolve_inbound(value) {
            log::trace!("[Marshal] inbound {:?} via '{}'", value.kind(), converter.name());
            return converter.convert(self, value);
        }
        match self.structural(value) {
            Some(obj) => Ok(obj),
            None => self.passthrough(value),
        }
    }

    /// Convert `value`, degrading to [`passthrough`](Self::passthrough) when conversion raises
    pub fn marshal_or_passthrough(&self, value: &Value) -> PyResult<Bound<'py, PyAny>> {
        self.marshal(value).or_else(|err| {
            log::warn!(
                "[Marshal] inbound conversion of {:?} failed, passing it through unconverted: {err}",
                value.kind()
            );
            self.passthrough(value)
        })
    }

    /// Direct conversion of scalars; `None` for anything else
    pub fn structural(&self, value: &Value) -> Option<Bound<'py, PyAny>> {
        let py = self.py();
        let obj = match value {
            Value::Null => py.None(),
            Value::Bool(v) => v.to_object(py),
            Value::Int(v) => v.to_object(py),
            Value::BigInt(v) => v.to_object(py),
            Value::Float(v) => v.to_object(py),
            Value::String(s) => s.to_object(py),
            _ => return None,
        };
        Some(obj.into_bound(py))
    }

    /// Hand the value to the interpreter unconverted, wrapped as a `HostObject`
    pub fn passthrough(&self, value: &Value) -> PyResult<Bound<'py, PyAny>> {
        let wrapper = Bound::new(
            self.py(),
            PyHostObject {
                value: value.clone(),
            },
        )?;
        Ok(wrapper.into_any())
    }
}

pub(crate) fn inbound_sequence<'py>(
    m: &InboundMarshaler<'_, 'py>,
    value: &Value,
) -> PyResult<Bound<'py, PyAny>> {
    let Value::List(items) = value else {
        return m.passthrough(value);
    };
    let list = PyList::empty_bound(m.py());
    for item in items {
        list.append(m.marshal(item)?)?;
    }
    Ok(list.into_any())
}

pub(crate) fn inbound_mapping<'py>(
    m: &InboundMarshaler<'_, 'py>,
    value: &Value,
) -> PyResult<Bound<'py, PyAny>> {
    let Value::Map(map) = value else {
        return m.passthrough(value);
    };
    let dict = PyDict::new_bound(m.py());
    for (k, v) in map.iter() {
        dict.set_item(m.marshal(k)?, m.marshal(v)?)?;
    }
    Ok(dict.into_any())
}

pub(crate) fn inbound_handle<'py>(
    m: &InboundMarshaler<'_, 'py>,
    value: &Value,
) -> PyResult<Bound<'py, PyAny>> {
    let Value::Handle(handle) = value else {
        return m.passthrough(value);
    };
    match m.handles().resolve(m.token(), handle) {
        Some(obj) => Ok(obj),
        None => {
            log::warn!(
                "[Marshal] handle {} is not in the global namespace; passing its identity instead",
                handle.id()
            );
            Ok(handle.id().to_string().to_object(m.py()).into_bound(m.py()))
        }
    }
}

// ============================================================================
// Outbound (interpreter -> host)
// ============================================================================

/// Converts interpreter objects into host values.
pub struct OutboundMarshaler<'m, 'py> {
    token: InterpreterToken<'py>,
    converters: &'m TypeConverterRegistry,
    handles: &'m HandleRegistry,
    /// Objects whose conversion is in progress further up the stack
    active: RefCell<HashSet<HandleId>>,
    /// Handles acquired by this marshaler, in order; rolled back when a conversion degrades
    acquired: RefCell<Vec<Handle>>,
}

enum Unwrapped<'py> {
    Native(Value),
    Unchanged,
    Other(Bound<'py, PyAny>),
}

impl<'m, 'py> OutboundMarshaler<'m, 'py> {
    pub(crate) fn new(
        token: InterpreterToken<'py>,
        converters: &'m TypeConverterRegistry,
        handles: &'m HandleRegistry,
    ) -> Self {
        Self {
            token,
            converters,
            handles,
            active: RefCell::new(HashSet::new()),
            acquired: RefCell::new(Vec::new()),
        }
    }

    pub fn py(&self) -> Python<'py> {
        self.token.py()
    }

    pub fn token(&self) -> InterpreterToken<'py> {
        self.token
    }

    pub fn handles(&self) -> &'m HandleRegistry {
        self.handles
    }

    /// Convert `obj`, recursing into containers
    pub fn marshal(&self, obj: &Bound<'py, PyAny>) -> PyResult<Value> {
        let id = HandleId::of(obj);
        if !self.active.borrow_mut().insert(id) {
            log::debug!("[Marshal] {id} contains itself; returning a handle for the inner reference");
            return self.handle_for(obj);
        }
        let result = self.dispatch(obj);
        self.active.borrow_mut().remove(&id);
        result
    }

    fn dispatch(&self, obj: &Bound<'py, PyAny>) -> PyResult<Value> {
        if let Some(converter) = self.converters.resolve_outbound(obj) {
            log::trace!("[Marshal] outbound {id} via '{}'", converter.name(), id = HandleId::of(obj));
            return converter.convert(self, obj);
        }
        match unwrap_structural(obj)? {
            Unwrapped::Native(value) => Ok(value),
            Unwrapped::Unchanged => self.handle_for(obj),
            Unwrapped::Other(next) => self.marshal(&next),
        }
    }

    /// Convert `obj`, degrading to a handle for it when conversion raises.
    ///
    /// Handles acquired by the failed attempt are released first.
    pub fn marshal_or_handle(&self, obj: &Bound<'py, PyAny>) -> PyResult<Value> {
        let mark = self.acquired.borrow().len();
        self.marshal(obj).or_else(|err| {
            log::warn!(
                "[Marshal] outbound conversion of {} failed, returning a handle instead: {err}",
                HandleId::of(obj)
            );
            self.degrade(mark, obj)
        })
    }

    /// Park `obj` in the global namespace and return its handle
    pub fn handle_for(&self, obj: &Bound<'py, PyAny>) -> PyResult<Value> {
        let handle = self.handles.acquire(self.token, obj)?;
        self.acquired.borrow_mut().push(handle.clone());
        Ok(Value::Handle(handle))
    }

    /// Release every handle acquired since `mark`, then return a handle for `obj`
    fn degrade(&self, mark: usize, obj: &Bound<'py, PyAny>) -> PyResult<Value> {
        let abandoned: Vec<Handle> = self.acquired.borrow_mut().drain(mark..).collect();
        for handle in &abandoned {
            self.handles.release(self.token, handle);
        }
        if !abandoned.is_empty() {
            log::debug!("[Marshal] released {} handle(s) from the abandoned conversion", abandoned.len());
        }
        self.handle_for(obj)
    }
}

/// Generic unwrap to a host-native value.
///
/// `None`, bools, ints, floats and strings are native. Objects implementing
/// `__index__` unwrap to `operator.index(obj)`. Anything else is unchanged.
fn unwrap_structural<'py>(obj: &Bound<'py, PyAny>) -> PyResult<Unwrapped<'py>> {
    if obj.is_none() {
        return Ok(Unwrapped::Native(Value::Null));
    }
    if let Ok(flag) = obj.downcast::<PyBool>() {
        return Ok(Unwrapped::Native(Value::Bool(flag.is_true())));
    }
    if obj.is_instance_of::<PyLong>() {
        return integer_value(obj).map(Unwrapped::Native);
    }
    if obj.is_instance_of::<PyFloat>() {
        return Ok(Unwrapped::Native(Value::Float(obj.extract::<f64>()?)));
    }
    if obj.is_instance_of::<PyString>() {
        return Ok(Unwrapped::Native(Value::String(obj.extract::<String>()?)));
    }
    if obj.get_type().hasattr("__index__")? {
        let index = PyModule::import_bound(obj.py(), "operator")?.getattr("index")?;
        let next = index.call1((obj.clone(),))?;
        if !next.is(obj) {
            return Ok(Unwrapped::Other(next));
        }
    }
    Ok(Unwrapped::Unchanged)
}

fn integer_value(obj: &Bound<'_, PyAny>) -> PyResult<Value> {
    match obj.extract::<i64>() {
        Ok(v) => Ok(Value::Int(v)),
        Err(err) if err.is_instance_of::<PyOverflowError>(obj.py()) => {
            Ok(Value::BigInt(obj.extract::<BigInt>()?))
        }
        Err(err) => Err(err),
    }
}

pub(crate) fn is_host_object(obj: &Bound<'_, PyAny>) -> bool {
    obj.is_instance_of::<PyHostObject>()
}

pub(crate) fn outbound_host_object(_: &OutboundMarshaler<'_, '_>, obj: &Bound<'_, PyAny>) -> PyResult<Value> {
    let wrapper = obj.downcast::<PyHostObject>()?;
    Ok(wrapper.get().value.clone())
}

pub(crate) fn is_marked_to_skip(obj: &Bound<'_, PyAny>) -> bool {
    obj.hasattr(SKIP_CONVERSION_ATTR).unwrap_or(false)
}

pub(crate) fn outbound_skip<'py>(m: &OutboundMarshaler<'_, 'py>, obj: &Bound<'py, PyAny>) -> PyResult<Value> {
    m.handle_for(obj)
}

pub(crate) fn is_mapping(obj: &Bound<'_, PyAny>) -> bool {
    obj.downcast::<PyMapping>().is_ok()
}

/// Keys that marshal to equal host values (`b'ab'` and `(97, 98)`) would merge
/// entries, so such a mapping is returned as a handle instead.
pub(crate) fn outbound_mapping<'py>(m: &OutboundMarshaler<'_, 'py>, obj: &Bound<'py, PyAny>) -> PyResult<Value> {
    let mark = m.acquired.borrow().len();
    let items = obj.downcast::<PyMapping>()?.items()?;
    let mut map = ValueMap::with_capacity(items.len()?);
    for item in items.iter()? {
        let (key, value): (Bound<'py, PyAny>, Bound<'py, PyAny>) = item?.extract()?;
        let key = m.marshal(&key)?;
        if map.contains_key(&key) {
            log::warn!(
                "[Marshal] mapping {} has distinct keys converting to {key}; returning a handle instead",
                HandleId::of(obj)
            );
            return m.degrade(mark, obj);
        }
        map.insert(key, m.marshal(&value)?);
    }
    Ok(Value::Map(map))
}

pub(crate) fn is_non_string_iterable(obj: &Bound<'_, PyAny>) -> bool {
    !obj.is_instance_of::<PyString>() && obj.get_type().hasattr("__iter__").unwrap_or(false)
}

pub(crate) fn outbound_iterable<'py>(m: &OutboundMarshaler<'_, 'py>, obj: &Bound<'py, PyAny>) -> PyResult<Value> {
    let mut items = Vec::new();
    for item in obj.iter()? {
        items.push(m.marshal(&item?)?);
    }
    Ok(Value::List(items))
}

pub(crate) fn is_integer(obj: &Bound<'_, PyAny>) -> bool {
    obj.is_instance_of::<PyLong>() && !obj.is_instance_of::<PyBool>()
}

pub(crate) fn outbound_integer(_: &OutboundMarshaler<'_, '_>, obj: &Bound<'_, PyAny>) -> PyResult<Value> {
    integer_value(obj)
}
