//! Ordered table of type converters
//!
//! Each direction keeps its own list of `(guard, convert)` pairs. Resolution walks the
//! list in order and returns the first converter whose guard accepts the input, so
//! the order is the contract: higher priority first, then registration order.

use std::fmt;

use pyo3::prelude::*;

use crate::marshal::{self, InboundMarshaler, OutboundMarshaler};
use crate::value::Value;

/// Which way a converter moves values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to interpreter
    Inbound,
    /// Interpreter to host
    Outbound,
}

pub type InboundGuardFn = dyn Fn(&Value) -> bool + Send + Sync;

pub type InboundConvertFn =
    dyn for<'m, 'py> Fn(&InboundMarshaler<'m, 'py>, &Value) -> PyResult<Bound<'py, PyAny>> + Send + Sync;

pub type OutboundGuardFn = dyn for<'py> Fn(&Bound<'py, PyAny>) -> bool + Send + Sync;

pub type OutboundConvertFn =
    dyn for<'m, 'py> Fn(&OutboundMarshaler<'m, 'py>, &Bound<'py, PyAny>) -> PyResult<Value> + Send + Sync;

/// One registered conversion
pub struct Converter<G: ?Sized, C: ?Sized> {
    name: String,
    direction: Direction,
    priority: i32,
    guard: Box<G>,
    convert: Box<C>,
}

pub type InboundConverter = Converter<InboundGuardFn, InboundConvertFn>;
pub type OutboundConverter = Converter<OutboundGuardFn, OutboundConvertFn>;

impl<G: ?Sized, C: ?Sized> Converter<G, C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }
}

impl InboundConverter {
    pub fn accepts(&self, value: &Value) -> bool {
        (self.guard)(value)
    }

    pub fn convert<'py>(
        &self,
        marshaler: &InboundMarshaler<'_, 'py>,
        value: &Value,
    ) -> PyResult<Bound<'py, PyAny>> {
        (self.convert)(marshaler, value)
    }
}

impl OutboundConverter {
    pub fn accepts(&self, obj: &Bound<'_, PyAny>) -> bool {
        (self.guard)(obj)
    }

    pub fn convert<'py>(
        &self,
        marshaler: &OutboundMarshaler<'_, 'py>,
        obj: &Bound<'py, PyAny>,
    ) -> PyResult<Value> {
        (self.convert)(marshaler, obj)
    }
}

impl<G: ?Sized, C: ?Sized> fmt::Debug for Converter<G, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converter")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Insert keeping the list sorted by descending priority, stable within a priority
fn insert_ordered<G: ?Sized, C: ?Sized>(list: &mut Vec<Converter<G, C>>, converter: Converter<G, C>) {
    if let Some(existing) = list.iter().find(|c| c.name == converter.name) {
        log::warn!(
            "[Converters] {:?} converter '{}' registered again (priority {} then {}); resolution order decides which one runs",
            converter.direction,
            converter.name,
            existing.priority,
            converter.priority
        );
    }
    let at = list
        .iter()
        .position(|c| c.priority < converter.priority)
        .unwrap_or(list.len());
    list.insert(at, converter);
}

/// Ordered converter table for both directions
#[derive(Debug, Default)]
pub struct TypeConverterRegistry {
    inbound: Vec<InboundConverter>,
    outbound: Vec<OutboundConverter>,
}

impl TypeConverterRegistry {
    /// Empty registry; every value falls through to the marshalers' fallbacks
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in converters, in their load-bearing order.
    ///
    /// Inbound: `sequence`, `mapping`, `handle`.
    /// Outbound: `host_object`, `skip_conversion`, `mapping`, `iterable`, `integer`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register_inbound("sequence", 0, |v| matches!(v, Value::List(_)), marshal::inbound_sequence);
        registry.register_inbound("mapping", 0, |v| matches!(v, Value::Map(_)), marshal::inbound_mapping);
        registry.register_inbound("handle", 0, |v| matches!(v, Value::Handle(_)), marshal::inbound_handle);

        registry.register_outbound("host_object", 0, marshal::is_host_object, marshal::outbound_host_object);
        registry.register_outbound("skip_conversion", 0, marshal::is_marked_to_skip, marshal::outbound_skip);
        registry.register_outbound("mapping", 0, marshal::is_mapping, marshal::outbound_mapping);
        registry.register_outbound("iterable", 0, marshal::is_non_string_iterable, marshal::outbound_iterable);
        registry.register_outbound("integer", 0, marshal::is_integer, marshal::outbound_integer);

        registry
    }

    /// Append a host-to-interpreter converter
    pub fn register_inbound<G, C>(&mut self, name: impl Into<String>, priority: i32, guard: G, convert: C)
    where
        G: Fn(&Value) -> bool + Send + Sync + 'static,
        C: for<'m, 'py> Fn(&InboundMarshaler<'m, 'py>, &Value) -> PyResult<Bound<'py, PyAny>>
            + Send
            + Sync
            + 'static,
    {
        let converter = Converter {
            name: name.into(),
            direction: Direction::Inbound,
            priority,
            guard: Box::new(guard) as Box<InboundGuardFn>,
            convert: Box::new(convert) as Box<InboundConvertFn>,
        };
        log::debug!("[Converters] registered inbound '{}' (priority {priority})", converter.name);
        insert_ordered(&mut self.inbound, converter);
    }

    /// Append an interpreter-to-host converter
    pub fn register_outbound<G, C>(&mut self, name: impl Into<String>, priority: i32, guard: G, convert: C)
    where
        G: for<'py> Fn(&Bound<'py, PyAny>) -> bool + Send + Sync + 'static,
        C: for<'m, 'py> Fn(&OutboundMarshaler<'m, 'py>, &Bound<'py, PyAny>) -> PyResult<Value>
            + Send
            + Sync
            + 'static,
    {
        let converter = Converter {
            name: name.into(),
            direction: Direction::Outbound,
            priority,
            guard: Box::new(guard) as Box<OutboundGuardFn>,
            convert: Box::new(convert) as Box<OutboundConvertFn>,
        };
        log::debug!("[Converters] registered outbound '{}' (priority {priority})", converter.name);
        insert_ordered(&mut self.outbound, converter);
    }

    /// First inbound converter accepting `value`, or `None` when unhandled
    pub fn resolve_inbound(&self, value: &Value) -> Option<&InboundConverter> {
        self.inbound.iter().find(|c| c.accepts(value))
    }

    /// First outbound converter accepting `obj`, or `None` when unhandled
    pub fn resolve_outbound(&self, obj: &Bound<'_, PyAny>) -> Option<&OutboundConverter> {
        self.outbound.iter().find(|c| c.accepts(obj))
    }

    /// Converter names in resolution order
    pub fn names(&self, direction: Direction) -> Vec<&str> {
        match direction {
            Direction::Inbound => self.inbound.iter().map(|c| c.name()).collect(),
            Direction::Outbound => self.outbound.iter().map(|c| c.name()).collect(),
        }
    }

    pub fn len(&self, direction: Direction) -> usize {
        match direction {
            Direction::Inbound => self.inbound.len(),
            Direction::Outbound => self.outbound.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyo3::types::PyString;

    fn to_none<'py>(m: &InboundMarshaler<'_, 'py>, _: &Value) -> PyResult<Bound<'py, PyAny>> {
        Ok(m.py().None().into_bound(m.py()))
    }

    #[test]
    fn test_default_order() {
        let registry = TypeConverterRegistry::with_defaults();
        assert_eq!(registry.names(Direction::Inbound), ["sequence", "mapping", "handle"]);
        assert_eq!(
            registry.names(Direction::Outbound),
            ["host_object", "skip_conversion", "mapping", "iterable", "integer"]
        );
    }

    #[test]
    fn test_priority_then_registration_order() {
        let mut registry = TypeConverterRegistry::new();
        registry.register_inbound("a", 0, |_| true, to_none);
        registry.register_inbound("b", 5, |_| true, to_none);
        registry.register_inbound("c", 0, |_| true, to_none);
        registry.register_inbound("d", 5, |_| true, to_none);
        registry.register_inbound("e", -1, |_| true, to_none);

        assert_eq!(registry.names(Direction::Inbound), ["b", "d", "a", "c", "e"]);
    }

    #[test]
    fn test_first_match_wins_and_unhandled() {
        let mut registry = TypeConverterRegistry::new();
        registry.register_inbound("strings", 0, |v| v.as_str().is_some(), to_none);
        registry.register_inbound("anything", 0, |_| true, to_none);
        registry.register_inbound("never", 0, |v| v.as_str().is_some(), to_none);

        let hit = registry.resolve_inbound(&Value::from("x")).map(|c| c.name());
        assert_eq!(hit, Some("strings"));
        let hit = registry.resolve_inbound(&Value::Int(1)).map(|c| c.name());
        assert_eq!(hit, Some("anything"));

        let empty = TypeConverterRegistry::new();
        assert!(empty.resolve_inbound(&Value::Null).is_none());
    }

    #[test]
    fn test_re_registration_keeps_both() {
        let mut registry = TypeConverterRegistry::new();
        registry.register_outbound("text", 0, |o| o.is_instance_of::<PyString>(), |_, _| Ok(Value::Null));
        registry.register_outbound("text", 0, |o| o.is_instance_of::<PyString>(), |_, _| Ok(Value::Bool(true)));
        assert_eq!(registry.len(Direction::Outbound), 2);
        assert_eq!(registry.names(Direction::Outbound), ["text", "text"]);
    }
}
