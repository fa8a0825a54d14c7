//! Value - host-side representation of anything crossing the interpreter boundary
//!
//! Every result produced by outbound marshaling is one of these shapes. Interpreter
//! objects with no faithful host representation never appear raw: they are wrapped
//! in a reference-counted [`Handle`].

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::handle::Handle;

/// A datum on the host side of the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absence of a value (`None` in the interpreter)
    Null,

    /// Boolean value
    Bool(bool),

    /// Integer within signed 64-bit range
    Int(i64),

    /// Integer outside signed 64-bit range
    BigInt(BigInt),

    /// Double precision float
    Float(f64),

    /// UTF-8 string
    String(String),

    /// Ordered sequence
    List(Vec<Value>),

    /// Key-unordered mapping with unique keys
    Map(ValueMap),

    /// Opaque host object, passed to scripts without conversion
    Host(HostObject),

    /// Opaque interpreter object kept alive in the global namespace
    Handle(Handle),
}

/// Discriminant of a [`Value`], used in conversion errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    BigInt,
    Float,
    String,
    List,
    Map,
    Host,
    Handle,
}

impl Value {
    /// Build an integer value, staying in `Int` whenever the magnitude allows it
    pub fn integer(value: BigInt) -> Self {
        match i64::try_from(&value) {
            Ok(small) => Value::Int(small),
            Err(_) => Value::BigInt(value),
        }
    }

    /// Get the kind of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::BigInt(_) => ValueKind::BigInt,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
            Value::Host(_) => ValueKind::Host,
            Value::Handle(_) => ValueKind::Handle,
        }
    }

    /// Check if this is the null value
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if this is a scalar (null, bool, number or string)
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Value::Null
                | Value::Bool(_)
                | Value::Int(_)
                | Value::BigInt(_)
                | Value::Float(_)
                | Value::String(_)
        )
    }

    /// Try to get as a bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to get as a 64-bit integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::BigInt(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Try to get as an arbitrary-precision integer (widens `Int`)
    pub fn as_bigint(&self) -> Option<BigInt> {
        match self {
            Value::Int(v) => Some(BigInt::from(*v)),
            Value::BigInt(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Try to get as a float (widens integers, big ones lossily)
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::BigInt(v) => v.to_f64(),
            _ => None,
        }
    }

    /// Try to get as a string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Try to get as a list slice
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Try to get as a map
    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Try to get as an interpreter handle
    pub fn as_handle(&self) -> Option<&Handle> {
        match self {
            Value::Handle(handle) => Some(handle),
            _ => None,
        }
    }

    /// Try to get as a host object
    pub fn as_host(&self) -> Option<&HostObject> {
        match self {
            Value::Host(obj) => Some(obj),
            _ => None,
        }
    }

    /// Collect every handle reachable from this value, depth first
    pub fn handles(&self) -> Vec<Handle> {
        let mut found = Vec::new();
        self.collect_handles(&mut found);
        found
    }

    fn collect_handles(&self, found: &mut Vec<Handle>) {
        match self {
            Value::Handle(handle) => found.push(handle.clone()),
            Value::List(items) => items.iter().for_each(|v| v.collect_handles(found)),
            Value::Map(map) => {
                for (k, v) in map.iter() {
                    k.collect_handles(found);
                    v.collect_handles(found);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::BigInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Host(obj) => write!(f, "<host {}>", obj.type_name()),
            Value::Handle(handle) => write!(f, "<handle {}>", handle.id()),
        }
    }
}

// ============================================================================
// ValueMap
// ============================================================================

/// Mapping with unique keys and no meaningful order.
///
/// Keys are arbitrary [`Value`]s. Keys that can be hashed are indexed by hash; keys
/// containing floats or maps are kept on a side list and looked up by equality.
/// Equality of two maps ignores order.
#[derive(Debug, Clone, Default)]
pub struct ValueMap {
    entries: Vec<(Value, Value)>,
    index: HashMap<u64, Vec<usize>>,
    unhashed: Vec<usize>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            unhashed: Vec::new(),
        }
    }

    /// Insert an entry, returning the previous value of an equal key
    pub fn insert(&mut self, key: impl Into<Value>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        let hash = key_hash(&key);
        if let Some(at) = self.position(&key, hash) {
            return Some(mem::replace(&mut self.entries[at].1, value));
        }

        let at = self.entries.len();
        match hash {
            Some(hash) => self.index.entry(hash).or_default().push(at),
            None => self.unhashed.push(at),
        }
        self.entries.push((key, value));
        None
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<Value>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.position(key, key_hash(key)).map(|at| &self.entries[at].1)
    }

    /// Lookup by string key
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.get(&Value::from(key))
    }

    fn position(&self, key: &Value, hash: Option<u64>) -> Option<usize> {
        let candidates = match hash {
            Some(hash) => self.index.get(&hash).map_or(&[][..], Vec::as_slice),
            None => self.unhashed.as_slice(),
        };
        candidates.iter().copied().find(|&at| self.entries[at].0 == *key)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }
}

/// Hash of a key, or `None` if it contains a float or a map.
///
/// Equal values always have the same shape, so a hashable key never equals an
/// unhashable one.
fn key_hash(key: &Value) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    hash_key(key, &mut hasher)?;
    Some(hasher.finish())
}

fn hash_key(key: &Value, state: &mut DefaultHasher) -> Option<()> {
    mem::discriminant(key).hash(state);
    match key {
        Value::Null => {}
        Value::Bool(v) => v.hash(state),
        Value::Int(v) => v.hash(state),
        Value::BigInt(v) => v.hash(state),
        Value::String(s) => s.hash(state),
        Value::List(items) => {
            items.len().hash(state);
            for item in items {
                hash_key(item, state)?;
            }
        }
        Value::Host(obj) => obj.address().hash(state),
        Value::Handle(handle) => handle.id().hash(state),
        Value::Float(_) | Value::Map(_) => return None,
    }
    Some(())
}

impl PartialEq for ValueMap {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|ov| ov == v))
    }
}

impl IntoIterator for ValueMap {
    type Item = (Value, Value);
    type IntoIter = std::vec::IntoIter<(Value, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<K: Into<Value>, V: Into<Value>> FromIterator<(K, V)> for ValueMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = ValueMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

// ============================================================================
// HostObject
// ============================================================================

/// An opaque host object handed to scripts as-is.
///
/// Scripts see it as a `pyhost.HostObject` and can only pass it around; when it
/// flows back out the original object is returned unchanged.
#[derive(Clone)]
pub struct HostObject {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl HostObject {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Rust type name of the wrapped object
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    fn address(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl PartialEq for HostObject {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostObject")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// From implementations
// ============================================================================

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<BigInt> for Value {
    fn from(v: BigInt) -> Self {
        Value::integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<ValueMap> for Value {
    fn from(v: ValueMap) -> Self {
        Value::Map(v)
    }
}

impl From<HostObject> for Value {
    fn from(v: HostObject) -> Self {
        Value::Host(v)
    }
}

impl From<Handle> for Value {
    fn from(v: Handle) -> Self {
        Value::Handle(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_normalization() {
        assert_eq!(Value::integer(BigInt::from(42)), Value::Int(42));

        let big = BigInt::from(i64::MAX) + 1i64;
        assert_eq!(Value::integer(big.clone()), Value::BigInt(big));
    }

    #[test]
    fn test_accessors() {
        let int_val = Value::Int(42);
        assert_eq!(int_val.as_int(), Some(42));
        assert_eq!(int_val.as_float(), Some(42.0));
        assert_eq!(int_val.as_bigint(), Some(BigInt::from(42)));
        assert_eq!(int_val.as_str(), None);

        let str_val = Value::from("hello");
        assert_eq!(str_val.as_str(), Some("hello"));
        assert_eq!(str_val.kind(), ValueKind::String);
        assert!(str_val.is_scalar());
        assert!(!Value::List(vec![]).is_scalar());
    }

    #[test]
    fn test_map_keys_are_unique() {
        let mut map = ValueMap::new();
        assert_eq!(map.insert("a", 1), None);
        assert_eq!(map.insert("a", 2), Some(Value::Int(1)));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get_str("a"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_map_mixed_key_shapes() {
        let host = HostObject::new(5u8);
        let mut map = ValueMap::new()
            .with(1.5, "float")
            .with(vec![1, 2], "list")
            .with(Value::Map(ValueMap::new().with("k", 1)), "map")
            .with(Value::Host(host.clone()), "host");
        assert_eq!(map.len(), 4);
        assert_eq!(map.insert(1.5, "again"), Some(Value::from("float")));
        assert_eq!(map.get(&Value::from(vec![1, 2])), Some(&Value::from("list")));
        assert_eq!(map.get(&Value::Map(ValueMap::new().with("k", 1))), Some(&Value::from("map")));
        assert_eq!(map.get(&Value::Host(host)), Some(&Value::from("host")));
        assert_eq!(map.get(&Value::Host(HostObject::new(5u8))), None);
        assert_eq!(map.get(&Value::from(vec![2, 1])), None);
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn test_large_map_lookups() {
        let map: ValueMap = (0..50_000i64).map(|i| (i, i * 2)).collect();
        assert_eq!(map.len(), 50_000);
        assert_eq!(map.get(&Value::Int(49_999)), Some(&Value::Int(99_998)));
        assert!(!map.contains_key(&Value::Int(50_000)));
    }

    #[test]
    fn test_big_integers_widen_to_float() {
        let big = Value::BigInt(BigInt::from(1u64 << 63));
        assert_eq!(big.as_float(), Some(9_223_372_036_854_775_808.0));
    }

    #[test]
    fn test_map_equality_ignores_order() {
        let left = ValueMap::new().with("a", 1).with(2, "b");
        let right = ValueMap::new().with(2, "b").with("a", 1);
        assert_eq!(left, right);

        let different = ValueMap::new().with("a", 1).with(2, "c");
        assert_ne!(left, different);
    }

    #[test]
    fn test_host_object_identity() {
        let obj = HostObject::new(vec![1u8, 2, 3]);
        let same = obj.clone();
        let other = HostObject::new(vec![1u8, 2, 3]);

        assert_eq!(obj, same);
        assert_ne!(obj, other);
        assert_eq!(obj.downcast_ref::<Vec<u8>>(), Some(&vec![1, 2, 3]));
        assert!(obj.type_name().contains("Vec"));
    }

    #[test]
    fn test_nested_from_and_display() {
        let value = Value::from(vec![Value::from(1), Value::from(vec!["x", "y"])]);
        assert_eq!(value.to_string(), r#"[1, ["x", "y"]]"#);
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }
}
