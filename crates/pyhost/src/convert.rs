//! Conversion traits between Rust types and [`Value`]
//!
//! `FromValue` extracts a typed result from an evaluation; `IntoValue` builds binding
//! values from Rust data.

use std::collections::HashMap;

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::error::{ConversionError, ConversionResult};
use crate::handle::Handle;
use crate::value::{HostObject, Value, ValueKind, ValueMap};

/// Convert a [`Value`] into a Rust type.
///
/// # Example
///
/// ```rust
/// use pyhost::{FromValue, Value};
///
/// let n = i32::from_value(Value::Int(42)).unwrap();
/// assert_eq!(n, 42);
/// ```
pub trait FromValue: Sized {
    fn from_value(value: Value) -> ConversionResult<Self>;
}

/// Convert a Rust type into a [`Value`].
pub trait IntoValue {
    fn into_value(self) -> Value;
}

impl<T: Into<Value>> IntoValue for T {
    fn into_value(self) -> Value {
        self.into()
    }
}

// ============================================================================
// Scalars
// ============================================================================

impl FromValue for Value {
    fn from_value(value: Value) -> ConversionResult<Self> {
        Ok(value)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> ConversionResult<Self> {
        match value {
            Value::Bool(v) => Ok(v),
            Value::Null => Err(ConversionError::NullValue),
            other => Err(ConversionError::type_mismatch(ValueKind::Bool, other.kind())),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> ConversionResult<Self> {
        match value {
            Value::Int(v) => Ok(v),
            Value::BigInt(v) => Err(ConversionError::IntegerOverflow {
                value: v.to_string(),
                target: "i64",
            }),
            Value::Null => Err(ConversionError::NullValue),
            other => Err(ConversionError::type_mismatch(ValueKind::Int, other.kind())),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> ConversionResult<Self> {
        let wide = i64::from_value(value).map_err(|err| match err {
            ConversionError::IntegerOverflow { value, .. } => ConversionError::IntegerOverflow {
                value,
                target: "i32",
            },
            other => other,
        })?;
        i32::try_from(wide).map_err(|_| ConversionError::IntegerOverflow {
            value: wide.to_string(),
            target: "i32",
        })
    }
}

impl FromValue for BigInt {
    fn from_value(value: Value) -> ConversionResult<Self> {
        match value {
            Value::Int(v) => Ok(BigInt::from(v)),
            Value::BigInt(v) => Ok(v),
            Value::Null => Err(ConversionError::NullValue),
            other => Err(ConversionError::type_mismatch(ValueKind::BigInt, other.kind())),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> ConversionResult<Self> {
        match value {
            Value::Float(v) => Ok(v),
            Value::Int(v) => Ok(v as f64),
            Value::BigInt(v) => v
                .to_f64()
                .ok_or_else(|| ConversionError::type_mismatch(ValueKind::Float, ValueKind::BigInt)),
            Value::Null => Err(ConversionError::NullValue),
            other => Err(ConversionError::type_mismatch(ValueKind::Float, other.kind())),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> ConversionResult<Self> {
        match value {
            Value::String(s) => Ok(s),
            Value::Null => Err(ConversionError::NullValue),
            other => Err(ConversionError::type_mismatch(ValueKind::String, other.kind())),
        }
    }
}

impl FromValue for Handle {
    fn from_value(value: Value) -> ConversionResult<Self> {
        match value {
            Value::Handle(h) => Ok(h),
            Value::Null => Err(ConversionError::NullValue),
            other => Err(ConversionError::type_mismatch(ValueKind::Handle, other.kind())),
        }
    }
}

impl FromValue for HostObject {
    fn from_value(value: Value) -> ConversionResult<Self> {
        match value {
            Value::Host(obj) => Ok(obj),
            Value::Null => Err(ConversionError::NullValue),
            other => Err(ConversionError::type_mismatch(ValueKind::Host, other.kind())),
        }
    }
}

// ============================================================================
// Containers
// ============================================================================

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> ConversionResult<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> ConversionResult<Self> {
        match value {
            Value::List(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| T::from_value(item).map_err(|e| ConversionError::list_element(i, e)))
                .collect(),
            other => Err(ConversionError::type_mismatch(ValueKind::List, other.kind())),
        }
    }
}

impl<T: FromValue> FromValue for HashMap<String, T> {
    fn from_value(value: Value) -> ConversionResult<Self> {
        let Value::Map(map) = value else {
            return Err(ConversionError::type_mismatch(ValueKind::Map, value.kind()));
        };
        let mut out = HashMap::with_capacity(map.len());
        for (key, item) in map {
            let key = match key {
                Value::String(s) => s,
                other => {
                    let name = other.to_string();
                    return Err(ConversionError::map_entry(
                        name,
                        ConversionError::type_mismatch(ValueKind::String, other.kind()),
                    ));
                }
            };
            let item = T::from_value(item).map_err(|e| ConversionError::map_entry(key.clone(), e))?;
            out.insert(key, item);
        }
        Ok(out)
    }
}

impl<T: Into<Value>> From<HashMap<String, T>> for Value {
    fn from(map: HashMap<String, T>) -> Self {
        Value::Map(map.into_iter().collect::<ValueMap>())
    }
}
