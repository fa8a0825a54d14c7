//! Error types for value extraction and script evaluation

use pyo3::PyErr;
use thiserror::Error;

use crate::value::ValueKind;

/// Errors that can occur when extracting a typed Rust value from a [`Value`](crate::Value)
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The value has a different shape than the requested type
    #[error("Type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch {
        expected: ValueKind,
        found: ValueKind,
    },

    /// Null where a value was required
    #[error("Unexpected null value")]
    NullValue,

    /// Integer doesn't fit the requested width
    #[error("Integer overflow: value {value} doesn't fit in {target}")]
    IntegerOverflow {
        value: String,
        target: &'static str,
    },

    /// List element conversion failed
    #[error("List element conversion failed at index {index}: {source}")]
    ListElement {
        index: usize,
        #[source]
        source: Box<ConversionError>,
    },

    /// Map entry conversion failed
    #[error("Map entry '{key}' conversion failed: {source}")]
    MapEntry {
        key: String,
        #[source]
        source: Box<ConversionError>,
    },
}

impl ConversionError {
    /// Create a type mismatch error
    pub fn type_mismatch(expected: ValueKind, found: ValueKind) -> Self {
        Self::TypeMismatch { expected, found }
    }

    /// Create a list element error
    pub fn list_element(index: usize, source: ConversionError) -> Self {
        Self::ListElement {
            index,
            source: Box::new(source),
        }
    }

    /// Create a map entry error
    pub fn map_entry(key: impl Into<String>, source: ConversionError) -> Self {
        Self::MapEntry {
            key: key.into(),
            source: Box::new(source),
        }
    }
}

/// Errors surfaced by [`PythonEvaluator`](crate::PythonEvaluator)
#[derive(Debug, Error)]
pub enum EvalError {
    /// The script raised and the interpreter produced a traceback
    #[error("{message}\n{traceback}")]
    Script { message: String, traceback: String },

    /// The script (or interpreter) raised without a traceback; kept as-is
    #[error(transparent)]
    Python(#[from] PyErr),

    /// Typed extraction of the result failed
    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// The runtime lock was requested again by the thread already holding it
    #[error("The interpreter lock is already held by this thread")]
    ReentrantLock,

    /// An operation needed the runtime before it was started
    #[error("The interpreter runtime has not been started")]
    NotStarted,
}

impl EvalError {
    /// Build the error for a failed script run, appending the traceback when one exists
    pub(crate) fn from_script_failure(err: PyErr, traceback: Option<String>) -> Self {
        match traceback {
            Some(traceback) if !traceback.is_empty() => Self::Script {
                message: err.to_string(),
                traceback,
            },
            _ => Self::Python(err),
        }
    }

    /// Whether this error came from the user's script
    pub fn is_script_failure(&self) -> bool {
        matches!(self, Self::Script { .. } | Self::Python(_))
    }
}

/// Result type for typed extraction
pub type ConversionResult<T> = Result<T, ConversionError>;

/// Result type for evaluator operations
pub type EvalResult<T> = Result<T, EvalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_error_messages() {
        let err = ConversionError::list_element(
            2,
            ConversionError::type_mismatch(ValueKind::Int, ValueKind::String),
        );
        let text = err.to_string();
        assert!(text.contains("index 2"), "{text}");
        assert!(text.contains("String"), "{text}");
    }

    #[test]
    fn test_map_entry_message() {
        let err = ConversionError::map_entry("x", ConversionError::NullValue);
        assert_eq!(
            err.to_string(),
            "Map entry 'x' conversion failed: Unexpected null value"
        );
    }
}
