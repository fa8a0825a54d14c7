//! # pyhost - embedded Python evaluation for Rust hosts
//!
//! This crate runs Python snippets inside the host process and moves values across
//! the boundary in both directions.
//!
//! ## Key Features
//!
//! - **Evaluation**: `evaluate(code, names, values)` runs a snippet in a fresh scope and
//!   returns its `OUT` binding
//! - **Value marshaling**: an ordered, user-extendable table of converters between
//!   [`Value`] and interpreter objects
//! - **Opaque handles**: interpreter objects with no host representation come back as
//!   reference-counted [`Handle`]s that can be passed into later calls
//! - **Exclusive access**: every interpreter touch goes through one process-wide lock,
//!   enforced by the [`InterpreterToken`] type
//! - **Hot reloading**: `reset("pyhost")` re-executes imported modules in place
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pyhost::{PythonEvaluator, Value};
//!
//! let evaluator = PythonEvaluator::new();
//!
//! let out = evaluator.evaluate("OUT = [x, x * 2]", &["x"], &[Value::Int(21)])?;
//! assert_eq!(out, Value::from(vec![21, 42]));
//!
//! // Anything without a native shape comes back as a handle
//! let handle = evaluator.evaluate_code("OUT = object()")?;
//! if let Value::Handle(h) = &handle {
//!     let _guard = evaluator.guard(h.clone());
//! }
//! # Ok::<(), pyhost::EvalError>(())
//! ```
//!
//! ## Handles
//!
//! Every handle returned by an evaluation counts one reference to its object in the
//! interpreter's `global` namespace. Release it with [`PythonEvaluator::release`] or
//! wrap it in a [`HandleGuard`]; the object is dropped from the namespace once the
//! last reference is gone.

mod config;
mod convert;
mod error;
mod evaluator;
mod handle;
mod lock;
mod marshal;
mod registry;
mod reload;
mod scope;
mod value;

pub use config::{EvaluatorConfig, ENV_DISABLE_ISOLATION, ENV_LIBRARY_PATH};
pub use convert::{FromValue, IntoValue};
pub use error::{ConversionError, ConversionResult, EvalError, EvalResult};
pub use evaluator::{
    EvaluationHooks, EvaluationState, HandleGuard, PythonEvaluator, Session, ENGINE_NAME,
};
pub use handle::{
    GlobalNamespace, Handle, HandleId, HandleRegistry, Release, GLOBAL_NAMESPACE_NAME,
    HANDLE_KEY_PREFIX,
};
pub use lock::{ExclusiveRuntimeLock, InterpreterToken};
pub use marshal::{InboundMarshaler, OutboundMarshaler, PyHostObject, SKIP_CONVERSION_ATTR};
pub use registry::{
    Converter, Direction, InboundConverter, OutboundConverter, TypeConverterRegistry,
};
pub use reload::{ReloadCoordinator, ReloadFailure, ReloadPolicy, ReloadReport};
pub use scope::{ExecutionScope, ScopeReader, ScopeState, ScopeWriter, ScriptOutput};
pub use value::{HostObject, Value, ValueKind, ValueMap};

// Re-export the interpreter bindings used in converter signatures
pub use pyo3;
