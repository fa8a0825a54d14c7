//! Evaluation set-up failures
//!
//! Kept in its own test binary: it breaks `import` for the whole interpreter while
//! it runs.

use pyhost::pyo3::prelude::*;
use pyhost::{EvaluatorConfig, PythonEvaluator, Value};

#[test]
fn test_setup_failure_degrades_to_null() {
    let ev = PythonEvaluator::with_config(EvaluatorConfig::default());
    assert_eq!(ev.evaluate_code("OUT = 1").unwrap(), Value::Int(1));

    let (modules, builtins) = ev
        .with_session(|s| {
            let modules = s.py().import_bound("sys").unwrap().getattr("modules").unwrap();
            let builtins = modules.get_item("builtins").unwrap();
            modules.set_item("builtins", s.py().None()).unwrap();
            (modules.unbind(), builtins.unbind())
        })
        .unwrap();

    let out = ev.evaluate_code("OUT = 1");

    ev.with_session(|s| {
        modules.bind(s.py()).set_item("builtins", builtins.bind(s.py())).unwrap();
    })
    .unwrap();

    assert_eq!(out.unwrap(), Value::Null);
    assert_eq!(ev.evaluate_code("OUT = 1").unwrap(), Value::Int(1));
}
