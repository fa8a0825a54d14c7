//! Handle lifetime tests
//!
//! These tests verify:
//! - Identity-based equality and reference counting across evaluations
//! - Removal from the global namespace after the last release
//! - Handles flowing back into later calls
//! - Guards and string forms

use pyhost::pyo3::prelude::*;
use pyhost::{EvaluatorConfig, Handle, PythonEvaluator, Release, Value};

fn evaluator() -> PythonEvaluator {
    PythonEvaluator::with_config(EvaluatorConfig::default())
}

fn handle_of(value: &Value) -> Handle {
    value.as_handle().cloned().expect("expected a handle")
}

fn in_namespace(ev: &PythonEvaluator, handle: &Handle) -> bool {
    ev.with_session(|s| s.handles().contains(s.token(), handle)).unwrap()
}

// ============================================================================
// Counting
// ============================================================================

mod counting_tests {
    use super::*;

    #[test]
    fn test_back_to_back_calls_share_identity() {
        let ev = evaluator();
        let code = "import collections\nOUT = collections";

        let first = handle_of(&ev.evaluate_code(code).unwrap());
        let second = handle_of(&ev.evaluate_code(code).unwrap());
        assert_eq!(first, second);
        assert_eq!(ev.ref_count(&first), 2);
        assert_eq!(ev.handle_count(), 1);

        let same_object = ev
            .with_session(|s| {
                let a = s.resolve(&first).unwrap();
                let b = s.resolve(&second).unwrap();
                let module = s.py().import_bound("collections").unwrap();
                a.is(&b) && a.is(&module)
            })
            .unwrap();
        assert!(same_object);

        assert_eq!(ev.release(&first).unwrap(), Release::Decremented(1));
        assert!(in_namespace(&ev, &second));
        assert_eq!(ev.release(&second).unwrap(), Release::Destroyed);
        assert!(!in_namespace(&ev, &second));
        assert_eq!(ev.handle_count(), 0);
        assert_eq!(ev.release(&second).unwrap(), Release::Unknown);
    }

    #[test]
    fn test_retain_counts_again() {
        let ev = evaluator();
        let handle = handle_of(&ev.evaluate_code("OUT = object()").unwrap());
        let extra = ev.with_session(|s| s.handles().retain(&handle)).unwrap().unwrap();
        assert_eq!(extra, handle);
        assert_eq!(ev.ref_count(&handle), 2);

        ev.release(&extra).unwrap();
        ev.release(&handle).unwrap();
        assert!(!in_namespace(&ev, &handle));
    }

    #[test]
    fn test_release_value_walks_containers() {
        let ev = evaluator();
        let out = ev.evaluate_code("o = object()\nOUT = {'a': o, 'b': [o, object()]}").unwrap();
        assert_eq!(out.handles().len(), 3);
        assert_eq!(ev.handle_count(), 2);

        assert_eq!(ev.release_value(&out).unwrap(), 2);
        assert_eq!(ev.handle_count(), 0);
    }

    #[test]
    fn test_failed_conversion_releases_partial_handles() {
        let ev = evaluator();
        let code = "\
def gen():
    yield object()
    yield object()
    raise RuntimeError('stop')
OUT = gen()";
        let out = ev.evaluate_code(code).unwrap();
        let handle = handle_of(&out);
        assert_eq!(ev.ref_count(&handle), 1);
        assert_eq!(ev.handle_count(), 1);

        assert_eq!(ev.release_value(&out).unwrap(), 1);
        assert_eq!(ev.handle_count(), 0);
    }

    #[test]
    fn test_release_before_start() {
        let ev = evaluator();
        let other = evaluator();
        let handle = handle_of(&other.evaluate_code("OUT = object()").unwrap());
        assert!(ev.release(&handle).is_err());
        other.release(&handle).unwrap();
    }
}

// ============================================================================
// Handles in later calls
// ============================================================================

mod flow_tests {
    use super::*;

    #[test]
    fn test_handle_resolves_inbound() {
        let ev = evaluator();
        let f = handle_of(&ev.evaluate_code("def f(x):\n    return x + 1\nOUT = f").unwrap());

        let out = ev
            .evaluate("OUT = f(n)", &["f", "n"], &[Value::Handle(f.clone()), Value::Int(2)])
            .unwrap();
        assert_eq!(out, Value::Int(3));
        ev.release(&f).unwrap();
    }

    #[test]
    fn test_released_handle_passes_its_identity() {
        let ev = evaluator();
        let h = handle_of(&ev.evaluate_code("OUT = object()").unwrap());
        ev.release(&h).unwrap();

        let out = ev.evaluate("OUT = h", &["h"], &[Value::Handle(h.clone())]).unwrap();
        assert_eq!(out, Value::String(h.id().to_string()));
    }

    #[test]
    fn test_self_reference_yields_inner_handle() {
        let ev = evaluator();
        let out = ev.evaluate_code("a = [1]\na.append(a)\nOUT = a").unwrap();

        let items = out.as_list().unwrap();
        assert_eq!(items[0], Value::Int(1));
        let inner = handle_of(&items[1]);
        let is_same_list = ev
            .with_session(|s| s.resolve(&inner).map(|obj| obj.len().unwrap_or(0)) == Some(2))
            .unwrap();
        assert!(is_same_list);
        ev.release(&inner).unwrap();
    }
}

// ============================================================================
// Guards and display
// ============================================================================

mod guard_tests {
    use super::*;

    #[test]
    fn test_guard_releases_on_drop() {
        let ev = evaluator();
        let handle = handle_of(&ev.evaluate_code("OUT = object()").unwrap());
        {
            let guard = ev.guard(handle.clone());
            assert_eq!(guard.id(), handle.id());
        }
        assert_eq!(ev.handle_count(), 0);
    }

    #[test]
    fn test_into_inner_disarms() {
        let ev = evaluator();
        let handle = handle_of(&ev.evaluate_code("OUT = object()").unwrap());
        let back = ev.guard(handle).into_inner();
        assert_eq!(ev.ref_count(&back), 1);
        ev.release(&back).unwrap();
    }

    #[test]
    fn test_display_falls_back_after_release() {
        let ev = evaluator();
        let handle = handle_of(&ev.evaluate_code("class Thing:\n    def __str__(self):\n        return 'thing!'\nOUT = Thing()").unwrap());
        assert_eq!(ev.handle_to_string(&handle).unwrap(), "thing!");
        ev.release(&handle).unwrap();
        assert_eq!(ev.handle_to_string(&handle).unwrap(), handle.id().to_string());
    }
}
