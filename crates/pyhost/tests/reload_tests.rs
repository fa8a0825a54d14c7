//! Hot reload tests
//!
//! Modules are written to a scratch directory placed on the library path, imported by
//! a script, rewritten, and reloaded through `reset`.

use std::fs;
use std::path::Path;

use pyhost::{EvaluatorConfig, PythonEvaluator, ReloadPolicy, Value, ENGINE_NAME};

fn evaluator_for(dir: &Path) -> PythonEvaluator {
    let config = EvaluatorConfig::default()
        .with_library_path(dir)
        .with_reload_policy(ReloadPolicy::user_modules_only());
    PythonEvaluator::with_config(config)
}

fn write_module(dir: &Path, name: &str, source: &str) {
    fs::write(dir.join(format!("{name}.py")), source).unwrap();
}

#[test]
fn test_reset_picks_up_new_source() {
    let dir = tempfile::tempdir().unwrap();
    write_module(dir.path(), "pyhost_probe_alpha", "VALUE = 1\n");
    let ev = evaluator_for(dir.path());

    let code = "import pyhost_probe_alpha\nOUT = pyhost_probe_alpha.VALUE";
    assert_eq!(ev.evaluate_code(code).unwrap(), Value::Int(1));

    // sizes differ so a stale bytecode cache is never reused
    write_module(dir.path(), "pyhost_probe_alpha", "VALUE = 20\n");
    assert_eq!(ev.evaluate_code(code).unwrap(), Value::Int(1));

    let report = ev.reset(ENGINE_NAME).unwrap().unwrap();
    assert!(report.reloaded.iter().any(|m| m == "pyhost_probe_alpha"), "{report:?}");
    assert!(report.considered >= report.reloaded.len() + report.skipped);
    assert_eq!(ev.evaluate_code(code).unwrap(), Value::Int(20));
}

#[test]
fn test_one_failure_does_not_stop_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    write_module(dir.path(), "pyhost_probe_good", "VALUE = 2\n");
    write_module(dir.path(), "pyhost_probe_bad", "VALUE = 3\n");
    let ev = evaluator_for(dir.path());

    let code = "import pyhost_probe_good, pyhost_probe_bad\nOUT = [pyhost_probe_good.VALUE, pyhost_probe_bad.VALUE]";
    assert_eq!(ev.evaluate_code(code).unwrap(), Value::from(vec![2, 3]));

    write_module(dir.path(), "pyhost_probe_good", "VALUE = 200\n");
    write_module(dir.path(), "pyhost_probe_bad", "raise RuntimeError('broken on reload')\n");

    let report = ev.reset(ENGINE_NAME).unwrap().unwrap();
    let failure = report
        .failed
        .iter()
        .find(|f| f.module == "pyhost_probe_bad")
        .expect("bad module reported");
    assert!(failure.message.contains("broken on reload"), "{}", failure.message);
    assert!(report.reloaded.iter().any(|m| m == "pyhost_probe_good"), "{report:?}");

    let out = ev.evaluate_code("import pyhost_probe_good\nOUT = pyhost_probe_good.VALUE").unwrap();
    assert_eq!(out, Value::Int(200));
}

#[test]
fn test_reset_is_scoped_to_this_engine() {
    let dir = tempfile::tempdir().unwrap();
    let ev = evaluator_for(dir.path());
    assert!(ev.reset(ENGINE_NAME).unwrap().is_none(), "not started yet");

    ev.evaluate_code("OUT = 1").unwrap();
    assert!(ev.reset("some-other-engine").unwrap().is_none());

    let report = ev.reset(ENGINE_NAME).unwrap().unwrap();
    assert!(!report.reloaded.iter().any(|m| m == "__main__"));
}

#[test]
fn test_library_path_is_searched_first() {
    let dir = tempfile::tempdir().unwrap();
    let ev = evaluator_for(dir.path());
    let expected = dir.path().to_string_lossy().into_owned();
    let out = ev.evaluate_code("import sys\nOUT = sys.path[0]").unwrap();
    assert_eq!(out, Value::String(expected));

    ev.evaluate_code("import sys\nsys.path.insert(0, '/nowhere')").unwrap();
    let out = ev.evaluate_code("import sys\nOUT = '/nowhere' in sys.path").unwrap();
    assert_eq!(out, Value::Bool(false));
}
