//! Selective module reloading without restarting the interpreter

use std::path::PathBuf;

use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::lock::InterpreterToken;

/// Which modules a reload may touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadPolicy {
    /// Module names that are never reloaded
    pub protected: Vec<String>,
    /// Also skip modules living under the interpreter's own prefixes
    pub skip_interpreter_prefix: bool,
}

impl Default for ReloadPolicy {
    fn default() -> Self {
        Self {
            // the running entry module, and its multiprocessing alias
            protected: vec!["__main__".to_string(), "__mp_main__".to_string()],
            skip_interpreter_prefix: false,
        }
    }
}

impl ReloadPolicy {
    /// Only reload modules outside the interpreter installation
    pub fn user_modules_only() -> Self {
        Self {
            skip_interpreter_prefix: true,
            ..Self::default()
        }
    }
}

/// A module whose reload raised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadFailure {
    pub module: String,
    pub message: String,
}

/// What a reload pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub considered: usize,
    pub reloaded: Vec<String>,
    pub skipped: usize,
    pub failed: Vec<ReloadFailure>,
}

impl ReloadReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Re-executes previously imported modules in place.
#[derive(Debug, Clone)]
pub struct ReloadCoordinator {
    policy: ReloadPolicy,
}

impl ReloadCoordinator {
    pub fn new(policy: ReloadPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ReloadPolicy {
        &self.policy
    }

    /// Reload every eligible module in `sys.modules`.
    ///
    /// Fails only if `sys.modules` itself cannot be read; a module that fails to
    /// reload is recorded in the report and the pass continues.
    pub fn reload(&self, token: InterpreterToken<'_>) -> PyResult<ReloadReport> {
        let py = token.py();
        let sys = PyModule::import_bound(py, "sys")?;
        let importlib = PyModule::import_bound(py, "importlib")?;
        let prefixes = if self.policy.skip_interpreter_prefix {
            interpreter_prefixes(&sys)?
        } else {
            Vec::new()
        };

        // copy so reloading can't mutate what we iterate
        let modules = sys.getattr("modules")?.downcast_into::<PyDict>()?.copy()?;

        let mut report = ReloadReport::default();
        for (name, module) in modules.iter() {
            report.considered += 1;
            let name = name.str()?.to_string();
            if self.reload_target(py, &name, &module, &prefixes).is_none() {
                report.skipped += 1;
                continue;
            }

            log::debug!("[Reload] reloading {name}");
            match importlib.call_method1("reload", (module,)) {
                Ok(_) => report.reloaded.push(name),
                Err(err) => {
                    log::warn!("[Reload] failed to reload {name}: {err}");
                    report.failed.push(ReloadFailure {
                        module: name,
                        message: err.to_string(),
                    });
                }
            }
        }

        log::info!(
            "[Reload] {} reloaded, {} skipped, {} failed",
            report.reloaded.len(),
            report.skipped,
            report.failed.len()
        );
        Ok(report)
    }

    /// Source file to reload from, or `None` if the module is not eligible
    fn reload_target(
        &self,
        py: Python<'_>,
        name: &str,
        module: &Bound<'_, PyAny>,
        prefixes: &[PathBuf],
    ) -> Option<PathBuf> {
        let file: String = module.getattr("__file__").ok()?.extract().ok()?;

        let module_name: Option<String> = module
            .getattr("__name__")
            .ok()
            .and_then(|n| n.extract().ok());
        let module_name = module_name?;
        if self.policy.protected.iter().any(|p| *p == module_name || p == name) {
            return None;
        }

        let path = PathBuf::from(&file);
        if prefixes.iter().any(|prefix| path.starts_with(prefix)) {
            return None;
        }

        let is_source = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("py"));
        if is_source {
            return Some(path);
        }
        source_from_cache(py, &file)
    }
}

impl Default for ReloadCoordinator {
    fn default() -> Self {
        Self::new(ReloadPolicy::default())
    }
}

fn source_from_cache(py: Python<'_>, file: &str) -> Option<PathBuf> {
    let util = PyModule::import_bound(py, "importlib.util").ok()?;
    let source: String = util
        .call_method1("source_from_cache", (file,))
        .ok()?
        .extract()
        .ok()?;
    Some(PathBuf::from(source))
}

fn interpreter_prefixes(sys: &Bound<'_, PyModule>) -> PyResult<Vec<PathBuf>> {
    let mut prefixes: Vec<PathBuf> = Vec::new();
    for attr in ["prefix", "base_prefix", "exec_prefix", "base_exec_prefix"] {
        let prefix: String = sys.getattr(attr)?.extract()?;
        let prefix = PathBuf::from(prefix);
        if !prefix.as_os_str().is_empty() && !prefixes.contains(&prefix) {
            prefixes.push(prefix);
        }
    }
    Ok(prefixes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_protects_entry_modules() {
        let policy = ReloadPolicy::default();
        assert!(policy.protected.contains(&"__main__".to_string()));
        assert!(policy.protected.contains(&"__mp_main__".to_string()));
        assert!(!policy.skip_interpreter_prefix);
        assert!(ReloadPolicy::user_modules_only().skip_interpreter_prefix);
    }
}
