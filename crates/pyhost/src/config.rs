//! Evaluator configuration

use std::env;
use std::path::PathBuf;

use crate::reload::ReloadPolicy;

/// Non-empty value switches off isolated mode
pub const ENV_DISABLE_ISOLATION: &str = "PYHOST_DISABLE_ISOLATION";

/// Platform path list prepended to the interpreter's module search path
pub const ENV_LIBRARY_PATH: &str = "PYHOST_LIBRARY_PATH";

/// Settings for a [`PythonEvaluator`](crate::PythonEvaluator)
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Drop user site-packages and `PYTHONPATH` entries from the default search path
    pub isolated: bool,
    /// Directories searched before the interpreter's own library
    pub library_paths: Vec<PathBuf>,
    /// Statements run once in the global namespace when the runtime starts
    pub session_imports: Vec<String>,
    /// Restore the default `sys.path` before every evaluation
    pub reset_sys_path: bool,
    /// Route script `print` output to the log and to hooks
    pub redirect_output: bool,
    /// Binding read back as the result of an evaluation
    pub output_binding: String,
    /// Reserved first binding carrying the caller's label
    pub label_binding: String,
    /// Label used when the caller supplies none
    pub default_label: String,
    /// Which modules a reset reloads
    pub reload_policy: ReloadPolicy,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            isolated: true,
            library_paths: Vec::new(),
            session_imports: Vec::new(),
            reset_sys_path: true,
            redirect_output: true,
            output_binding: "OUT".to_string(),
            label_binding: "Name".to_string(),
            default_label: "USER".to_string(),
            reload_policy: ReloadPolicy::default(),
        }
    }
}

impl EvaluatorConfig {
    /// Defaults adjusted by the process environment
    pub fn from_env() -> Self {
        Self::default().apply_env(|key| env::var_os(key).map(|v| v.to_string_lossy().into_owned()))
    }

    /// Apply environment switches read through `lookup`
    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if lookup(ENV_DISABLE_ISOLATION).is_some_and(|v| !v.is_empty()) {
            log::debug!("[Config] {ENV_DISABLE_ISOLATION} set; using the pre-existing installation's search path");
            self.isolated = false;
        }
        if let Some(paths) = lookup(ENV_LIBRARY_PATH).filter(|v| !v.is_empty()) {
            let extra: Vec<PathBuf> = env::split_paths(&paths).collect();
            log::debug!("[Config] {ENV_LIBRARY_PATH} adds {} library path(s)", extra.len());
            self.library_paths.extend(extra);
        }
        self
    }

    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_paths.push(path.into());
        self
    }

    pub fn with_session_import(mut self, statement: impl Into<String>) -> Self {
        self.session_imports.push(statement.into());
        self
    }

    pub fn with_reload_policy(mut self, policy: ReloadPolicy) -> Self {
        self.reload_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EvaluatorConfig::default();
        assert!(config.isolated);
        assert_eq!(config.output_binding, "OUT");
        assert_eq!(config.label_binding, "Name");
        assert_eq!(config.default_label, "USER");
    }

    #[test]
    fn test_env_switches() {
        let joined = env::join_paths(["/opt/a", "/opt/b"]).unwrap();
        let joined = joined.to_string_lossy().into_owned();
        let config = EvaluatorConfig::default().apply_env(|key| match key {
            ENV_DISABLE_ISOLATION => Some("1".to_string()),
            ENV_LIBRARY_PATH => Some(joined.clone()),
            _ => None,
        });

        assert!(!config.isolated);
        assert_eq!(
            config.library_paths,
            vec![PathBuf::from("/opt/a"), PathBuf::from("/opt/b")]
        );
    }

    #[test]
    fn test_empty_switch_is_ignored() {
        let config = EvaluatorConfig::default().apply_env(|key| match key {
            ENV_DISABLE_ISOLATION => Some(String::new()),
            _ => None,
        });
        assert!(config.isolated);
        assert!(config.library_paths.is_empty());
    }
}
