//! Interpreter configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Process-wide interpreter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// Load an embedded module on first publish when it is not registered
    /// yet, instead of failing. Off by default: publishing into an unknown
    /// module is normally a caller ordering bug.
    pub auto_load: bool,
    /// Directories appended to the module search path at initialize, ahead
    /// of any `add_to_scope` calls.
    pub search_paths: Vec<PathBuf>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            auto_load: false,
            search_paths: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = InterpreterConfig::default();
        assert!(!config.auto_load);
        assert!(config.search_paths.is_empty());
    }

    #[test]
    fn round_trips_through_json() {
        let config = InterpreterConfig {
            auto_load: true,
            search_paths: vec![PathBuf::from("/opt/scripts")],
        };
        let text = serde_json::to_string(&config).unwrap();
        let back: InterpreterConfig = serde_json::from_str(&text).unwrap();
        assert!(back.auto_load);
        assert_eq!(back.search_paths, config.search_paths);
    }
}
