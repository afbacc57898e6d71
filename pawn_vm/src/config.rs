//! Engine configuration.

use std::time::Duration;

use pawn_jit::{CheckMode, CompileOptions};

/// Configuration shared by every runtime an environment creates.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Compile functions to native code when the host supports it.
    pub jit_enabled: bool,
    /// Where compiled checks put their failure paths.
    pub check_mode: CheckMode,
    /// Start a watchdog with this timeout when the environment is created.
    pub watchdog_timeout: Option<Duration>,
    /// Budget for live executable memory across all runtimes.
    pub max_code_bytes: usize,
    /// Honor `BREAK` instructions.
    pub debug_breaks: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            jit_enabled: true,
            check_mode: CheckMode::Inline,
            watchdog_timeout: None,
            max_code_bytes: 64 * 1024 * 1024,
            debug_breaks: false,
        }
    }
}

impl EngineConfig {
    /// Interpret everything.
    pub fn interpreter_only() -> Self {
        Self {
            jit_enabled: false,
            ..Default::default()
        }
    }

    /// Create configuration for testing.
    pub fn for_testing() -> Self {
        Self {
            jit_enabled: true,
            check_mode: CheckMode::OutOfLine,
            watchdog_timeout: None,
            max_code_bytes: 4 * 1024 * 1024,
            debug_breaks: true,
        }
    }

    /// Options handed to the compiler.
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            check_mode: self.check_mode,
            debug: self.debug_breaks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.jit_enabled);
        assert_eq!(config.check_mode, CheckMode::Inline);
        assert!(config.watchdog_timeout.is_none());
        assert!(!config.compile_options().debug);
    }

    #[test]
    fn test_interpreter_only() {
        let config = EngineConfig::interpreter_only();
        assert!(!config.jit_enabled);
        assert_eq!(config.max_code_bytes, EngineConfig::default().max_code_bytes);
    }

    #[test]
    fn test_testing_config() {
        let config = EngineConfig::for_testing();
        let opts = config.compile_options();
        assert_eq!(opts.check_mode, CheckMode::OutOfLine);
        assert!(opts.debug);
    }
}
