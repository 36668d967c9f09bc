// Service configuration, read from the environment with defaults.

use std::path::PathBuf;

pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the gateway listens on.
    pub bind_addr: String,
    /// Writable scratch directory for execution workspaces; created at
    /// startup if absent.
    pub scratch_dir: PathBuf,
    /// Wall-clock budget per execution job, in milliseconds.
    pub timeout_ms: u64,
    /// Shell executable for terminal sessions.
    pub shell: String,
    /// Default terminal dimensions.
    pub term_cols: u16,
    pub term_rows: u16,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("RUNBOX_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            scratch_dir: std::env::var("RUNBOX_SCRATCH_DIR")
                .unwrap_or_else(|_| "./scratch".to_string())
                .into(),
            timeout_ms: env_u64("RUNBOX_TIMEOUT_MS", DEFAULT_TIMEOUT_MS),
            shell: std::env::var("RUNBOX_SHELL").unwrap_or_else(|_| "/bin/bash".to_string()),
            term_cols: env_u64("RUNBOX_TERM_COLS", 80) as u16,
            term_rows: env_u64("RUNBOX_TERM_ROWS", 24) as u16,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        // Runs without any RUNBOX_* variables set in the test environment
        let config = ServerConfig::from_env();
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.term_cols, 80);
        assert_eq!(config.term_rows, 24);
        assert!(!config.shell.is_empty());
    }

    #[test]
    fn test_env_u64_rejects_garbage() {
        std::env::set_var("RUNBOX_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_u64("RUNBOX_TEST_GARBAGE", 7), 7);
        std::env::remove_var("RUNBOX_TEST_GARBAGE");
    }
}
