/// Execution Dispatcher - Request Routing
///
/// **Responsibility:**
/// Turn a raw `(language, code, input)` request into exactly one
/// `ExecutionOutcome` by routing to the Language Runner.
///
/// This module is the glue layer - it knows nothing about:
/// - How code compiles or runs (runner's job)
/// - The wire format (gateway's job)
///
/// Calls are fully independent: the only shared state is the scratch
/// filesystem namespace, partitioned per job by workspace token, so any
/// number of executions may run concurrently.
use std::time::{Duration, Instant};

use runbox_common::types::{ExecutionOutcome, Language};
use tracing::instrument;

use crate::runner;
use crate::workspace::WorkspaceManager;

/// One run request. Exists only for the duration of the call; owned by the
/// dispatcher frame and discarded with the outcome.
struct ExecutionJob {
    language: Language,
    source_code: String,
    stdin: String,
    created_at: Instant,
}

pub struct Dispatcher {
    workspaces: WorkspaceManager,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(workspaces: WorkspaceManager, timeout: Duration) -> Self {
        Self {
            workspaces,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute a request. An unknown language name is a normal `Failure`
    /// outcome, not an error; the caller always gets exactly one outcome.
    #[instrument(skip(self, code, input), fields(language = %language))]
    pub async fn execute(&self, language: &str, code: &str, input: &str) -> ExecutionOutcome {
        let language = match language.parse::<Language>() {
            Ok(language) => language,
            Err(unknown) => return ExecutionOutcome::failure(unknown.to_string()),
        };

        let job = ExecutionJob {
            language,
            source_code: code.to_string(),
            stdin: input.to_string(),
            created_at: Instant::now(),
        };

        let outcome = runner::run_job(
            &self.workspaces,
            job.language,
            &job.source_code,
            &job.stdin,
            self.timeout,
        )
        .await;

        tracing::debug!(
            total_ms = job.created_at.elapsed().as_millis() as u64,
            success = outcome.is_success(),
            "Request dispatched"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> (tempfile::TempDir, Dispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = WorkspaceManager::new(dir.path()).unwrap();
        (dir, Dispatcher::new(workspaces, Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_unknown_language_is_failure_outcome() {
        let (_dir, dispatcher) = dispatcher();
        let outcome = dispatcher.execute("cobol", "DISPLAY '42'.", "").await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.diagnostic, "unsupported language: cobol");
    }

    #[tokio::test]
    async fn test_language_name_is_case_insensitive() {
        let (_dir, dispatcher) = dispatcher();
        // Parses as a known language, so the diagnostic (if any) comes from
        // the toolchain rather than language routing
        let outcome = dispatcher.execute("Python", "print(42)", "").await;
        assert_ne!(outcome.diagnostic, "unsupported language: python");
    }
}
