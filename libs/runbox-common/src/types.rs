use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Languages the execution engine knows how to compile and run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Php,
    C,
    Cpp,
    Rust,
    Java,
    Go,
}

impl Language {
    pub const ALL: [Language; 7] = [
        Language::Python,
        Language::Php,
        Language::C,
        Language::Cpp,
        Language::Rust,
        Language::Java,
        Language::Go,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Php => "php",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Rust => "rust",
            Language::Java => "java",
            Language::Go => "go",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLanguage(pub String);

impl fmt::Display for UnknownLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported language: {}", self.0)
    }
}

impl std::error::Error for UnknownLanguage {}

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "python" => Ok(Language::Python),
            "php" => Ok(Language::Php),
            "c" => Ok(Language::C),
            "cpp" | "c++" => Ok(Language::Cpp),
            "rust" => Ok(Language::Rust),
            "java" => Ok(Language::Java),
            "go" => Ok(Language::Go),
            other => Err(UnknownLanguage(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    Success,
    Failure,
}

/// Normalized result of one code-execution job. Produced exactly once per
/// job; the caller receives either `stdout` (success) or `diagnostic`
/// (failure), never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub kind: OutcomeKind,
    pub stdout: String,
    pub diagnostic: String,
}

impl ExecutionOutcome {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Success,
            stdout: stdout.into(),
            diagnostic: String::new(),
        }
    }

    pub fn failure(diagnostic: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Failure,
            stdout: String::new(),
            diagnostic: diagnostic.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }
}

/// Error taxonomy for the execution path. Every variant is caught at the
/// runner boundary and normalized into a `Failure` outcome; none of these
/// propagate past the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Compile(String),

    #[error("{0}")]
    Runtime(String),

    #[error("execution timed out after {0}ms")]
    Timeout(u64),

    #[error("service error: {0}")]
    Service(String),
}

impl From<ExecutionError> for ExecutionOutcome {
    fn from(err: ExecutionError) -> Self {
        ExecutionOutcome::failure(err.to_string())
    }
}

/// Events a client may send over the gateway socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(rename = "execute", rename_all = "camelCase")]
    Execute {
        project_id: String,
        language: String,
        code: String,
        #[serde(default)]
        input: String,
    },

    #[serde(rename = "terminal:join", rename_all = "camelCase")]
    TerminalJoin { project_id: String },

    #[serde(rename = "terminal:write", rename_all = "camelCase")]
    TerminalWrite { project_id: String, data: String },

    /// Run a shell command whose completion is reported to the room as
    /// `terminal:command-done`.
    #[serde(rename = "terminal:run", rename_all = "camelCase")]
    TerminalRun { project_id: String, command: String },

    /// Editor delta relayed verbatim to everyone in the project's room.
    #[serde(rename = "code:change", rename_all = "camelCase")]
    CodeChange {
        project_id: String,
        delta: serde_json::Value,
    },
}

/// Events the gateway emits. Execution events go to the requesting
/// connection only; terminal events are room-scoped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "execution:result")]
    ExecutionResult { result: String },

    #[serde(rename = "execution:error")]
    ExecutionError { error: String },

    #[serde(rename = "terminal:data")]
    TerminalData { data: String },

    #[serde(rename = "terminal:command-done")]
    TerminalCommandDone,

    #[serde(rename = "terminal:closed")]
    TerminalClosed,

    #[serde(rename = "code:change")]
    CodeChange { delta: serde_json::Value },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_round_trip() {
        for lang in Language::ALL {
            assert_eq!(lang.as_str().parse::<Language>().unwrap(), lang);
        }
        assert_eq!("C++".parse::<Language>().unwrap(), Language::Cpp);
        assert_eq!("PYTHON".parse::<Language>().unwrap(), Language::Python);
    }

    #[test]
    fn test_unknown_language_message() {
        let err = "brainfuck".parse::<Language>().unwrap_err();
        assert_eq!(err.to_string(), "unsupported language: brainfuck");
    }

    #[test]
    fn test_language_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Language::Cpp).unwrap(), "\"cpp\"");
        let lang: Language = serde_json::from_str("\"go\"").unwrap();
        assert_eq!(lang, Language::Go);
    }

    #[test]
    fn test_outcome_constructors() {
        let ok = ExecutionOutcome::success("42");
        assert!(ok.is_success());
        assert_eq!(ok.stdout, "42");
        assert!(ok.diagnostic.is_empty());

        let bad = ExecutionOutcome::failure("boom");
        assert!(!bad.is_success());
        assert!(bad.stdout.is_empty());
        assert_eq!(bad.diagnostic, "boom");
    }

    #[test]
    fn test_timeout_diagnostic_names_budget() {
        let outcome: ExecutionOutcome = ExecutionError::Timeout(5000).into();
        assert!(!outcome.is_success());
        assert_eq!(outcome.diagnostic, "execution timed out after 5000ms");
    }

    #[test]
    fn test_client_event_wire_shape() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"type":"execute","projectId":"p1","language":"python","code":"print(42)","input":""}"#,
        )
        .unwrap();
        match event {
            ClientEvent::Execute {
                project_id,
                language,
                ..
            } => {
                assert_eq!(project_id, "p1");
                assert_eq!(language, "python");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // input may be omitted entirely
        let event: ClientEvent = serde_json::from_str(
            r#"{"type":"execute","projectId":"p1","language":"go","code":""}"#,
        )
        .unwrap();
        assert!(matches!(event, ClientEvent::Execute { .. }));
    }

    #[test]
    fn test_terminal_run_and_code_change_wire_shapes() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"type":"terminal:run","projectId":"p1","command":"ls -la"}"#,
        )
        .unwrap();
        match event {
            ClientEvent::TerminalRun {
                project_id,
                command,
            } => {
                assert_eq!(project_id, "p1");
                assert_eq!(command, "ls -la");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let event: ClientEvent = serde_json::from_str(
            r#"{"type":"code:change","projectId":"p1","delta":{"from":0,"insert":"x"}}"#,
        )
        .unwrap();
        let ClientEvent::CodeChange { project_id, delta } = event else {
            panic!("expected code change");
        };
        assert_eq!(project_id, "p1");
        assert_eq!(delta["insert"], "x");

        let json = serde_json::to_string(&ServerEvent::CodeChange { delta }).unwrap();
        assert_eq!(json, r#"{"type":"code:change","delta":{"from":0,"insert":"x"}}"#);
    }

    #[test]
    fn test_server_event_wire_shape() {
        let json = serde_json::to_string(&ServerEvent::ExecutionResult {
            result: "42".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"execution:result","result":"42"}"#);

        let json = serde_json::to_string(&ServerEvent::TerminalCommandDone).unwrap();
        assert_eq!(json, r#"{"type":"terminal:command-done"}"#);
    }
}
