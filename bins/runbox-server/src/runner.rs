/// Language Runner - Compile/Run Execution Core
///
/// **Core Responsibility:**
/// Turn `(language, source, stdin)` into exactly one `ExecutionOutcome`
/// under a hard wall-clock budget.
///
/// **Critical Architectural Boundary:**
/// - Runner knows HOW each toolchain compiles and runs
/// - Runner does NOT know the wire format or who asked
/// - Every failure mode (compile, runtime, timeout, OS error) is normalized
///   here; nothing propagates past the dispatcher
///
/// One polymorphic flow covers all languages via `LanguageKind` variants
/// instead of a copy of the compile/run/cleanup dance per language. The
/// workspace guard enforces the cleanup invariant on every exit path.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use runbox_common::types::{ExecutionError, ExecutionOutcome, Language};
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::workspace::{Workspace, WorkspaceManager};

/// Safety limits so pathological payloads never reach the toolchains
const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
const MAX_STDIN_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Fixed entry-point class for VM languages. The submitted source is
/// untrusted and arbitrary, so the class name cannot be derived from it.
const VM_ENTRY_POINT: &str = "Main";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LanguageKind {
    /// No compile step; the interpreter reads the source file directly.
    Interpreted {
        interpreter: &'static str,
        args: &'static [&'static str],
    },
    /// Separate compile step producing a native executable in the
    /// workspace, then the binary runs on its own.
    CompiledNative { compiler: &'static str },
    /// Compile to bytecode in a per-job subdirectory, then launch the VM
    /// with that subdirectory as working directory.
    CompiledVm {
        compiler: &'static str,
        launcher: &'static str,
    },
    /// The toolchain compiles and runs in a single invocation.
    ToolchainRun {
        tool: &'static str,
        subcommand: &'static str,
    },
}

#[derive(Debug, Clone, Copy)]
struct Toolchain {
    kind: LanguageKind,
    source_suffix: &'static str,
}

fn toolchain(language: Language) -> Toolchain {
    match language {
        Language::Python => Toolchain {
            kind: LanguageKind::Interpreted {
                interpreter: "python3",
                // unbuffered so partial output survives a timeout kill
                args: &["-u"],
            },
            source_suffix: "py",
        },
        Language::Php => Toolchain {
            kind: LanguageKind::Interpreted {
                interpreter: "php",
                args: &[],
            },
            source_suffix: "php",
        },
        Language::C => Toolchain {
            kind: LanguageKind::CompiledNative { compiler: "gcc" },
            source_suffix: "c",
        },
        Language::Cpp => Toolchain {
            kind: LanguageKind::CompiledNative { compiler: "g++" },
            source_suffix: "cpp",
        },
        Language::Rust => Toolchain {
            kind: LanguageKind::CompiledNative { compiler: "rustc" },
            source_suffix: "rs",
        },
        Language::Java => Toolchain {
            kind: LanguageKind::CompiledVm {
                compiler: "javac",
                launcher: "java",
            },
            source_suffix: "java",
        },
        Language::Go => Toolchain {
            kind: LanguageKind::ToolchainRun {
                tool: "go",
                subcommand: "run",
            },
            source_suffix: "go",
        },
    }
}

/// Execute one job end to end: acquire a workspace, compile if the
/// language needs it, run under the wall-clock budget, and normalize the
/// result. The workspace guard releases every on-disk artifact when this
/// function returns, whichever branch was taken.
#[instrument(skip(manager, source_code, stdin), fields(language = %language))]
pub async fn run_job(
    manager: &WorkspaceManager,
    language: Language,
    source_code: &str,
    stdin: &str,
    timeout: Duration,
) -> ExecutionOutcome {
    let started = Instant::now();
    match run_job_inner(manager, language, source_code, stdin, timeout).await {
        Ok(stdout) => {
            debug!(
                execution_ms = started.elapsed().as_millis() as u64,
                "Job succeeded"
            );
            ExecutionOutcome::success(stdout)
        }
        Err(err) => {
            info!(
                execution_ms = started.elapsed().as_millis() as u64,
                error = %err,
                "Job failed"
            );
            ExecutionOutcome::from(err)
        }
    }
}

async fn run_job_inner(
    manager: &WorkspaceManager,
    language: Language,
    source_code: &str,
    stdin: &str,
    timeout: Duration,
) -> Result<String, ExecutionError> {
    if source_code.len() > MAX_SOURCE_CODE_BYTES {
        return Err(ExecutionError::Service(format!(
            "source code exceeds maximum size of {} bytes",
            MAX_SOURCE_CODE_BYTES
        )));
    }
    if stdin.len() > MAX_STDIN_BYTES {
        return Err(ExecutionError::Service(format!(
            "input exceeds maximum size of {} bytes",
            MAX_STDIN_BYTES
        )));
    }

    let tc = toolchain(language);
    let mut workspace = manager.allocate();

    let input_path = workspace.path_for("in");
    std::fs::write(&input_path, stdin)
        .map_err(|e| ExecutionError::Service(format!("failed to write input file: {e}")))?;

    let run_cmd = match tc.kind {
        LanguageKind::Interpreted { interpreter, args } => {
            let source_path = write_source(&mut workspace, tc.source_suffix, source_code)?;
            let mut cmd = Command::new(interpreter);
            cmd.args(args).arg(&source_path);
            cmd
        }
        LanguageKind::ToolchainRun { tool, subcommand } => {
            let source_path = write_source(&mut workspace, tc.source_suffix, source_code)?;
            let mut cmd = Command::new(tool);
            cmd.arg(subcommand).arg(&source_path);
            cmd
        }
        LanguageKind::CompiledNative { compiler } => {
            let source_path = write_source(&mut workspace, tc.source_suffix, source_code)?;
            let exe_path = workspace.path_for("out");
            let mut compile = Command::new(compiler);
            compile.arg(&source_path).arg("-o").arg(&exe_path);
            run_compile_step(compile, timeout).await?;
            // compilers do not guarantee the execute bit across platforms
            make_executable(&exe_path)?;
            Command::new(&exe_path)
        }
        LanguageKind::CompiledVm { compiler, launcher } => {
            let job_dir = workspace
                .dir_for("classes")
                .map_err(|e| ExecutionError::Service(e.to_string()))?;
            let source_path = job_dir.join(format!("{}.{}", VM_ENTRY_POINT, tc.source_suffix));
            std::fs::write(&source_path, source_code)
                .map_err(|e| ExecutionError::Service(format!("failed to write source file: {e}")))?;
            let mut compile = Command::new(compiler);
            compile.arg(&source_path).current_dir(&job_dir);
            run_compile_step(compile, timeout).await?;
            let mut cmd = Command::new(launcher);
            cmd.arg(VM_ENTRY_POINT).current_dir(&job_dir);
            cmd
        }
    };

    run_step(run_cmd, &input_path, timeout).await
    // `workspace` drops here on every path and removes the job's files
}

fn write_source(
    workspace: &mut Workspace,
    suffix: &str,
    source_code: &str,
) -> Result<PathBuf, ExecutionError> {
    let path = workspace.path_for(suffix);
    std::fs::write(&path, source_code)
        .map_err(|e| ExecutionError::Service(format!("failed to write source file: {e}")))?;
    Ok(path)
}

/// Run a compile step under the same budget as the job. A non-zero exit or
/// any diagnostic output fails the job with the compiler's text and skips
/// the run step. The compiler runs in its own process group like the run
/// step, so a timeout takes its helper processes down with it.
async fn run_compile_step(mut cmd: Command, timeout: Duration) -> Result<(), ExecutionError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd
        .spawn()
        .map_err(|e| ExecutionError::Service(format!("failed to run compiler: {e}")))?;
    let pid = child.id();

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| {
            ExecutionError::Service(format!("failed to collect compiler output: {e}"))
        })?,
        Err(_) => {
            kill_process_group(pid);
            return Err(ExecutionError::Timeout(timeout.as_millis() as u64));
        }
    };

    let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
    if !output.status.success() || !stderr.is_empty() {
        let diagnostic = if !stderr.is_empty() {
            stderr
        } else {
            let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
            if stdout.is_empty() {
                format!("compiler exited with {}", output.status)
            } else {
                stdout
            }
        };
        return Err(ExecutionError::Compile(diagnostic));
    }
    Ok(())
}

/// Run the job's process with stdin redirected from the input file, under
/// the wall-clock budget. On expiry the whole process group is killed, so
/// toolchain wrappers take their children with them.
async fn run_step(
    mut cmd: Command,
    input_path: &Path,
    timeout: Duration,
) -> Result<String, ExecutionError> {
    let input = std::fs::File::open(input_path)
        .map_err(|e| ExecutionError::Service(format!("failed to open input file: {e}")))?;
    cmd.stdin(Stdio::from(input))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd
        .spawn()
        .map_err(|e| ExecutionError::Service(format!("failed to spawn process: {e}")))?;
    let pid = child.id();

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result
            .map_err(|e| ExecutionError::Service(format!("failed to collect process output: {e}")))?,
        Err(_) => {
            kill_process_group(pid);
            return Err(ExecutionError::Timeout(timeout.as_millis() as u64));
        }
    };

    let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
    if !stderr.is_empty() {
        return Err(ExecutionError::Runtime(stderr));
    }
    if !output.status.success() {
        return Err(ExecutionError::Runtime(format!(
            "process exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

fn make_executable(path: &Path) -> Result<(), ExecutionError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| ExecutionError::Service(format!("failed to mark binary executable: {e}")))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // the child was made its own group leader at spawn; a negative pid
        // targets the whole group
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input_file(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("stdin.in");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn test_toolchain_table() {
        assert_eq!(toolchain(Language::Python).source_suffix, "py");
        assert_eq!(toolchain(Language::Java).source_suffix, "java");
        assert!(matches!(
            toolchain(Language::C).kind,
            LanguageKind::CompiledNative { compiler: "gcc" }
        ));
        assert!(matches!(
            toolchain(Language::Go).kind,
            LanguageKind::ToolchainRun { tool: "go", .. }
        ));
        assert!(matches!(
            toolchain(Language::Java).kind,
            LanguageKind::CompiledVm { .. }
        ));
    }

    #[tokio::test]
    async fn test_run_step_trims_trailing_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let input = input_file(&dir, "");
        let stdout = run_step(sh("echo 42"), &input, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stdout, "42");
    }

    #[tokio::test]
    async fn test_run_step_redirects_stdin_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = input_file(&dir, "hello stdin\n");
        let stdout = run_step(sh("cat"), &input, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stdout, "hello stdin");
    }

    #[tokio::test]
    async fn test_run_step_stderr_is_runtime_failure() {
        let dir = tempfile::tempdir().unwrap();
        let input = input_file(&dir, "");
        let err = run_step(sh("echo oops >&2"), &input, Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ExecutionError::Runtime(diag) => assert_eq!(diag, "oops"),
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_step_nonzero_exit_is_runtime_failure() {
        let dir = tempfile::tempdir().unwrap();
        let input = input_file(&dir, "");
        let err = run_step(sh("exit 3"), &input, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Runtime(_)));
    }

    #[tokio::test]
    async fn test_run_step_timeout_kills_within_margin() {
        let dir = tempfile::tempdir().unwrap();
        let input = input_file(&dir, "");
        let started = Instant::now();
        let err = run_step(sh("sleep 30"), &input, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout(200)));
        assert!(started.elapsed() < Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_run_step_spawn_failure_is_service_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = input_file(&dir, "");
        let err = run_step(
            Command::new("runbox-no-such-binary"),
            &input,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecutionError::Service(_)));
    }

    #[tokio::test]
    async fn test_oversized_source_rejected_without_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path()).unwrap();
        let huge = "x".repeat(MAX_SOURCE_CODE_BYTES + 1);
        let outcome = run_job(
            &manager,
            Language::Python,
            &huge,
            "",
            Duration::from_secs(1),
        )
        .await;
        assert!(!outcome.is_success());
        assert!(outcome.diagnostic.contains("maximum size"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_compile_step_surfaces_compiler_text() {
        // `sh -c` doubles as a compiler stand-in: stderr output fails the
        // step with that text
        let err = run_compile_step(sh("echo 'main.c:1: error' >&2; exit 1"), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ExecutionError::Compile(diag) => assert_eq!(diag, "main.c:1: error"),
            other => panic!("expected compile error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_compile_step_fails_on_warning_output_alone() {
        let err = run_compile_step(sh("echo 'warning: unused' >&2"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Compile(_)));
    }

    #[tokio::test]
    async fn test_compile_step_timeout_kills_within_margin() {
        let started = Instant::now();
        let err = run_compile_step(sh("sleep 30"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout(200)));
        assert!(started.elapsed() < Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_compile_step_silent_success() {
        run_compile_step(sh("true"), Duration::from_secs(5))
            .await
            .unwrap();
    }
}
