use super::error::ToolError;
use super::guard::SandboxRoot;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{info, warn};

const NO_OUTPUT: &str = "No output produced.";

/// Captured result of a script that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecutionReport {
    /// Present-only sections joined by a blank line. A non-zero exit code is
    /// always spelled out, even when both streams are empty.
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if !self.stdout.is_empty() {
            parts.push(format!("STDOUT:\n{}", self.stdout));
        }
        if !self.stderr.is_empty() {
            parts.push(format!("STDERR:\n{}", self.stderr));
        }
        if self.exit_code != 0 {
            parts.push(format!("Process exited with code {}", self.exit_code));
        }
        if parts.is_empty() {
            NO_OUTPUT.to_string()
        } else {
            parts.join("\n\n")
        }
    }
}

/// Runs interpretable scripts that live inside the sandbox.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    interpreter: String,
    extension: String,
}

impl ScriptRunner {
    pub fn new(interpreter: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            extension: extension.into().trim_start_matches('.').to_string(),
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub async fn run(
        &self,
        root: &SandboxRoot,
        path: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ExecutionReport, ToolError> {
        let target = root.confine(path, "execute").await?;
        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(ToolError::NotFound(path.to_string()));
        }
        if !self.has_script_extension(&target) {
            return Err(ToolError::UnsupportedScript {
                path: path.to_string(),
                extension: self.extension.clone(),
            });
        }

        let started = Instant::now();
        info!(tool = "run_script", %path, ?args, "tool start");

        let child = Command::new(&self.interpreter)
            .arg(&target)
            .args(args)
            .current_dir(root.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Execution(format!("failed to start {}: {}", self.interpreter, e)))?;

        // Dropping the wait future on expiry kills the child.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ToolError::Execution(e.to_string()))?,
            Err(_) => {
                warn!(tool = "run_script", %path, timeout_secs = timeout.as_secs_f64(), "script timed out");
                return Err(ToolError::Timeout(timeout));
            }
        };

        let report = ExecutionReport {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };
        info!(
            tool = "run_script",
            %path,
            exit = report.exit_code,
            stdout_len = report.stdout.len(),
            stderr_len = report.stderr.len(),
            took_ms = started.elapsed().as_millis() as u64,
            "tool end"
        );
        Ok(report)
    }

    fn has_script_extension(&self, target: &Path) -> bool {
        target
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == self.extension)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox(scripts: &[(&str, &str)]) -> (TempDir, SandboxRoot) {
        let dir = TempDir::new().unwrap();
        for (name, body) in scripts {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, body).unwrap();
        }
        let root = SandboxRoot::new(dir.path()).unwrap();
        (dir, root)
    }

    fn runner() -> ScriptRunner {
        ScriptRunner::new("sh", "sh")
    }

    #[test]
    fn test_render_sections() {
        let only_stdout = ExecutionReport {
            stdout: "ok".into(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert_eq!(only_stdout.render(), "STDOUT:\nok");

        let everything = ExecutionReport {
            stdout: "a".into(),
            stderr: "b".into(),
            exit_code: 2,
        };
        assert_eq!(
            everything.render(),
            "STDOUT:\na\n\nSTDERR:\nb\n\nProcess exited with code 2"
        );

        let silent_failure = ExecutionReport {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 1,
        };
        assert_eq!(silent_failure.render(), "Process exited with code 1");

        let silent_success = ExecutionReport {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert_eq!(silent_success.render(), NO_OUTPUT);
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let (_dir, root) = sandbox(&[("ok.sh", "echo ok\n")]);
        let report = runner()
            .run(&root, "ok.sh", &[], Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(report.stdout, "ok");
        let rendered = report.render();
        assert!(rendered.contains("STDOUT:\nok"));
        assert!(!rendered.contains("Process exited"));
    }

    #[tokio::test]
    async fn test_run_passes_args_and_pins_cwd() {
        let (dir, root) = sandbox(&[("sub/args.sh", "echo \"$1 $2\"\npwd\necho oops >&2\nexit 3\n")]);
        let report = runner()
            .run(&root, "sub/args.sh", &["3".into(), "+ 5".into()], Duration::from_secs(10))
            .await
            .unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(
            report.stdout,
            format!("3 + 5\n{}", canonical.display())
        );
        assert_eq!(report.stderr, "oops");
        assert_eq!(report.exit_code, 3);
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let (_dir, root) = sandbox(&[("slow.sh", "sleep 5\n")]);
        let started = Instant::now();
        let err = runner()
            .run(&root, "slow.sh", &[], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(d) if d == Duration::from_millis(200)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_run_rejects_missing_wrong_extension_and_escapes() {
        let (_dir, root) = sandbox(&[("notes.txt", "echo hi\n")]);
        let r = runner();
        let timeout = Duration::from_secs(5);
        assert!(matches!(
            r.run(&root, "missing.sh", &[], timeout).await,
            Err(ToolError::NotFound(_))
        ));
        let err = r.run(&root, "notes.txt", &[], timeout).await.unwrap_err();
        assert_eq!(err.render(), "Error: \"notes.txt\" is not a .sh file.");
        assert!(matches!(
            r.run(&root, "../main.sh", &[], timeout).await,
            Err(ToolError::Confinement { .. })
        ));
    }
}
