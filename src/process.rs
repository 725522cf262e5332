//! Centralized command execution with consistent error handling.
//!
//! Every external tool the editor shells out to goes through [`Cmd`], which
//! captures stderr by default and turns non-zero exits into a
//! [`SubprocessError`] carrying the full argv and both output streams.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;

/// Non-zero exit from an external tool.
///
/// Carries everything needed to report the failure verbatim at the top level.
#[derive(Debug, Error)]
#[error("'{}' failed (exit code {code})", argv.join(" "))]
pub struct SubprocessError {
    /// Full argv of the failing invocation.
    pub argv: Vec<String>,
    /// Exit code, or -1 if terminated by signal.
    pub code: i32,
    /// Captured stdout ("" when the command streamed to the terminal).
    pub stdout: String,
    /// Captured stderr ("" when the command streamed to the terminal).
    pub stderr: String,
}

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    env: HashMap<String, String>,
    stdin: Option<Vec<u8>>,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            current_dir: None,
            env: HashMap::new(),
            stdin: None,
            allow_fail: false,
        }
    }

    /// Build from a full argv slice (program followed by its arguments).
    pub fn from_argv<S: AsRef<str>>(argv: &[S]) -> Self {
        let mut cmd = Self::new(argv[0].as_ref());
        for arg in &argv[1..] {
            cmd = cmd.arg(arg.as_ref());
        }
        cmd
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Set the working directory.
    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Overlay an environment variable on top of the inherited environment.
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.env
            .insert(key.as_ref().to_string(), value.as_ref().to_string());
        self
    }

    /// Feed the given bytes to the child's stdin.
    pub fn stdin_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// Allow non-zero exit codes without failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Full argv, for logging.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.program.clone()];
        argv.extend(self.args.iter().cloned());
        argv
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }

    /// Run the command and capture both output streams.
    pub fn run(self) -> Result<CommandResult> {
        let mut cmd = self.command();
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = if let Some(ref bytes) = self.stdin {
            cmd.stdin(Stdio::piped());
            let mut child = cmd.spawn().with_context(|| spawn_failure(&self.program))?;
            {
                use std::io::Write;
                let mut stdin = child.stdin.take().expect("stdin was piped");
                stdin.write_all(bytes)?;
            }
            child.wait_with_output()?
        } else {
            cmd.stdin(Stdio::null());
            cmd.output().with_context(|| spawn_failure(&self.program))?
        };

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !self.allow_fail && !result.success() {
            return Err(SubprocessError {
                argv: self.argv(),
                code: result.code(),
                stdout: result.stdout,
                stderr: result.stderr,
            }
            .into());
        }

        Ok(result)
    }

    /// Run the command with inherited stdio (interactive/streaming).
    ///
    /// Output goes directly to the terminal. Use for long-running commands
    /// where the user should see progress (e.g. mksquashfs of a full rootfs).
    pub fn run_interactive(self) -> Result<CommandResult> {
        let mut cmd = self.command();
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let status = cmd.status().with_context(|| spawn_failure(&self.program))?;

        let result = CommandResult {
            status,
            stdout: String::new(),
            stderr: String::new(),
        };

        if !self.allow_fail && !result.success() {
            return Err(SubprocessError {
                argv: self.argv(),
                code: result.code(),
                stdout: String::new(),
                stderr: String::new(),
            }
            .into());
        }

        Ok(result)
    }
}

fn spawn_failure(program: &str) -> String {
    format!("Failed to execute '{}'. Is it installed?", program)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[test]
    fn test_from_argv() {
        let result = Cmd::from_argv(&["echo", "a", "b"]).run().unwrap();
        assert_eq!(result.stdout_trimmed(), "a b");
    }

    #[test]
    fn test_run_captures_stderr() {
        // `ls` on a non-existent file writes to stderr
        let result = Cmd::new("ls")
            .arg("/nonexistent_path_12345")
            .allow_fail()
            .run()
            .unwrap();

        assert!(!result.success());
        assert!(!result.stderr.is_empty());
    }

    #[test]
    fn test_failure_is_subprocess_error() {
        let err = Cmd::new("ls")
            .arg("/nonexistent_path_12345")
            .run()
            .unwrap_err();
        let sub = err.downcast_ref::<SubprocessError>().expect("typed error");
        assert_eq!(sub.argv[0], "ls");
        assert_ne!(sub.code, 0);
        assert!(!sub.stderr.is_empty());
    }

    #[test]
    fn test_env_overlay() {
        let result = Cmd::new("sh")
            .args(["-c", "echo $LIVISO_TEST_VAR"])
            .env("LIVISO_TEST_VAR", "overlaid")
            .run()
            .unwrap();
        assert_eq!(result.stdout_trimmed(), "overlaid");
    }

    #[test]
    fn test_stdin_bytes() {
        let result = Cmd::new("cat").stdin_bytes("fed via stdin").run().unwrap();
        assert_eq!(result.stdout, "fed via stdin");
    }

    #[test]
    fn test_allow_fail() {
        let result = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!result.success());
        assert_eq!(result.code(), 1);
    }

    #[test]
    fn test_run_in_directory() {
        let result = Cmd::new("pwd").dir(Path::new("/tmp")).run().unwrap();
        assert!(result.stdout_trimmed().contains("tmp"));
    }
}
