//! Synchronous shell command execution for the extractors
//!
//! Several data sources are only reachable through admin tools
//! (`psql`, `docker`, `rabbitmqctl`, `git`, `supervisorctl`) or through
//! small shell pipelines over log files. Commands run via `sh -c`, block
//! until exit, and capture both output streams. No timeouts are enforced.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

/// Captured result of one shell command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl CommandOutput {
    /// Stderr if the command wrote any, for "log a warning and continue" call sites
    pub fn error_output(&self) -> Option<&str> {
        if self.stderr.trim().is_empty() {
            None
        } else {
            Some(self.stderr.as_str())
        }
    }
}

/// Run a shell command line and capture its output.
///
/// `command` is a full shell line ("cat something | sort"); `cwd` is the
/// working directory to run it in. Spawn failures propagate; a nonzero
/// exit status does not (callers inspect `success`/`stderr` and decide).
pub fn shell_output(command: &str, cwd: Option<&Path>) -> Result<CommandOutput> {
    debug!(command, "Running shell command");

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .with_context(|| format!("Failed to run command: {}", command))?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        success: output.status.success(),
    })
}

/// Find the first executable called `name` on the current PATH.
pub fn whereis(name: &str) -> Option<std::path::PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path_var = std::env::var("PATH").ok()?;
    for dir in path_var.split(':') {
        let candidate = Path::new(dir).join(name);
        if let Ok(meta) = std::fs::metadata(&candidate) {
            if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captures_stdout() {
        let output = shell_output("echo hello", None).unwrap();
        assert_eq!(output.stdout.trim(), "hello");
        assert!(output.success);
        assert!(output.error_output().is_none());
    }

    #[test]
    fn test_captures_stderr_and_status() {
        let output = shell_output("echo oops >&2; exit 3", None).unwrap();
        assert_eq!(output.stderr.trim(), "oops");
        assert!(!output.success);
        assert_eq!(output.error_output(), Some("oops\n"));
    }

    #[test]
    fn test_respects_cwd() {
        let dir = tempfile::TempDir::new().unwrap();
        let output = shell_output("pwd", Some(dir.path())).unwrap();
        assert_eq!(
            std::path::PathBuf::from(output.stdout.trim()),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_whereis_finds_sh() {
        assert!(whereis("sh").is_some());
        assert!(whereis("definitely-not-a-real-binary-name").is_none());
    }
}
