//! External command execution
//!
//! Adapter listing and network reset both shell out to OS utilities. They go
//! through [`CommandRunner`] so the parsing and batching logic can be driven
//! with canned output.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::error::{TunsvcError, TunsvcResult};

/// Suppresses the console window for child processes on Windows.
#[cfg(windows)]
pub(crate) const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and return its standard output.
    ///
    /// A non-zero exit status is an error.
    async fn run(&self, program: &str, args: &[String]) -> TunsvcResult<String>;
}

/// Runs commands on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> TunsvcResult<String> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        let output = command.output().await?;

        if !output.status.success() {
            return Err(TunsvcError::CommandFailed {
                cmd: display_command(program, args),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!("Command '{}' succeeded", display_command(program, args));
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

pub(crate) fn display_command(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout() {
        let out = SystemCommandRunner
            .run("sh", &["-c".to_string(), "echo hello".to_string()])
            .await
            .unwrap();
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_command_failed() {
        let err = SystemCommandRunner
            .run("sh", &["-c".to_string(), "echo nope >&2; exit 3".to_string()])
            .await
            .unwrap_err();

        match err {
            TunsvcError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let err = SystemCommandRunner
            .run("/nonexistent/tunsvc-probe", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, TunsvcError::Io(_)));
    }
}
