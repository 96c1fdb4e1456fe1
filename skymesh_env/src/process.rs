//! Subprocess helpers shared by every production implementation.

use crate::error::EnvError;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Runs a program to completion and returns its stdout.
///
/// A non-zero exit status is turned into `EnvError::CommandFailed` carrying
/// the captured stderr, so callers can log exactly what the OS rejected.
pub async fn run_command<S: AsRef<str>>(program: &str, args: &[S]) -> Result<String, EnvError> {
    let rendered = format!(
        "{} {}",
        program,
        args.iter().map(|a| a.as_ref()).collect::<Vec<_>>().join(" ")
    );
    debug!("exec: {}", rendered);

    let output = Command::new(program)
        .args(args.iter().map(|a| a.as_ref()))
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(EnvError::CommandFailed {
            command: rendered,
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Joins arguments into one POSIX shell command line, quoting as needed.
pub fn shell_join<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./,:=@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_join_quotes_only_when_needed() {
        let line = shell_join(&["skymesh-agent", "networks", "12", "it's here", ""]);
        assert_eq!(line, r"skymesh-agent networks 12 'it'\''s here' ''");
    }

    #[tokio::test]
    async fn test_run_command_captures_stdout() {
        let out = run_command("echo", &["hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_command_reports_failure() {
        let err = run_command("false", &[] as &[&str]).await.unwrap_err();
        assert!(matches!(err, EnvError::CommandFailed { status: 1, .. }));
    }

    #[tokio::test]
    async fn test_failure_carries_command_line() {
        let err = run_command("sh", &["-c", "exit 3"]).await.unwrap_err();
        match err {
            EnvError::CommandFailed { command, status, .. } => {
                assert_eq!(command, "sh -c exit 3");
                assert_eq!(status, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
