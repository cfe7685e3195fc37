//! Process execution with bounded timeouts
//!
//! Every OS command the topology engine issues goes through a
//! [`CommandRunner`], so a hung `ip` invocation surfaces as
//! [`Error::CommandTimeout`] instead of wedging a whole phase.

use crate::error::{Error, Result};
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Default upper bound for a single spawned command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Whether the command exited successfully
    pub success: bool,
    /// Exit code (if available)
    pub exit_code: Option<i32>,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output carrying `stdout`
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Get a formatted summary of the result
    pub fn summary(&self) -> String {
        let status = if self.success { "success" } else { "failed" };
        let code = self
            .exit_code
            .map(|c| format!(" (exit {})", c))
            .unwrap_or_default();
        format!("{}{}", status, code)
    }

    /// Best diagnostic line for a failed command
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else if !self.stdout.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.summary()
        }
    }
}

/// Something that can run a program to completion
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, waiting at most `timeout`
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput>;
}

/// Runs real processes, polling for completion until the timeout expires
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput> {
        let rendered = render(program, args);
        tracing::debug!(command = %rendered, "spawning");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::CommandFailed {
                command: rendered.clone(),
                message: e.to_string(),
            })?;

        // Drain both pipes while waiting so a chatty child never blocks on write
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Ok(CommandOutput {
                        success: status.success(),
                        exit_code: status.code(),
                        stdout: collect(stdout),
                        stderr: collect(stderr),
                    });
                }
                Ok(None) => {
                    if start.elapsed() > timeout {
                        let _ = child.kill();
                        // Reap the killed child
                        let _ = child.wait();
                        return Err(Error::CommandTimeout {
                            command: rendered,
                            seconds: timeout.as_secs(),
                        });
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    return Err(Error::CommandFailed {
                        command: rendered,
                        message: format!("Failed to wait on process: {}", e),
                    });
                }
            }
        }
    }
}

/// Read a pipe to the end on its own thread
fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(reader: Option<thread::JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Render a command line for logs and diagnostics
pub fn render(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        let args = vec!["netns".to_string(), "add".to_string(), "zoo1".to_string()];
        assert_eq!(render("ip", &args), "ip netns add zoo1");
    }

    #[test]
    fn test_run_true_succeeds() {
        let out = ProcessRunner
            .run("true", &[], Duration::from_secs(5))
            .unwrap();
        assert!(out.success);
        assert_eq!(out.exit_code, Some(0));
    }

    #[test]
    fn test_run_captures_stdout() {
        let out = ProcessRunner
            .run("echo", &["hello".to_string()], Duration::from_secs(5))
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_run_times_out() {
        let err = ProcessRunner
            .run("sleep", &["5".to_string()], Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));
    }

    #[test]
    fn test_large_output_does_not_stall() {
        let args = vec!["-c".to_string(), "head -c 200000 /dev/zero | tr '\\0' x".to_string()];
        let out = ProcessRunner
            .run("sh", &args, Duration::from_secs(5))
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.len(), 200000);
    }

    #[test]
    fn test_missing_program_is_command_failure() {
        let err = ProcessRunner
            .run("/nonexistent/ptm-binary", &[], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[test]
    fn test_diagnostic_prefers_stderr() {
        let out = CommandOutput {
            success: false,
            exit_code: Some(2),
            stdout: "noise".into(),
            stderr: "RTNETLINK answers: File exists\n".into(),
        };
        assert_eq!(out.diagnostic(), "RTNETLINK answers: File exists");
    }
}
