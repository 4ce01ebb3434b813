//! Buffered one-shot invocations of the configured CLI.
//!
//! The streaming sessions use live pipes; everything else that talks to the
//! backend runs the CLI to completion and looks at its collected output.

use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;

use crate::action_log::ActionLog;

/// Errors from running a command.
#[derive(Debug, Error)]
pub enum RunError {
    /// The program could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran and exited unsuccessfully.
    #[error("{status}")]
    Failed {
        status: std::process::ExitStatus,
        output: String,
    },
}

/// Collected output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output followed by standard error.
    pub output: String,
    /// Exit code, if the process was not killed by a signal.
    pub code: Option<i32>,
}

/// Runs the configured program with buffered output, recording each call in
/// the action log.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    action_log: Arc<ActionLog>,
}

impl CommandRunner {
    /// Creates a runner for `program`.
    pub fn new(program: impl Into<String>, action_log: Arc<ActionLog>) -> Self {
        Self {
            program: program.into(),
            action_log,
        }
    }

    /// Returns the program this runner invokes.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs the program with `args` and waits for it to finish.
    pub async fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<CommandOutput, RunError> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        let command_line = std::iter::once(self.program.as_str())
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");

        let result = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(source) => {
                self.action_log.record(
                    &command_line,
                    format!("Error: {source}\nOutput: "),
                    true,
                );
                return Err(RunError::Spawn {
                    program: self.program.clone(),
                    source,
                });
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            tracing::debug!(command = %command_line, "Command succeeded");
            self.action_log.record(&command_line, text.clone(), false);
            Ok(CommandOutput {
                output: text,
                code: output.status.code(),
            })
        } else {
            tracing::debug!(command = %command_line, status = %output.status, "Command failed");
            self.action_log.record(
                &command_line,
                format!("Error: {}\nOutput: {}", output.status, text),
                true,
            );
            Err(RunError::Failed {
                status: output.status,
                output: text,
            })
        }
    }
}
