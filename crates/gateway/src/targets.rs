//! Builds launch specs for targets from configured argument templates.

use thiserror::Error;

use crate::config::TargetsConfig;
use crate::session::LaunchSpec;

/// Errors from building a launch spec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    /// The target identifier is empty.
    #[error("missing target id")]
    MissingId,

    /// The target identifier contains whitespace or control characters.
    #[error("invalid target id: {0:?}")]
    InvalidId(String),

    /// The exec command is blank.
    #[error("missing command")]
    EmptyCommand,
}

/// Launch command templates for each session kind.
#[derive(Debug, Clone)]
pub struct Targets {
    config: TargetsConfig,
}

impl Targets {
    /// Wraps the configured templates.
    pub fn new(config: TargetsConfig) -> Self {
        Self { config }
    }

    /// Returns the launched program.
    pub fn program(&self) -> &str {
        &self.config.program
    }

    /// Spec for an interactive terminal inside `id`.
    pub fn terminal(&self, id: &str) -> Result<LaunchSpec, TargetError> {
        validate_id(id)?;
        Ok(self.build(&self.config.terminal, id, ""))
    }

    /// Spec for running `command` once inside `id`.
    pub fn exec(&self, id: &str, command: &str) -> Result<LaunchSpec, TargetError> {
        validate_id(id)?;
        if command.trim().is_empty() {
            return Err(TargetError::EmptyCommand);
        }
        Ok(self.build(&self.config.exec, id, command))
    }

    /// Spec for following the logs of `id`.
    pub fn follow(&self, id: &str) -> Result<LaunchSpec, TargetError> {
        validate_id(id)?;
        Ok(self.build(&self.config.follow, id, ""))
    }

    /// Arguments for the backend health check.
    pub fn status_args(&self) -> &[String] {
        &self.config.status
    }

    fn build(&self, template: &[String], id: &str, command: &str) -> LaunchSpec {
        let mut args = Vec::with_capacity(template.len());
        for arg in template {
            if arg == "{args}" {
                args.extend(command.split_whitespace().map(str::to_string));
            } else {
                args.push(arg.replace("{id}", id).replace("{command}", command));
            }
        }
        LaunchSpec::new(self.config.program.clone()).args(args)
    }
}

fn validate_id(id: &str) -> Result<(), TargetError> {
    if id.is_empty() {
        return Err(TargetError::MissingId);
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(TargetError::InvalidId(id.to_string()));
    }
    Ok(())
}
