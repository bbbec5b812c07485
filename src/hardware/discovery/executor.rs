//! Command Execution
//!
//! Runs the external disk tools on the local node and returns their
//! standard output.

use crate::domain::ports::CommandExecutor;
use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Executes tools as child processes of the operator
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor;

impl SystemExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn execute(&self, tool: &str, args: &[&str]) -> Result<String> {
        debug!("exec {} {}", tool, args.join(" "));

        let output = Command::new(tool)
            .args(args)
            .env("LC_ALL", "C")
            .output()
            .await
            .map_err(|e| Error::CommandFailed {
                tool: tool.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::CommandFailed {
                tool: tool.to_string(),
                reason: format!("{} ({})", stderr.trim(), output.status),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted executor for unit tests

    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    /// Replays canned output keyed by the full command line
    #[derive(Default)]
    pub struct ScriptedExecutor {
        responses: Mutex<HashMap<String, VecDeque<std::result::Result<String, String>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        fn push(&self, command: &str, response: std::result::Result<String, String>) {
            self.responses
                .lock()
                .entry(command.to_string())
                .or_default()
                .push_back(response);
        }

        /// Queue stdout for a command line; the last response repeats
        pub fn on(&self, command: &str, stdout: &str) -> &Self {
            self.push(command, Ok(stdout.to_string()));
            self
        }

        /// Queue a failure for a command line
        pub fn fail(&self, command: &str, reason: &str) -> &Self {
            self.push(command, Err(reason.to_string()));
            self
        }

        /// Command lines executed so far
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        pub fn called(&self, command: &str) -> bool {
            self.calls.lock().iter().any(|c| c == command)
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn execute(&self, tool: &str, args: &[&str]) -> Result<String> {
            let line = std::iter::once(tool)
                .chain(args.iter().copied())
                .collect::<Vec<_>>()
                .join(" ");
            self.calls.lock().push(line.clone());

            let mut responses = self.responses.lock();
            let queue = responses.get_mut(&line).ok_or_else(|| Error::CommandFailed {
                tool: tool.to_string(),
                reason: format!("unscripted command: {}", line),
            })?;
            let response = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };

            match response {
                Some(Ok(stdout)) => Ok(stdout),
                Some(Err(reason)) => Err(Error::CommandFailed {
                    tool: tool.to_string(),
                    reason,
                }),
                None => Ok(String::new()),
            }
        }
    }
}
