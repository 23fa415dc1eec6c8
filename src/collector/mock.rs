//! Mock collaborators for exercising collectors without external tools.

use std::time::Duration;

use async_trait::async_trait;

use super::CollectError;
use super::iptables::CommandRunner;

/// Command runner returning canned output, or a canned failure.
pub struct MockCommandRunner {
    result: Result<String, String>,
}

impl MockCommandRunner {
    /// Succeeds with the given stdout for any command.
    pub fn with_output(output: &str) -> Self {
        Self {
            result: Ok(output.to_string()),
        }
    }

    /// Fails every command with the given message.
    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
        }
    }
}

#[async_trait]
impl CommandRunner for MockCommandRunner {
    async fn output(
        &self,
        _program: &str,
        _args: &[&str],
        _timeout: Duration,
    ) -> Result<String, CollectError> {
        self.result.clone().map_err(CollectError::Unavailable)
    }
}
