//! Remote command execution on managed servers

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::inventory::Credentials;
use crate::error::{DevSrvError, Result};

/// Result of one remote command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// stdout followed by stderr
    pub output: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` on `host`; a non-zero exit is reported, not raised
    async fn execute_command(
        &self,
        host: &str,
        port: u16,
        credentials: &Credentials,
        command: &str,
    ) -> Result<CommandOutput>;
}

/// Runs commands through the system `ssh` client in batch mode
///
/// Key-based authentication only; a configured password is ignored.
#[derive(Debug, Clone)]
pub struct SshCommandShell {
    binary: String,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshCommandShell {
    pub fn new(binary: impl Into<String>, connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            connect_timeout,
            command_timeout,
        }
    }

    fn args(&self, host: &str, port: u16, credentials: &Credentials, command: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        if let Some(key) = &credentials.key_path {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{}", credentials.username, host));
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl RemoteShell for SshCommandShell {
    async fn execute_command(
        &self,
        host: &str,
        port: u16,
        credentials: &Credentials,
        command: &str,
    ) -> Result<CommandOutput> {
        if credentials.password.is_some() && credentials.key_path.is_none() {
            warn!(
                "Password authentication is not supported for {}@{}, relying on the ssh agent",
                credentials.username, host
            );
        }

        let args = self.args(host, port, credentials, command);
        debug!("Running {} {:?}", self.binary, args);

        let started = Instant::now();
        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| {
                DevSrvError::timeout(format!(
                    "Command on {host} timed out after {:?}",
                    self.command_timeout
                ))
            })?
            .map_err(|e| DevSrvError::remote_command(format!("Failed to spawn {}: {e}", self.binary)))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        let result = CommandOutput {
            output: text,
            // Killed by signal
            exit_code: output.status.code().unwrap_or(-1),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "Command on {}:{} exited with {} in {} ms",
            host, port, result.exit_code, result.duration_ms
        );
        Ok(result)
    }
}
