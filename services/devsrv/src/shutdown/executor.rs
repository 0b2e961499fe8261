//! Step execution against real devices

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::collaborators::inventory::{BreakerId, Inventory, ServerId};
use crate::collaborators::remote::RemoteShell;
use crate::devices::breaker::BreakerService;
use crate::error::{DevSrvError, Result};

/// Performs the device-facing work of server and breaker steps
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn shutdown_server(&self, server_id: ServerId) -> Result<()>;
    async fn cut_breaker(&self, breaker_id: BreakerId) -> Result<()>;
}

/// Shuts servers down over SSH and cuts power through the breaker service
pub struct DeviceStepExecutor {
    inventory: Arc<dyn Inventory>,
    shell: Arc<dyn RemoteShell>,
    breakers: Arc<BreakerService>,
    shutdown_command: String,
}

impl DeviceStepExecutor {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        shell: Arc<dyn RemoteShell>,
        breakers: Arc<BreakerService>,
        shutdown_command: impl Into<String>,
    ) -> Self {
        Self {
            inventory,
            shell,
            breakers,
            shutdown_command: shutdown_command.into(),
        }
    }
}

#[async_trait]
impl StepExecutor for DeviceStepExecutor {
    async fn shutdown_server(&self, server_id: ServerId) -> Result<()> {
        let server = self.inventory.server(server_id)?;
        let command = server
            .shutdown_command
            .as_deref()
            .unwrap_or(&self.shutdown_command);

        info!(
            "Shutting down server {} ({}) at {}:{}",
            server.id, server.name, server.host, server.ssh_port
        );
        let output = self
            .shell
            .execute_command(&server.host, server.ssh_port, &server.credentials, command)
            .await?;

        if !output.success() {
            return Err(DevSrvError::remote_command(format!(
                "server {} ({}): `{}` exited with {}: {}",
                server.id,
                server.name,
                command,
                output.exit_code,
                output.output.trim()
            )));
        }
        Ok(())
    }

    async fn cut_breaker(&self, breaker_id: BreakerId) -> Result<()> {
        let breaker = self.inventory.breaker(breaker_id)?;
        let outcome = self.breakers.cut_power(&breaker).await?;
        info!(
            "Power cut on breaker {} ({}): {:?}",
            breaker.id, breaker.name, outcome
        );
        Ok(())
    }
}
