//! Host power control. The solar charge budget assumes the station is
//! off between cycles, so every cycle ends in a halt regardless of how
//! the cycle itself went.

use anyhow::Context;
use tokio::process::Command;
use tracing::info;

pub trait HostPower {
    fn power_off(&self) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

pub struct SystemPower;

impl HostPower for SystemPower {
    async fn power_off(&self) -> anyhow::Result<()> {
        info!("powering off");
        let status = Command::new("sudo")
            .args(["shutdown", "-h", "now"])
            .status()
            .await
            .context("failed to spawn shutdown")?;
        if !status.success() {
            anyhow::bail!("shutdown exited with {status}");
        }
        Ok(())
    }
}
