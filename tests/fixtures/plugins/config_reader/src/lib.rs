use anyhow::{bail, Context};
use async_trait::async_trait;
use plughost::config::Config;
use plughost::plugins::{HostServices, Plugin};
use tokio_util::sync::CancellationToken;

/// Fails to initialize unless the host's configuration is readable from here
#[derive(Default)]
pub struct ConfigReader;

#[async_trait]
impl Plugin for ConfigReader {
    fn name(&self) -> &str {
        "config-reader"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn initialize(&mut self, host: &HostServices, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let config = host.get::<Config>().context("host configuration not visible")?;
        if !config.plugins.exclude.iter().any(|name| name == "never-loaded") {
            bail!("host configuration has unexpected contents: {:?}", config.plugins.exclude);
        }
        if !host.contains::<tracing::Dispatch>() {
            bail!("host dispatcher not visible");
        }
        Ok(())
    }

    async fn shutdown(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }
}

plughost::declare_plugin!(ConfigReader);
