use anyhow::Context;
use async_trait::async_trait;
use plughost::config::Config;
use plughost::plugins::{HostServices, Plugin};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Greeter plugin - the smallest useful plugin
#[derive(Default)]
pub struct GreeterPlugin {
    greeting: String,
}

#[async_trait]
impl Plugin for GreeterPlugin {
    fn name(&self) -> &str {
        "greeter"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Logs a greeting when the host starts and stops"
    }

    async fn initialize(&mut self, host: &HostServices, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let config = host
            .get::<Config>()
            .context("host did not share its configuration")?;
        self.greeting = format!("Hello from {}", config.plugins.directory.display());
        info!("{}", self.greeting);
        Ok(())
    }

    async fn shutdown(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        info!("Goodbye from the greeter plugin");
        Ok(())
    }
}

plughost::declare_plugin!(GreeterPlugin);
