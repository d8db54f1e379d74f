use async_trait::async_trait;
use plughost::plugins::{HostServices, Plugin};
use tokio_util::sync::CancellationToken;

/// Its constructor always panics
pub struct Broken;

impl Default for Broken {
    fn default() -> Self {
        panic!("no backing store");
    }
}

#[async_trait]
impl Plugin for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn initialize(&mut self, _host: &HostServices, _cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }
}

plughost::declare_plugin!(Broken);
