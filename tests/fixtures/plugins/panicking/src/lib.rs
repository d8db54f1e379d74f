use async_trait::async_trait;
use plughost::plugins::{HostServices, Plugin};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct Panicking;

#[async_trait]
impl Plugin for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn initialize(&mut self, _host: &HostServices, _cancel: &CancellationToken) -> anyhow::Result<()> {
        panic!("device went away");
    }

    async fn shutdown(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }
}

plughost::declare_plugin!(Panicking);
