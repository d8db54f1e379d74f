use anyhow::bail;
use async_trait::async_trait;
use plughost::plugins::{HostServices, Plugin};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Text processor plugin - text manipulation utilities
///
/// Depends on the greeter so it is always initialized after it.
#[derive(Default)]
pub struct TextProcessorPlugin {
    initialized: bool,
}

impl TextProcessorPlugin {
    pub fn process(&self, command: &str, text: &str) -> anyhow::Result<String> {
        if !self.initialized {
            bail!("plugin not initialized");
        }
        Ok(match command {
            "upper" => text.to_uppercase(),
            "lower" => text.to_lowercase(),
            "reverse" => text.chars().rev().collect(),
            "trim" => text.trim().to_string(),
            "slug" => text
                .split(|c: char| !c.is_alphanumeric())
                .filter(|part| !part.is_empty())
                .map(str::to_lowercase)
                .collect::<Vec<_>>()
                .join("-"),
            other => bail!("unknown command '{other}'"),
        })
    }
}

#[async_trait]
impl Plugin for TextProcessorPlugin {
    fn name(&self) -> &str {
        "text-processor"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Upper, lower, reverse, trim and slug transforms"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["greeter".to_string()]
    }

    async fn initialize(&mut self, _host: &HostServices, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.initialized = true;
        info!(sample = %self.process("slug", "Plugin Host Ready")?, "Text processor ready");
        Ok(())
    }

    async fn shutdown(&mut self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.initialized = false;
        Ok(())
    }
}

plughost::declare_plugin!(TextProcessorPlugin);
