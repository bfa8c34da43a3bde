pub mod providers;
pub mod streaming;

use std::sync::Arc;

use langdag_core::config::AppConfig;
use langdag_core::error::{LangdagError, Result};
use langdag_core::traits::Provider;

pub use providers::anthropic::AnthropicProvider;
pub use providers::mock::MockProvider;

/// Create a provider based on the configured default.
pub fn create_provider(config: &AppConfig) -> Result<Arc<dyn Provider>> {
    match config.provider.default.as_str() {
        "anthropic" | "claude" => Ok(Arc::new(AnthropicProvider::from_config(
            &config.provider.anthropic,
        )?)),
        "mock" => Ok(Arc::new(MockProvider::new(config.provider.mock.clone()))),
        other => Err(LangdagError::Config(format!("unknown provider: {other}"))),
    }
}
