pub mod http;

use std::sync::Arc;

use lisa_core::config::ProviderConfig;
use lisa_core::error::Result;
use lisa_core::traits::Provider;

pub use http::HttpProvider;

/// Create a provider from its configuration.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    Ok(Arc::new(HttpProvider::from_config(config)?))
}
