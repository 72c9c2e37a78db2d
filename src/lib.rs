//! reelgate — shareable streaming links for private cloud-drive videos.
//!
//! Re-exports the modules the binary and the integration tests in `tests/`
//! are built from.

use std::sync::Arc;

pub mod api;
pub mod cli;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod metrics;
pub mod proxy;
pub mod server;
pub mod store;
pub mod token_manager;
pub mod vault;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: config::Config,
    pub links: store::SlugStore,
    pub tokens: Arc<token_manager::TokenManager>,
    pub proxy: proxy::stream::StreamProxy,
    pub metrics: metrics::ProxyMetrics,
}
