//! Slug → upstream media relay.
//!
//! Per request: resolve the slug, obtain a token, fetch upstream with the
//! client's `Range`, validate the status, then hand back a
//! [`StreamedResponse`] whose body (GET only) is relayed lazily.

use std::sync::Arc;

use axum::http::{HeaderValue, Method};

use crate::errors::AppError;
use crate::metrics::ProxyMetrics;
use crate::proxy::relay::{relay_headers, Metadata, StreamedResponse, UpstreamBody};
use crate::proxy::upstream::UpstreamClient;
use crate::store::SlugStore;
use crate::token_manager::TokenSource;

pub struct StreamProxy {
    links: SlugStore,
    tokens: Arc<dyn TokenSource>,
    upstream: UpstreamClient,
    metrics: ProxyMetrics,
    chunk_size: usize,
}

impl StreamProxy {
    pub fn new(
        links: SlugStore,
        tokens: Arc<dyn TokenSource>,
        upstream: UpstreamClient,
        metrics: ProxyMetrics,
        chunk_size: usize,
    ) -> Self {
        Self {
            links,
            tokens,
            upstream,
            metrics,
            chunk_size,
        }
    }

    pub async fn handle(
        &self,
        method: &Method,
        slug: &str,
        range: Option<&HeaderValue>,
    ) -> Result<StreamedResponse, AppError> {
        if method != Method::GET && method != Method::HEAD {
            return Err(AppError::MethodNotAllowed);
        }

        let resource_id = self
            .links
            .resolve_slug(slug)
            .await?
            .ok_or(AppError::NotFound)?;

        let token = self.tokens.get_valid_token().await?;

        let response = self
            .upstream
            .fetch(method.clone(), &resource_id, &token, range)
            .await?;
        let guard = self.metrics.connection_guard();

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "upstream rejected media request");
            return Err(AppError::UpstreamRejected(status));
        }

        let metadata = Metadata {
            status,
            headers: relay_headers(response.headers()),
        };
        tracing::debug!(
            status = metadata.status.as_u16(),
            ranged = range.is_some(),
            "relaying upstream media"
        );

        let body = if method == Method::HEAD {
            None
        } else {
            Some(UpstreamBody::new(
                response,
                guard,
                self.chunk_size,
                self.metrics.clone(),
            ))
        };

        Ok(StreamedResponse { metadata, body })
    }
}
