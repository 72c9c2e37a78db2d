//! HTTP client for the cloud-drive file endpoint.
//!
//! No retries and no overall timeout: a media download can legitimately last
//! as long as the viewer keeps watching.
use std::time::Duration;

use axum::http::{HeaderValue, Method};
use reqwest::header::{AUTHORIZATION, RANGE};
use url::Url;

use crate::errors::AppError;
use crate::token_manager::AccessToken;

pub struct UpstreamClient {
    client: reqwest::Client,
    files_base: Url,
}

impl UpstreamClient {
    pub fn new(files_base_url: &str) -> anyhow::Result<Self> {
        let files_base = Url::parse(files_base_url)?;
        if files_base.cannot_be_a_base() {
            anyhow::bail!("files base URL cannot carry a path: {}", files_base_url);
        }

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(32)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self { client, files_base })
    }

    /// `{base}/{resource_id}?alt=media`, with the id percent-encoded as one segment.
    pub fn media_url(&self, resource_id: &str) -> Url {
        let mut url = self.files_base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(resource_id);
        }
        url.query_pairs_mut().append_pair("alt", "media");
        url
    }

    /// Issues the upstream request. The client's `Range` header is forwarded as-is.
    pub async fn fetch(
        &self,
        method: Method,
        resource_id: &str,
        token: &AccessToken,
        range: Option<&HeaderValue>,
    ) -> Result<reqwest::Response, AppError> {
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token.token))
            .map_err(|_| AppError::Internal(anyhow::anyhow!("access token is not a valid header value")))?;

        let mut request = self
            .client
            .request(method, self.media_url(resource_id))
            .header(AUTHORIZATION, bearer);
        if let Some(range) = range {
            request = request.header(RANGE, range.clone());
        }

        // The request URL carries the resource id; keep it in the log only.
        request.send().await.map_err(|e| {
            tracing::warn!("Upstream request failed: {}", e);
            AppError::Upstream(e.without_url().to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_url_shape() {
        let client = UpstreamClient::new("https://www.googleapis.com/drive/v3/files").unwrap();
        assert_eq!(
            client.media_url("1FeZu-LUFI6Kf3pl2AjyVUdqwgDxd0KRq").as_str(),
            "https://www.googleapis.com/drive/v3/files/1FeZu-LUFI6Kf3pl2AjyVUdqwgDxd0KRq?alt=media"
        );
    }

    #[test]
    fn test_media_url_encodes_resource_id() {
        let client = UpstreamClient::new("http://localhost:9000/files/").unwrap();
        assert_eq!(
            client.media_url("a/b c").as_str(),
            "http://localhost:9000/files/a%2Fb%20c?alt=media"
        );
    }

    #[test]
    fn test_rejects_opaque_base() {
        assert!(UpstreamClient::new("mailto:someone@example.com").is_err());
    }
}
