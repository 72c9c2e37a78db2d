use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::{RANGE, USER_AGENT};
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::errors::AppError;
use crate::AppState;

/// `/v/:slug` and `/v/:slug/:file_name`. The file name only exists so players
/// and download managers see a sensible name; it is ignored.
#[derive(Debug, Deserialize)]
pub struct StreamPath {
    pub slug: String,
    #[serde(default)]
    pub file_name: Option<String>,
}

/// Serves GET and HEAD on a published link.
#[tracing::instrument(
    skip_all,
    fields(
        req_id = %uuid::Uuid::new_v4(),
        method = %method,
        slug = %slug_preview(&path.slug),
    )
)]
pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(path): Path<StreamPath>,
    headers: HeaderMap,
) -> Response {
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    tracing::info!(
        user_agent,
        range = headers.get(RANGE).and_then(|v| v.to_str().ok()).unwrap_or("-"),
        "stream request"
    );

    let result: Result<_, AppError> = state
        .proxy
        .handle(&method, &path.slug, headers.get(RANGE))
        .await;

    let response = match result {
        Ok(streamed) => streamed.into_response(),
        Err(e) => {
            if e.status().is_server_error() {
                tracing::error!(error = %e, "stream request failed");
            } else {
                tracing::info!(error = %e, "stream request refused");
            }
            e.into_response()
        }
    };

    state
        .metrics
        .record_request(method.as_str(), response.status().as_u16());
    response
}

/// Enough of a slug to correlate log lines without writing the capability
/// itself to the logs.
fn slug_preview(slug: &str) -> String {
    let head: String = slug.chars().take(8).collect();
    if head.len() < slug.len() {
        format!("{}…", head)
    } else {
        head
    }
}
