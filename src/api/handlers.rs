use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, StoreError};
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct CreateLinkRequest {
    pub resource_id: String,
    /// Cosmetic trailing segment for the published path.
    pub file_name: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct CreateLinkResponse {
    pub slug: String,
    pub path: String,
}

#[derive(Serialize, Deserialize)]
pub struct LinkResponse {
    pub slug: String,
    pub resource_id: String,
    pub created_at: DateTime<Utc>,
}

/// Relative path under which a slug is served.
pub fn link_path(slug: &str, file_name: Option<&str>) -> String {
    match file_name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => format!("/v/{}/{}", slug, urlencoding::encode(name)),
        None => format!("/v/{}", slug),
    }
}

// ── Links ────────────────────────────────────────────────────

pub async fn create_link(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateLinkRequest>,
) -> Result<(StatusCode, Json<CreateLinkResponse>), AppError> {
    let resource_id = payload.resource_id.trim();
    if resource_id.is_empty() {
        tracing::warn!("create_link: empty resource_id");
        return Err(AppError::InvalidRequest(
            "resource_id must not be empty".to_string(),
        ));
    }

    let slug = state
        .links
        .get_or_create_slug(resource_id)
        .await
        .map_err(|e| {
            if let StoreError::SlugGenerationExhausted { attempts } = e {
                tracing::error!(attempts, resource_id, "create_link: slug space collision");
            } else {
                tracing::error!("create_link failed: {}", e);
            }
            AppError::from(e)
        })?;

    let path = link_path(&slug, payload.file_name.as_deref());
    Ok((StatusCode::CREATED, Json(CreateLinkResponse { slug, path })))
}

pub async fn get_link(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Json<LinkResponse>, StatusCode> {
    let record = state
        .links
        .get_record(&slug)
        .await
        .map_err(|e| {
            tracing::error!("get_link failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(LinkResponse {
        slug: record.slug,
        resource_id: record.resource_id,
        created_at: record.created_at,
    }))
}

pub async fn revoke_link(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> StatusCode {
    match state.links.revoke_slug(&slug).await {
        Ok(true) => StatusCode::NO_CONTENT,
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => {
            tracing::error!("revoke_link failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
