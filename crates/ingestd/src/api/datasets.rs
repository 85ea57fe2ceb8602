use axum::extract::{Extension, Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::ApiError;
use crate::app::App;
use crate::resolver;
use crate::tokens::AuthedUser;
use models::{DatasetStatus, Visibility};

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub filename: String,
    pub relative_path: String,
    pub size_bytes: i64,
    pub uploaded_at: DateTime<Utc>,
}

/// The canonical dataset record as the query surface exposes it.
#[derive(Debug, Serialize)]
pub struct DatasetResponse {
    pub uuid: String,
    pub name: String,
    pub slug: String,
    pub numeric_id: i64,
    pub owner_email: String,
    pub team_id: Option<String>,
    pub sensor: String,
    pub convert: bool,
    pub is_public: Visibility,
    pub is_downloadable: Visibility,
    pub status: String,
    pub folder: Option<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub data_size_gb: Option<f64>,
    pub error_message: Option<String>,
    pub conversion_attempts: i64,
    pub files: Vec<FileEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

async fn render(
    app: &App,
    row: catalog_sql::datasets::DatasetRow,
) -> Result<DatasetResponse, ApiError> {
    let files = catalog_sql::datasets::list_files(&row.uuid, &app.pool)
        .await?
        .into_iter()
        .map(|f| FileEntry {
            filename: f.filename,
            relative_path: f.relative_path,
            size_bytes: f.size_bytes,
            uploaded_at: f.uploaded_at,
        })
        .collect();

    Ok(DatasetResponse {
        tags: row.tags(),
        is_public: row.is_public(),
        is_downloadable: row.is_downloadable(),
        uuid: row.uuid,
        name: row.name,
        slug: row.slug,
        numeric_id: row.numeric_id,
        owner_email: row.owner_email,
        team_id: row.team_id,
        sensor: row.sensor_kind,
        convert: row.convert,
        status: row.status,
        folder: row.folder,
        description: row.description,
        data_size_gb: row.data_size_gb,
        error_message: row.error_message,
        conversion_attempts: row.conversion_attempts,
        files,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

/// GET /api/v1/datasets/{identifier}. Public datasets read without
/// credentials; everything else requires the owner.
pub async fn get(
    State(app): State<Arc<App>>,
    user: Option<Extension<AuthedUser>>,
    Path(identifier): Path<String>,
) -> Result<Json<DatasetResponse>, ApiError> {
    let user = user.map(|Extension(user)| user);
    let row = resolver::resolve(
        &identifier,
        user.as_ref().map(|u| u.email.as_str()),
        &app.pool,
    )
    .await?;

    let is_owner = user
        .as_ref()
        .map(|u| u.email == row.owner_email)
        .unwrap_or(false);
    if !is_owner && row.is_public() != Visibility::Public {
        return match user {
            None => Err(ApiError::unauthorized("this dataset is not public")),
            Some(_) => Err(ApiError::forbidden("this dataset is not public")),
        };
    }

    Ok(Json(render(&app, row).await?))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<DatasetStatus>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

/// GET /api/v1/datasets — the caller's datasets, optionally filtered by
/// status.
pub async fn list(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthedUser>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DatasetResponse>>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = query.offset.unwrap_or(0).max(0);

    let rows = catalog_sql::datasets::list_by_owner(
        &user.email,
        query.status,
        limit,
        offset,
        &app.pool,
    )
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(render(&app, row).await?);
    }
    Ok(Json(out))
}
