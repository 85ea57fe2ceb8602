use axum::extract::{Extension, Multipart, Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

use super::{ApiError, Request};
use crate::app::App;
use crate::ingest::{self, IngestRequest};
use crate::resolver;
use crate::sessions;
use crate::tokens::AuthedUser;
use models::{DatasetStatus, RemoteSource, SensorKind, SessionState, Visibility};

/// The job handle every ingestion mode returns.
#[derive(Debug, Serialize)]
pub struct JobHandle {
    pub job_id: String,
    pub status: &'static str,
    pub upload_type: &'static str,
    pub estimated_duration: f64,
}

/// Progress shape of `GET /api/upload/status/{job_id}`.
#[derive(Debug, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub status: String,
    pub progress_percentage: f64,
    pub bytes_uploaded: u64,
    pub bytes_total: u64,
    pub message: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Rough wall-clock guess shown to clients: ingest at ~50 MiB/s plus a fixed
// conversion floor.
fn estimate_duration_secs(size_bytes: u64, convert: bool) -> f64 {
    let transfer = size_bytes as f64 / (50.0 * 1024.0 * 1024.0);
    if convert {
        transfer + 60.0
    } else {
        transfer
    }
}

fn parse_field<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ApiError>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|err| ApiError::bad_request(format!("invalid {name}: {err}")))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ApiError> {
    match raw {
        "true" | "True" | "1" | "yes" => Ok(true),
        "false" | "False" | "0" | "no" => Ok(false),
        other => Err(ApiError::bad_request(format!("invalid {name}: {other:?}"))),
    }
}

fn parse_tags(raw: &str) -> Vec<String> {
    // Either a JSON array or a comma-separated list.
    if let Ok(tags) = serde_json::from_str::<Vec<String>>(raw) {
        return tags;
    }
    raw.split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

#[derive(Default)]
struct MultipartIngest {
    dataset_name: Option<String>,
    sensor: Option<SensorKind>,
    convert: bool,
    is_public: Visibility,
    is_downloadable: Visibility,
    folder: Option<String>,
    tags: Vec<String>,
    description: Option<String>,
    team_id: Option<String>,
    dataset_identifier: Option<String>,
    add_to_existing: bool,
    file: Option<(String, bytes::Bytes)>,
    upload_id: Option<String>,
    chunk_number: Option<u64>,
    chunk_hash: Option<String>,
}

impl MultipartIngest {
    async fn parse(mut multipart: Multipart) -> Result<MultipartIngest, ApiError> {
        let mut out = MultipartIngest {
            convert: true,
            ..MultipartIngest::default()
        };

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| ApiError::bad_request(format!("malformed multipart body: {err}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" | "chunk" => {
                    let filename = field
                        .file_name()
                        .map(sessions::sanitize_filename)
                        .unwrap_or_else(|| "upload.bin".to_string());
                    let data = field.bytes().await.map_err(|err| {
                        ApiError::bad_request(format!("failed to read {name}: {err}"))
                    })?;
                    out.file = Some((filename, data));
                }
                _ => {
                    let value = field.text().await.map_err(|err| {
                        ApiError::bad_request(format!("failed to read field {name}: {err}"))
                    })?;
                    match name.as_str() {
                        "dataset_name" => out.dataset_name = Some(value),
                        "sensor" => out.sensor = Some(parse_field("sensor", &value)?),
                        "convert" => out.convert = parse_bool("convert", &value)?,
                        "is_public" => out.is_public = parse_field("is_public", &value)?,
                        "is_downloadable" => {
                            out.is_downloadable = parse_field("is_downloadable", &value)?
                        }
                        "folder" => out.folder = Some(value),
                        "tags" => out.tags = parse_tags(&value),
                        "description" => out.description = Some(value),
                        "team_id" => out.team_id = Some(value),
                        "dataset_identifier" => out.dataset_identifier = Some(value),
                        "add_to_existing" => {
                            out.add_to_existing = parse_bool("add_to_existing", &value)?
                        }
                        "upload_id" => out.upload_id = Some(value),
                        "chunk_number" => {
                            out.chunk_number = Some(parse_field("chunk_number", &value)?)
                        }
                        "chunk_hash" => out.chunk_hash = Some(value),
                        other => {
                            tracing::debug!(field = other, "ignoring unknown multipart field")
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn into_ingest_request(self) -> Result<(IngestRequest, Option<(String, bytes::Bytes)>), ApiError> {
        let add_to_existing = self.add_to_existing || self.dataset_identifier.is_some();
        let dataset_name = match (&self.dataset_name, add_to_existing) {
            (Some(name), _) => name.clone(),
            (None, true) => String::new(),
            (None, false) => {
                return Err(ApiError::bad_request("missing required field dataset_name"))
            }
        };
        let sensor = match (self.sensor, add_to_existing) {
            (Some(sensor), _) => sensor,
            // Appends inherit the record's sensor; the value is unused.
            (None, true) => SensorKind::Other,
            (None, false) => return Err(ApiError::bad_request("missing required field sensor")),
        };

        Ok((
            IngestRequest {
                dataset_name,
                sensor,
                convert: self.convert,
                is_public: self.is_public,
                is_downloadable: self.is_downloadable,
                folder: self.folder,
                tags: self.tags,
                description: self.description,
                team_id: self.team_id,
                dataset_identifier: self.dataset_identifier,
                add_to_existing,
            },
            self.file,
        ))
    }
}

/// POST /api/upload/upload — whole-file multipart ingestion.
pub async fn whole_file(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthedUser>,
    multipart: Multipart,
) -> Result<Json<JobHandle>, ApiError> {
    let parsed = MultipartIngest::parse(multipart).await?;
    let (request, file) = parsed.into_ingest_request()?;
    let (filename, payload) =
        file.ok_or_else(|| ApiError::bad_request("missing required field file"))?;

    let row = ingest::whole_file(&app, &user, &request, &filename, &payload).await?;
    Ok(Json(JobHandle {
        job_id: row.uuid,
        status: "queued",
        upload_type: "standard",
        estimated_duration: estimate_duration_secs(payload.len() as u64, row.convert),
    }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct InitiateChunkedRequest {
    #[validate(length(min = 1))]
    pub filename: String,
    #[validate(range(min = 1))]
    pub file_size: u64,
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub chunk_hashes: Option<Vec<String>>,
    #[serde(default)]
    pub dataset_name: Option<String>,
    #[serde(default)]
    pub sensor: Option<SensorKind>,
    #[serde(default = "default_true")]
    pub convert: bool,
    #[serde(default)]
    pub is_public: Visibility,
    #[serde(default)]
    pub is_downloadable: Visibility,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub dataset_identifier: Option<String>,
    #[serde(default)]
    pub add_to_existing: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct InitiateChunkedResponse {
    pub upload_id: String,
    pub chunk_size: u64,
    pub total_chunks: u64,
}

/// POST /api/upload/initiate-chunked
pub async fn initiate_chunked(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthedUser>,
    Request(body): Request<InitiateChunkedRequest>,
) -> Result<Json<InitiateChunkedResponse>, ApiError> {
    let add_to_existing = body.add_to_existing || body.dataset_identifier.is_some();
    let request = IngestRequest {
        dataset_name: body
            .dataset_name
            .clone()
            .or_else(|| (!add_to_existing).then(|| body.filename.clone()))
            .unwrap_or_default(),
        sensor: match (body.sensor, add_to_existing) {
            (Some(sensor), _) => sensor,
            (None, true) => SensorKind::Other,
            (None, false) => return Err(ApiError::bad_request("missing required field sensor")),
        },
        convert: body.convert,
        is_public: body.is_public,
        is_downloadable: body.is_downloadable,
        folder: body.folder.clone(),
        tags: body.tags.clone(),
        description: body.description.clone(),
        team_id: body.team_id.clone(),
        dataset_identifier: body.dataset_identifier.clone(),
        add_to_existing,
    };

    let (session, _dataset) = ingest::initiate_chunked(
        &app,
        &user,
        &request,
        &body.filename,
        body.file_size,
        body.file_hash.as_deref(),
        body.chunk_hashes.as_deref(),
    )
    .await?;

    Ok(Json(InitiateChunkedResponse {
        upload_id: session.session_id,
        chunk_size: session.chunk_size_bytes as u64,
        total_chunks: session.total_chunks as u64,
    }))
}

#[derive(Debug, Serialize)]
pub struct ChunkResponse {
    pub upload_id: String,
    pub chunk_number: u64,
    pub received: u64,
    pub count: u64,
}

/// POST /api/upload/chunk — one multipart chunk write.
pub async fn chunk(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthedUser>,
    multipart: Multipart,
) -> Result<Json<ChunkResponse>, ApiError> {
    let parsed = MultipartIngest::parse(multipart).await?;
    let upload_id = parsed
        .upload_id
        .clone()
        .ok_or_else(|| ApiError::bad_request("missing required field upload_id"))?;
    let chunk_number = parsed
        .chunk_number
        .ok_or_else(|| ApiError::bad_request("missing required field chunk_number"))?;
    let (_, payload) = parsed
        .file
        .as_ref()
        .ok_or_else(|| ApiError::bad_request("missing required field chunk"))?;

    let session = catalog_sql::sessions::fetch(&upload_id, &app.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("upload session"))?;
    if session.owner_email != user.email {
        return Err(ApiError::forbidden("upload session belongs to another user"));
    }

    let receipt = sessions::write_chunk(
        &app.layout,
        &app.pool,
        &upload_id,
        chunk_number,
        payload,
        parsed.chunk_hash.as_deref(),
    )
    .await?;

    Ok(Json(ChunkResponse {
        upload_id,
        chunk_number,
        received: receipt.received,
        count: receipt.total,
    }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CompleteChunkedRequest {
    #[validate(length(min = 1))]
    pub upload_id: String,
}

/// POST /api/upload/complete-chunked
pub async fn complete_chunked(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthedUser>,
    Request(body): Request<CompleteChunkedRequest>,
) -> Result<Json<JobHandle>, ApiError> {
    let row = ingest::complete_chunked(&app, &user, &body.upload_id).await?;
    let file_bytes_total =
        catalog_sql::datasets::file_bytes_total(&row.uuid, &app.pool).await? as u64;
    Ok(Json(JobHandle {
        job_id: row.uuid,
        status: "queued",
        upload_type: "chunked",
        estimated_duration: estimate_duration_secs(file_bytes_total, row.convert),
    }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct InitiateRemoteRequest {
    /// One of {url, s3, google_drive}; unknown kinds are rejected.
    #[validate(length(min = 1))]
    pub source_type: String,
    pub source_config: serde_json::Value,
    #[validate(length(min = 1))]
    pub dataset_name: String,
    pub sensor: SensorKind,
    #[serde(default = "default_true")]
    pub convert: bool,
    #[serde(default)]
    pub is_public: Visibility,
    #[serde(default)]
    pub is_downloadable: Visibility,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub dataset_identifier: Option<String>,
    #[serde(default)]
    pub add_to_existing: bool,
}

/// POST /api/upload/initiate — remote-source ingestion.
pub async fn initiate_remote(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthedUser>,
    Request(body): Request<InitiateRemoteRequest>,
) -> Result<Json<JobHandle>, ApiError> {
    let source: RemoteSource = serde_json::from_value(serde_json::json!({
        "source_type": body.source_type,
        "source_config": body.source_config,
    }))
    .map_err(|err| ApiError::bad_request(format!("invalid source descriptor: {err}")))?;

    let request = IngestRequest {
        dataset_name: body.dataset_name.clone(),
        sensor: body.sensor,
        convert: body.convert,
        is_public: body.is_public,
        is_downloadable: body.is_downloadable,
        folder: body.folder.clone(),
        tags: body.tags.clone(),
        description: body.description.clone(),
        team_id: body.team_id.clone(),
        dataset_identifier: body.dataset_identifier.clone(),
        add_to_existing: body.add_to_existing,
    };

    let row = ingest::remote(&app, &user, &request, &source).await?;
    Ok(Json(JobHandle {
        job_id: row.uuid,
        status: "queued",
        upload_type: "remote",
        estimated_duration: estimate_duration_secs(0, row.convert),
    }))
}

fn job_phase(status: DatasetStatus) -> &'static str {
    use DatasetStatus::*;
    match status {
        Submitted | UploadQueued | SyncQueued | ConversionQueued => "queued",
        Uploading | Unzipping | Syncing | Converting => "processing",
        Done => "completed",
        UploadError | SyncError | ConversionError | ConversionFailed => "failed",
        Cancelled => "cancelled",
    }
}

fn job_progress(status: DatasetStatus) -> f64 {
    use DatasetStatus::*;
    match status {
        Submitted => 0.0,
        UploadQueued | SyncQueued => 5.0,
        Uploading | Syncing => 30.0,
        Unzipping => 45.0,
        ConversionQueued => 50.0,
        Converting => 75.0,
        Done => 100.0,
        UploadError | SyncError | ConversionError | ConversionFailed | Cancelled => 0.0,
    }
}

fn dataset_job_status(
    row: &catalog_sql::datasets::DatasetRow,
    bytes_total: u64,
) -> Result<JobStatus, ApiError> {
    let status = row
        .status()
        .map_err(|err| ApiError::new(axum::http::StatusCode::INTERNAL_SERVER_ERROR, err))?;
    Ok(JobStatus {
        job_id: row.uuid.clone(),
        status: job_phase(status).to_string(),
        progress_percentage: job_progress(status),
        bytes_uploaded: bytes_total,
        bytes_total,
        message: format!("dataset is {status}"),
        error: row.error_message.clone(),
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

/// GET /api/upload/status/{job_id}. A job id names either a chunked-upload
/// session or a dataset lifecycle; sessions are tried first.
pub async fn job_status(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthedUser>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatus>, ApiError> {
    if let Some(session) = catalog_sql::sessions::fetch(&job_id, &app.pool).await? {
        if session.owner_email != user.email {
            return Err(ApiError::forbidden("upload session belongs to another user"));
        }
        let info = sessions::resume_info(&app.pool, &job_id).await?;
        let status = match info.state {
            SessionState::Open => "uploading",
            SessionState::Completing => "processing",
            SessionState::Complete => "completed",
            SessionState::Aborted => "cancelled",
            SessionState::Expired => "failed",
        };
        return Ok(Json(JobStatus {
            job_id,
            status: status.to_string(),
            progress_percentage: if info.total_chunks == 0 {
                0.0
            } else {
                info.received_chunks.len() as f64 * 100.0 / info.total_chunks as f64
            },
            bytes_uploaded: info.bytes_received,
            bytes_total: info.total_bytes,
            message: format!(
                "{} of {} chunks received",
                info.received_chunks.len(),
                info.total_chunks
            ),
            error: None,
            created_at: session.created_at,
            updated_at: session.created_at,
        }));
    }

    let row = resolver::resolve(&job_id, Some(&user.email), &app.pool).await?;
    if row.owner_email != user.email && row.is_public() != Visibility::Public {
        return Err(ApiError::forbidden("dataset belongs to another user"));
    }
    let bytes = catalog_sql::datasets::file_bytes_total(&row.uuid, &app.pool).await? as u64;
    Ok(Json(dataset_job_status(&row, bytes)?))
}

/// POST /api/upload/cancel/{job_id}. Cancels an upload session, or a dataset
/// anywhere in its lifecycle; cancelling a terminal job is a no-op.
pub async fn cancel(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthedUser>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(session) = catalog_sql::sessions::fetch(&job_id, &app.pool).await? {
        if session.owner_email != user.email {
            return Err(ApiError::forbidden("upload session belongs to another user"));
        }
        match sessions::abort(&app.layout, &app.pool, &job_id).await {
            Ok(()) => {}
            // Aborting a session that already settled is a no-op.
            Err(sessions::SessionError::WrongState { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        return Ok(Json(serde_json::json!({"cancelled": job_id})));
    }

    let row = resolver::resolve(&job_id, Some(&user.email), &app.pool).await?;
    if row.owner_email != user.email {
        return Err(ApiError::forbidden("dataset belongs to another user"));
    }
    ingest::cancel_dataset(&app, &row).await?;
    Ok(Json(serde_json::json!({"cancelled": job_id})))
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub status: Option<DatasetStatus>,
}

#[derive(Debug, Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<JobStatus>,
    pub limit: i64,
    pub offset: i64,
}

/// GET /api/upload/jobs — the caller's recent jobs, newest first.
pub async fn list_jobs(
    State(app): State<Arc<App>>,
    Extension(user): Extension<AuthedUser>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<JobsResponse>, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let offset = query.offset.unwrap_or(0).max(0);

    let rows = catalog_sql::datasets::list_by_owner(
        &user.email,
        query.status,
        limit,
        offset,
        &app.pool,
    )
    .await?;

    let mut jobs = Vec::with_capacity(rows.len());
    for row in &rows {
        let bytes = catalog_sql::datasets::file_bytes_total(&row.uuid, &app.pool).await? as u64;
        jobs.push(dataset_job_status(row, bytes)?);
    }
    Ok(Json(JobsResponse {
        jobs,
        limit,
        offset,
    }))
}

/// GET /api/upload/supported-sources — capability discovery.
pub async fn supported_sources(State(app): State<Arc<App>>) -> Json<serde_json::Value> {
    let mut sources = vec!["url"];
    if app.fetchers.s3.is_some() {
        sources.push("s3");
    }
    if app.fetchers.google_drive.is_some() {
        sources.push("google_drive");
    }
    Json(serde_json::json!({ "sources": sources }))
}

/// GET /api/upload/limits — capability discovery.
pub async fn limits(State(app): State<Arc<App>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "max_file_size": app.limits.max_file_bytes,
        "chunk_size": app.limits.chunk_size_bytes,
        "whole_file_limit": app.limits.whole_file_limit,
        "session_ttl_seconds": app.limits.session_ttl.num_seconds(),
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn job_phases_collapse_statuses_for_clients() {
        insta::assert_json_snapshot!(
            serde_json::json!({
                "done": job_phase(DatasetStatus::Done),
                "queued": job_phase(DatasetStatus::ConversionQueued),
                "running": job_phase(DatasetStatus::Converting),
                "stopped": job_phase(DatasetStatus::Cancelled),
            }),
            @r###"
        {
          "done": "completed",
          "queued": "queued",
          "running": "processing",
          "stopped": "cancelled"
        }
        "###
        );
    }

    #[test]
    fn progress_is_monotonic_along_the_happy_path() {
        use DatasetStatus::*;
        let path = [Submitted, UploadQueued, Uploading, ConversionQueued, Converting, Done];
        for pair in path.windows(2) {
            assert!(job_progress(pair[0]) < job_progress(pair[1]));
        }
    }

    #[test]
    fn tag_fields_accept_both_shapes() {
        assert_eq!(parse_tags(r#"["a","b"]"#), vec!["a", "b"]);
        assert_eq!(parse_tags("a, b ,"), vec!["a", "b"]);
        assert!(parse_tags("").is_empty());
    }
}
