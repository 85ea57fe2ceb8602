//! The ingest router's core: the three ingestion modes share a common
//! postlude (persist bytes -> record file -> advance status -> hand back a
//! job handle). HTTP shaping lives in `api::upload`; this module owns the
//! semantics.

use chrono::Utc;
use models::{DatasetStatus, RemoteSource, SensorKind, Visibility};

use crate::app::App;
use crate::resolver::{self, CreateError, ResolveError};
use crate::sessions::{self, SessionError};
use crate::tokens::AuthedUser;
use catalog_sql::datasets as db;

/// Cross-cutting fields every ingestion mode accepts.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub dataset_name: String,
    pub sensor: SensorKind,
    pub convert: bool,
    pub is_public: Visibility,
    pub is_downloadable: Visibility,
    pub folder: Option<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub team_id: Option<String>,
    /// Set to append files to an existing dataset instead of creating one.
    pub dataset_identifier: Option<String>,
    pub add_to_existing: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("dataset not found")]
    NotFound,
    #[error("identifier matches more than one dataset; retry with its uuid")]
    Ambiguous,
    #[error("only the dataset owner may add files to it")]
    Forbidden,
    #[error("a dataset named {name:?} already exists for this owner")]
    NameTaken { name: String },
    #[error("zero-byte files are rejected")]
    EmptyFile,
    #[error("file of {size} bytes exceeds the {limit} byte whole-file limit; use chunked upload")]
    UseChunked { size: u64, limit: u64 },
    #[error("file of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ResolveError> for IngestError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound => IngestError::NotFound,
            ResolveError::Ambiguous => IngestError::Ambiguous,
            ResolveError::Storage(err) => IngestError::Storage(err),
        }
    }
}

impl From<CreateError> for IngestError {
    fn from(err: CreateError) -> Self {
        match err {
            CreateError::NameTaken { name } => IngestError::NameTaken { name },
            CreateError::Storage(err) => IngestError::Storage(err),
        }
    }
}

/// Locate or create the dataset a request targets. Appending requires the
/// authenticated user to own the record.
async fn target_dataset(
    app: &App,
    user: &AuthedUser,
    req: &IngestRequest,
    remote_source: Option<&RemoteSource>,
) -> Result<(db::DatasetRow, bool), IngestError> {
    if req.add_to_existing || req.dataset_identifier.is_some() {
        let identifier = req
            .dataset_identifier
            .as_deref()
            .unwrap_or(&req.dataset_name);
        let row = resolver::resolve(identifier, Some(&user.email), &app.pool).await?;
        if row.owner_email != user.email {
            return Err(IngestError::Forbidden);
        }
        return Ok((row, false));
    }

    let row = resolver::create_dataset(
        &resolver::CreateDataset {
            name: &req.dataset_name,
            owner_email: &user.email,
            team_id: req.team_id.as_deref(),
            sensor_kind: req.sensor,
            convert: req.convert,
            is_public: req.is_public,
            is_downloadable: req.is_downloadable,
            folder: req.folder.as_deref(),
            tags: &req.tags,
            description: req.description.as_deref(),
            remote_source,
        },
        &app.pool,
    )
    .await?;
    Ok((row, true))
}

/// Move a dataset into `uploading` when its current status allows it. An
/// existing dataset that is already ingesting (or terminal) is left alone.
async fn begin_uploading(app: &App, row: &db::DatasetRow) -> Result<(), IngestError> {
    let status = row.status().map_err(|err| IngestError::Validation(err.to_string()))?;
    if status != DatasetStatus::Uploading && status.can_transition_to(DatasetStatus::Uploading) {
        db::compare_and_set_status(
            &row.uuid,
            status,
            DatasetStatus::Uploading,
            Utc::now(),
            &app.pool,
        )
        .await?;
    }
    Ok(())
}

/// The postlude: once bytes are in place, an `uploading` dataset advances to
/// the conversion queue, or straight to `done` when conversion is disabled.
/// Uploaded zip archives take the `unzipping` detour and are expanded in
/// place first. A lost compare-and-set (someone else advanced it) is not an
/// error.
pub async fn advance_after_upload(app: &App, uuid: &str) -> Result<db::DatasetRow, IngestError> {
    let row = db::fetch_by_uuid(uuid, &app.pool)
        .await?
        .ok_or(IngestError::NotFound)?;

    if row.status().ok() == Some(DatasetStatus::Uploading) {
        let to = if row.convert {
            DatasetStatus::ConversionQueued
        } else {
            DatasetStatus::Done
        };

        let archives = find_archives(&app.layout.upload_dir(uuid)).await?;
        if archives.is_empty() {
            db::compare_and_set_status(
                &row.uuid,
                DatasetStatus::Uploading,
                to,
                Utc::now(),
                &app.pool,
            )
            .await?;
        } else if db::compare_and_set_status(
            &row.uuid,
            DatasetStatus::Uploading,
            DatasetStatus::Unzipping,
            Utc::now(),
            &app.pool,
        )
        .await?
        {
            match extract_archives(app, uuid, archives).await {
                Ok(()) => {
                    db::compare_and_set_status(
                        &row.uuid,
                        DatasetStatus::Unzipping,
                        to,
                        Utc::now(),
                        &app.pool,
                    )
                    .await?;
                }
                Err(err) => {
                    db::fail_status(
                        &row.uuid,
                        DatasetStatus::Unzipping,
                        DatasetStatus::UploadError,
                        &format!("failed to expand uploaded archive: {err}"),
                        Utc::now(),
                        &app.pool,
                    )
                    .await?;
                }
            }
        }
    }

    db::fetch_by_uuid(uuid, &app.pool)
        .await?
        .ok_or(IngestError::NotFound)
}

async fn find_archives(dir: &std::path::Path) -> std::io::Result<Vec<std::path::PathBuf>> {
    let mut archives = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_zip = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);
        if is_zip && entry.file_type().await?.is_file() {
            archives.push(path);
        }
    }
    Ok(archives)
}

/// Expand each archive into the dataset's file area, drop the archive bytes,
/// and record the extracted files. Runs on the blocking pool; zip reading is
/// synchronous.
async fn extract_archives(
    app: &App,
    uuid: &str,
    archives: Vec<std::path::PathBuf>,
) -> Result<(), IngestError> {
    let dir = app.layout.upload_dir(uuid);

    let extracted = tokio::task::spawn_blocking(move || -> Result<Vec<(String, i64)>, String> {
        for archive_path in &archives {
            let file = std::fs::File::open(archive_path).map_err(|err| err.to_string())?;
            let mut archive = zip::ZipArchive::new(file)
                .map_err(|err| format!("unreadable zip archive: {err}"))?;
            archive
                .extract(&dir)
                .map_err(|err| format!("zip extraction failed: {err}"))?;
            std::fs::remove_file(archive_path).map_err(|err| err.to_string())?;
        }

        // Re-list the expanded tree; paths are recorded relative to the
        // dataset's file area.
        fn walk(
            root: &std::path::Path,
            dir: &std::path::Path,
            out: &mut Vec<(String, i64)>,
        ) -> std::io::Result<()> {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    walk(root, &path, out)?;
                } else {
                    let relative = path
                        .strip_prefix(root)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .into_owned();
                    out.push((relative, entry.metadata()?.len() as i64));
                }
            }
            Ok(())
        }
        let mut out = Vec::new();
        walk(&dir, &dir, &mut out).map_err(|err| err.to_string())?;
        Ok(out)
    })
    .await
    .map_err(|err| IngestError::Validation(format!("archive expansion panicked: {err}")))?
    .map_err(IngestError::Validation)?;

    let now = Utc::now();
    for (relative_path, size_bytes) in extracted {
        let filename = sessions::sanitize_filename(&relative_path);
        db::append_file(uuid, &relative_path, &filename, size_bytes, now, &app.pool).await?;
    }
    Ok(())
}

/// Whole-file ingestion: the entire payload arrived in one multipart request.
/// Files above the whole-file threshold are redirected to chunked mode.
pub async fn whole_file(
    app: &App,
    user: &AuthedUser,
    req: &IngestRequest,
    filename: &str,
    payload: &[u8],
) -> Result<db::DatasetRow, IngestError> {
    if payload.is_empty() {
        return Err(IngestError::EmptyFile);
    }
    let size = payload.len() as u64;
    if size > app.limits.whole_file_limit {
        return Err(IngestError::UseChunked {
            size,
            limit: app.limits.whole_file_limit,
        });
    }

    let (row, _created) = target_dataset(app, user, req, None).await?;
    begin_uploading(app, &row).await?;

    let filename = sessions::sanitize_filename(filename);
    let dir = app.layout.upload_dir(&row.uuid);
    tokio::fs::create_dir_all(&dir).await?;
    let part = dir.join(format!("{filename}.part-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&part, payload).await?;
    tokio::fs::rename(&part, dir.join(&filename)).await?;

    db::append_file(&row.uuid, &filename, &filename, size as i64, Utc::now(), &app.pool).await?;

    advance_after_upload(app, &row.uuid).await
}

/// Chunked ingestion, step one: create (or resolve) the dataset and open an
/// upload session against it.
pub async fn initiate_chunked(
    app: &App,
    user: &AuthedUser,
    req: &IngestRequest,
    filename: &str,
    file_size: u64,
    file_hash: Option<&str>,
    chunk_hashes: Option<&[String]>,
) -> Result<(catalog_sql::sessions::SessionRow, db::DatasetRow), IngestError> {
    if file_size == 0 {
        return Err(IngestError::EmptyFile);
    }
    if file_size > app.limits.max_file_bytes {
        return Err(IngestError::TooLarge {
            size: file_size,
            max: app.limits.max_file_bytes,
        });
    }

    let (row, _created) = target_dataset(app, user, req, None).await?;
    begin_uploading(app, &row).await?;

    let session = sessions::initiate(
        &app.layout,
        &app.pool,
        sessions::InitiateSession {
            dataset_uuid: &row.uuid,
            filename,
            total_bytes: file_size,
            chunk_size: app.limits.chunk_size_bytes,
            overall_hash: file_hash,
            chunk_hashes,
            owner_email: &user.email,
            ttl: app.limits.session_ttl,
        },
    )
    .await?;

    let row = db::fetch_by_uuid(&row.uuid, &app.pool)
        .await?
        .ok_or(IngestError::NotFound)?;
    Ok((session, row))
}

/// Chunked ingestion, final step: assemble, verify, and run the postlude.
pub async fn complete_chunked(
    app: &App,
    user: &AuthedUser,
    upload_id: &str,
) -> Result<db::DatasetRow, IngestError> {
    let session = catalog_sql::sessions::fetch(upload_id, &app.pool)
        .await?
        .ok_or(IngestError::NotFound)?;
    if session.owner_email != user.email {
        return Err(IngestError::Forbidden);
    }

    let assembled = sessions::complete(&app.layout, &app.pool, upload_id).await?;
    advance_after_upload(app, &assembled.dataset_uuid).await
}

/// Remote-source ingestion: the dataset lands in `sync_queued` and the worker
/// pool pulls the bytes.
pub async fn remote(
    app: &App,
    user: &AuthedUser,
    req: &IngestRequest,
    source: &RemoteSource,
) -> Result<db::DatasetRow, IngestError> {
    let (row, created) = target_dataset(app, user, req, Some(source)).await?;
    let status = row
        .status()
        .map_err(|err| IngestError::Validation(err.to_string()))?;

    if !created {
        if !status.can_transition_to(DatasetStatus::SyncQueued) {
            return Err(IngestError::Validation(format!(
                "dataset is {status} and cannot accept a remote-source sync"
            )));
        }
        db::set_remote_source(&row.uuid, source, Utc::now(), &app.pool).await?;
    }

    db::compare_and_set_status(
        &row.uuid,
        status,
        DatasetStatus::SyncQueued,
        Utc::now(),
        &app.pool,
    )
    .await?;

    db::fetch_by_uuid(&row.uuid, &app.pool)
        .await?
        .ok_or(IngestError::NotFound)
}

/// Cancel a job. Queued datasets move straight to `cancelled`; running ones
/// get the flag and the worker lands the transition; terminal ones are a
/// no-op. Returns the dataset's (possibly unchanged) row.
pub async fn cancel_dataset(app: &App, row: &db::DatasetRow) -> Result<db::DatasetRow, IngestError> {
    let status = row
        .status()
        .map_err(|err| IngestError::Validation(err.to_string()))?;
    let now = Utc::now();

    if status.is_terminal() {
        // Cancelling an already-terminal dataset is a no-op.
    } else if matches!(status, DatasetStatus::Converting | DatasetStatus::Syncing) {
        db::request_cancel(&row.uuid, now, &app.pool).await?;
    } else {
        db::request_cancel(&row.uuid, now, &app.pool).await?;
        db::compare_and_set_status(&row.uuid, status, DatasetStatus::Cancelled, now, &app.pool)
            .await?;
    }

    db::fetch_by_uuid(&row.uuid, &app.pool)
        .await?
        .ok_or(IngestError::NotFound)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::app::{App, Limits};
    use crate::convert::Registry;
    use crate::layout::Layout;
    use crate::tokens::TokenSigner;

    struct Harness {
        _tmp: tempfile::TempDir,
        app: App,
        user: AuthedUser,
    }

    async fn harness() -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path());
        layout.ensure().await.unwrap();

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();
        catalog_sql::install_schema(&pool).await.unwrap();
        catalog_sql::users::upsert_login("a@ex.com", "u-1", Utc::now(), &pool)
            .await
            .unwrap();

        let (logs_tx, _logs_rx) = crate::logs::channel();
        let app = App {
            pool,
            layout,
            signer: TokenSigner::new(
                b"test",
                chrono::Duration::hours(24),
                chrono::Duration::days(30),
            ),
            registry: Registry::default(),
            fetchers: crate::fetch::Helpers::default(),
            limits: Limits {
                whole_file_limit: 4096,
                ..Limits::default()
            },
            max_attempts: 2,
            stale_after: chrono::Duration::hours(5),
            logs_tx,
        };
        let user = AuthedUser {
            user_id: "u-1".to_string(),
            email: "a@ex.com".to_string(),
            name: None,
            token_id: "tok".to_string(),
        };
        Harness {
            _tmp: tmp,
            app,
            user,
        }
    }

    fn request(name: &str, convert: bool) -> IngestRequest {
        IngestRequest {
            dataset_name: name.to_string(),
            sensor: SensorKind::Tiff,
            convert,
            is_public: Visibility::OnlyOwner,
            is_downloadable: Visibility::OnlyOwner,
            folder: None,
            tags: vec![],
            description: None,
            team_id: None,
            dataset_identifier: None,
            add_to_existing: false,
        }
    }

    #[tokio::test]
    async fn whole_file_lands_in_the_conversion_queue() {
        let h = harness().await;
        let row = whole_file(&h.app, &h.user, &request("D1", true), "scan.tiff", b"pixels")
            .await
            .unwrap();

        assert_eq!(row.status().unwrap(), DatasetStatus::ConversionQueued);
        assert!(h.app.layout.upload_dir(&row.uuid).join("scan.tiff").exists());
        let files = db::list_files(&row.uuid, &h.app.pool).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size_bytes, 6);
    }

    #[tokio::test]
    async fn convert_false_terminates_at_done() {
        let h = harness().await;
        let row = whole_file(&h.app, &h.user, &request("D1", false), "scan.tiff", b"pixels")
            .await
            .unwrap();
        assert_eq!(row.status().unwrap(), DatasetStatus::Done);
    }

    #[tokio::test]
    async fn oversized_whole_file_is_redirected_to_chunked() {
        let h = harness().await;
        let payload = vec![0u8; 4097];
        let err = whole_file(&h.app, &h.user, &request("D1", true), "big.bin", &payload)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::UseChunked {
                size: 4097,
                limit: 4096
            }
        ));

        let err = whole_file(&h.app, &h.user, &request("D1", true), "empty.bin", b"")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::EmptyFile));
    }

    #[tokio::test]
    async fn zip_uploads_are_expanded_before_queueing() {
        let h = harness().await;

        let mut buf = Vec::new();
        {
            use std::io::Write;
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            let options = zip::write::FileOptions::default();
            writer.start_file("slices/scan_001.tiff", options).unwrap();
            writer.write_all(b"pixels one").unwrap();
            writer.start_file("meta.json", options).unwrap();
            writer.write_all(b"{}").unwrap();
            writer.finish().unwrap();
        }

        let row = whole_file(&h.app, &h.user, &request("Zipped", true), "bundle.zip", &buf)
            .await
            .unwrap();
        assert_eq!(row.status().unwrap(), DatasetStatus::ConversionQueued);

        let dir = h.app.layout.upload_dir(&row.uuid);
        assert!(dir.join("slices/scan_001.tiff").exists());
        assert!(!dir.join("bundle.zip").exists());

        let files = db::list_files(&row.uuid, &h.app.pool).await.unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert!(paths.contains(&"slices/scan_001.tiff"));
        assert!(paths.contains(&"meta.json"));
    }

    #[tokio::test]
    async fn add_to_existing_appends_without_changing_identity() {
        let h = harness().await;
        let first = whole_file(&h.app, &h.user, &request("D2", false), "f1.bin", b"one")
            .await
            .unwrap();

        let mut append = request("ignored", false);
        append.dataset_identifier = Some("D2".to_string());
        append.add_to_existing = true;
        let second = whole_file(&h.app, &h.user, &append, "f2.bin", b"two")
            .await
            .unwrap();

        assert_eq!(second.uuid, first.uuid);
        let files = db::list_files(&first.uuid, &h.app.pool).await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, ["f1.bin", "f2.bin"]);
    }

    #[tokio::test]
    async fn appending_to_someone_elses_dataset_is_forbidden() {
        let h = harness().await;
        whole_file(&h.app, &h.user, &request("D2", false), "f1.bin", b"one")
            .await
            .unwrap();

        catalog_sql::users::upsert_login("b@ex.com", "u-2", Utc::now(), &h.app.pool)
            .await
            .unwrap();
        let intruder = AuthedUser {
            user_id: "u-2".to_string(),
            email: "b@ex.com".to_string(),
            name: None,
            token_id: "tok2".to_string(),
        };

        let mut append = request("ignored", false);
        append.dataset_identifier = Some("D2".to_string());
        append.add_to_existing = true;
        let err = whole_file(&h.app, &intruder, &append, "f2.bin", b"two")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Forbidden));
    }

    #[tokio::test]
    async fn chunked_flow_runs_the_same_postlude() {
        let h = harness().await;
        let payload = b"chunked payload bytes!";
        let (session, dataset) = initiate_chunked(
            &h.app,
            &h.user,
            &request("D3", true),
            "v.bin",
            payload.len() as u64,
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(
            dataset.status().unwrap(),
            DatasetStatus::Uploading,
        );

        // One chunk: the default chunk size far exceeds this payload.
        sessions::write_chunk(
            &h.app.layout,
            &h.app.pool,
            &session.session_id,
            0,
            payload,
            None,
        )
        .await
        .unwrap();

        let row = complete_chunked(&h.app, &h.user, &session.session_id)
            .await
            .unwrap();
        assert_eq!(row.status().unwrap(), DatasetStatus::ConversionQueued);
        assert!(h.app.layout.upload_dir(&row.uuid).join("v.bin").exists());
    }

    #[tokio::test]
    async fn remote_request_queues_a_sync() {
        let h = harness().await;
        let source: RemoteSource = serde_json::from_value(serde_json::json!({
            "source_type": "url",
            "source_config": {"url": "https://data.example.org/run42.tar"},
        }))
        .unwrap();

        let row = remote(&h.app, &h.user, &request("D4", true), &source)
            .await
            .unwrap();
        assert_eq!(row.status().unwrap(), DatasetStatus::SyncQueued);
        assert_eq!(row.remote_source().unwrap().unwrap(), source);
    }

    #[tokio::test]
    async fn cancel_is_direct_when_queued_and_a_noop_when_terminal() {
        let h = harness().await;
        let row = whole_file(&h.app, &h.user, &request("D5", true), "f.bin", b"x")
            .await
            .unwrap();
        assert_eq!(row.status().unwrap(), DatasetStatus::ConversionQueued);

        let cancelled = cancel_dataset(&h.app, &row).await.unwrap();
        assert_eq!(cancelled.status().unwrap(), DatasetStatus::Cancelled);

        // Cancelling again changes nothing.
        let again = cancel_dataset(&h.app, &cancelled).await.unwrap();
        assert_eq!(again.status().unwrap(), DatasetStatus::Cancelled);
    }
}
