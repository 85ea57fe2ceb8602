use chrono::{DateTime, Duration, Utc};
use models::SessionState;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::layout::Layout;
use catalog_sql::sessions as db;

/// Default chunk size: 100 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 100 << 20;
/// Default ceiling on a single file: 10 TiB.
pub const MAX_FILE_BYTES: u64 = 10 << 40;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("upload session not found")]
    NotFound,
    #[error("upload session is {state}")]
    WrongState { state: SessionState },
    #[error("chunk index {index} is out of range (total {total})")]
    ChunkOutOfRange { index: u64, total: u64 },
    #[error("chunk {index} is {actual} bytes, expected {expected}")]
    ChunkSizeMismatch {
        index: u64,
        expected: u64,
        actual: u64,
    },
    #[error("chunk {index} bytes do not match the declared hash")]
    ChunkHashMismatch { index: u64 },
    #[error("assembled file does not match the declared overall hash")]
    OverallHashMismatch,
    #[error("chunks are missing: {missing:?}")]
    MissingChunks { missing: Vec<u64> },
    #[error("zero-byte files are rejected")]
    EmptyFile,
    #[error("file of {size} bytes exceeds the {max} byte limit")]
    FileTooLarge { size: u64, max: u64 },
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// ceil(total / chunk_size); a file of exactly `chunk_size` bytes is one
/// chunk, one byte more is two.
pub fn chunk_count(total_bytes: u64, chunk_size: u64) -> u64 {
    total_bytes.div_ceil(chunk_size)
}

/// Length of chunk `index`: full `chunk_size` everywhere but the tail.
pub fn expected_chunk_len(total_bytes: u64, chunk_size: u64, index: u64) -> u64 {
    let start = index * chunk_size;
    chunk_size.min(total_bytes - start)
}

pub struct InitiateSession<'a> {
    pub dataset_uuid: &'a str,
    pub filename: &'a str,
    pub total_bytes: u64,
    pub chunk_size: u64,
    pub overall_hash: Option<&'a str>,
    pub chunk_hashes: Option<&'a [String]>,
    pub owner_email: &'a str,
    pub ttl: Duration,
}

/// Open a session and its chunk spool.
pub async fn initiate(
    layout: &Layout,
    pool: &sqlx::SqlitePool,
    params: InitiateSession<'_>,
) -> Result<db::SessionRow, SessionError> {
    if params.total_bytes == 0 {
        return Err(SessionError::EmptyFile);
    }
    if params.total_bytes > MAX_FILE_BYTES {
        return Err(SessionError::FileTooLarge {
            size: params.total_bytes,
            max: MAX_FILE_BYTES,
        });
    }

    let now = Utc::now();
    let session_id = uuid::Uuid::new_v4().to_string();
    let filename = sanitize_filename(params.filename);
    let total_chunks = chunk_count(params.total_bytes, params.chunk_size);

    db::insert(
        &db::NewSession {
            session_id: &session_id,
            dataset_uuid: params.dataset_uuid,
            filename: &filename,
            total_bytes: params.total_bytes as i64,
            chunk_size_bytes: params.chunk_size as i64,
            total_chunks: total_chunks as i64,
            chunk_hashes: params.chunk_hashes,
            overall_hash: params.overall_hash,
            owner_email: params.owner_email,
            expires_at: now + params.ttl,
        },
        now,
        pool,
    )
    .await?;
    tokio::fs::create_dir_all(layout.spool_dir(&session_id)).await?;

    db::fetch(&session_id, pool)
        .await?
        .ok_or(SessionError::Storage(sqlx::Error::RowNotFound))
}

#[derive(Debug)]
pub struct ChunkReceipt {
    pub received: u64,
    pub total: u64,
    /// True when this chunk was already on disk with identical bytes.
    pub duplicate: bool,
}

/// Write one chunk into its spool slot. The write is atomic (temp file +
/// rename); mismatched hashes are rejected without marking the chunk
/// received; replaying an identical chunk is a no-op.
pub async fn write_chunk(
    layout: &Layout,
    pool: &sqlx::SqlitePool,
    session_id: &str,
    index: u64,
    bytes: &[u8],
    declared_hash: Option<&str>,
) -> Result<ChunkReceipt, SessionError> {
    let session = fetch_open(pool, session_id).await?;

    let total = session.total_chunks as u64;
    if index >= total {
        return Err(SessionError::ChunkOutOfRange { index, total });
    }

    let expected = expected_chunk_len(
        session.total_bytes as u64,
        session.chunk_size_bytes as u64,
        index,
    );
    if bytes.len() as u64 != expected {
        return Err(SessionError::ChunkSizeMismatch {
            index,
            expected,
            actual: bytes.len() as u64,
        });
    }

    let computed = hex::encode(Sha256::digest(bytes));
    if let Some(declared) = declared_hash {
        if !declared.eq_ignore_ascii_case(&computed) {
            return Err(SessionError::ChunkHashMismatch { index });
        }
    }
    if let Some(expected_hashes) = session.chunk_hashes().ok().flatten() {
        match expected_hashes.get(index as usize) {
            Some(expected) if expected.eq_ignore_ascii_case(&computed) => {}
            _ => return Err(SessionError::ChunkHashMismatch { index }),
        }
    }

    if let Some(prior) = db::fetch_chunk(session_id, index as i64, pool).await? {
        if prior.chunk_hash.as_deref() == Some(computed.as_str()) {
            let received = db::received_indices(session_id, pool).await?.len() as u64;
            return Ok(ChunkReceipt {
                received,
                total,
                duplicate: true,
            });
        }
        // Same slot, different bytes: refuse rather than silently replace.
        return Err(SessionError::ChunkHashMismatch { index });
    }

    let slot = layout.chunk_path(session_id, index);
    tokio::fs::create_dir_all(layout.spool_dir(session_id)).await?;
    let part = slot.with_extension(format!("part-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&part, bytes).await?;
    tokio::fs::rename(&part, &slot).await?;

    db::record_chunk(
        session_id,
        index as i64,
        Some(&computed),
        bytes.len() as i64,
        Utc::now(),
        pool,
    )
    .await?;

    let received = db::received_indices(session_id, pool).await?.len() as u64;
    Ok(ChunkReceipt {
        received,
        total,
        duplicate: false,
    })
}

#[derive(Debug, serde::Serialize)]
pub struct ResumeInfo {
    pub missing_chunks: Vec<u64>,
    pub received_chunks: Vec<u64>,
    pub total_chunks: u64,
    pub bytes_received: u64,
    pub total_bytes: u64,
    pub expires_at: DateTime<Utc>,
    pub state: SessionState,
}

pub async fn resume_info(
    pool: &sqlx::SqlitePool,
    session_id: &str,
) -> Result<ResumeInfo, SessionError> {
    let session = db::fetch(session_id, pool)
        .await?
        .ok_or(SessionError::NotFound)?;
    let state = session.state().map_err(|_| SessionError::NotFound)?;

    let received = db::received_indices(session_id, pool).await?;
    let received: Vec<u64> = received.into_iter().map(|i| i as u64).collect();
    let missing: Vec<u64> = (0..session.total_chunks as u64)
        .filter(|index| !received.contains(index))
        .collect();

    Ok(ResumeInfo {
        missing_chunks: missing,
        received_chunks: received,
        total_chunks: session.total_chunks as u64,
        bytes_received: db::received_bytes(session_id, pool).await? as u64,
        total_bytes: session.total_bytes as u64,
        expires_at: session.expires_at,
        state,
    })
}

#[derive(Debug)]
pub struct AssembledUpload {
    pub dataset_uuid: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub final_path: PathBuf,
}

/// Complete a session: gate on CAS open -> completing, verify every chunk is
/// present, stream a SHA-256 over the chunks in index order, compare the
/// declared overall hash, and move the assembly into the dataset's file area.
pub async fn complete(
    layout: &Layout,
    pool: &sqlx::SqlitePool,
    session_id: &str,
) -> Result<AssembledUpload, SessionError> {
    let session = fetch_open(pool, session_id).await?;

    if !db::compare_and_set_state(session_id, SessionState::Open, SessionState::Completing, pool)
        .await?
    {
        let state = db::fetch(session_id, pool)
            .await?
            .ok_or(SessionError::NotFound)?
            .state()
            .unwrap_or(SessionState::Aborted);
        return Err(SessionError::WrongState { state });
    }

    // From here on, failures revert completing -> open so the client can
    // re-upload chunks and try again.
    let outcome: Result<AssembledUpload, SessionError> = async {
        let assembled = assemble(layout, pool, &session).await?;
        catalog_sql::datasets::append_file(
            &session.dataset_uuid,
            &session.filename,
            &session.filename,
            assembled.size_bytes as i64,
            Utc::now(),
            pool,
        )
        .await?;
        Ok(assembled)
    }
    .await;

    match outcome {
        Ok(assembled) => {
            db::compare_and_set_state(
                session_id,
                SessionState::Completing,
                SessionState::Complete,
                pool,
            )
            .await?;
            let _ = tokio::fs::remove_dir_all(layout.spool_dir(session_id)).await;
            Ok(assembled)
        }
        Err(err) => {
            db::compare_and_set_state(
                session_id,
                SessionState::Completing,
                SessionState::Open,
                pool,
            )
            .await?;
            Err(err)
        }
    }
}

async fn assemble(
    layout: &Layout,
    pool: &sqlx::SqlitePool,
    session: &db::SessionRow,
) -> Result<AssembledUpload, SessionError> {
    let total = session.total_chunks as u64;
    let received = db::received_indices(&session.session_id, pool).await?;
    let received: Vec<u64> = received.into_iter().map(|i| i as u64).collect();
    let missing: Vec<u64> = (0..total).filter(|i| !received.contains(i)).collect();
    if !missing.is_empty() {
        return Err(SessionError::MissingChunks { missing });
    }

    let assembly_path = layout.spool_dir(&session.session_id).join("assembled.part");
    let mut out = tokio::fs::File::create(&assembly_path).await?;
    let mut hasher = Sha256::new();
    let mut size_bytes = 0u64;
    let mut buffer = vec![0u8; 256 << 10];

    for index in 0..total {
        let mut chunk = tokio::fs::File::open(layout.chunk_path(&session.session_id, index)).await?;
        loop {
            let n = chunk.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            out.write_all(&buffer[..n]).await?;
            size_bytes += n as u64;
        }
    }
    out.flush().await?;
    drop(out);

    let sha256 = hex::encode(hasher.finalize());
    if let Some(declared) = &session.overall_hash {
        if !declared.eq_ignore_ascii_case(&sha256) {
            return Err(SessionError::OverallHashMismatch);
        }
    }

    let dest_dir = layout.upload_dir(&session.dataset_uuid);
    tokio::fs::create_dir_all(&dest_dir).await?;
    let final_path = dest_dir.join(&session.filename);
    tokio::fs::rename(&assembly_path, &final_path).await?;

    Ok(AssembledUpload {
        dataset_uuid: session.dataset_uuid.clone(),
        filename: session.filename.clone(),
        size_bytes,
        sha256,
        final_path,
    })
}

/// Abort an open session and discard its spool.
pub async fn abort(
    layout: &Layout,
    pool: &sqlx::SqlitePool,
    session_id: &str,
) -> Result<(), SessionError> {
    let session = db::fetch(session_id, pool)
        .await?
        .ok_or(SessionError::NotFound)?;
    let state = session.state().unwrap_or(SessionState::Aborted);

    if !db::compare_and_set_state(session_id, SessionState::Open, SessionState::Aborted, pool)
        .await?
    {
        return Err(SessionError::WrongState { state });
    }
    let _ = tokio::fs::remove_dir_all(layout.spool_dir(session_id)).await;
    Ok(())
}

/// Expire overdue sessions and garbage-collect their spools. Returns how many
/// sessions were swept.
pub async fn gc_expired(
    layout: &Layout,
    pool: &sqlx::SqlitePool,
    now: DateTime<Utc>,
) -> Result<usize, SessionError> {
    let expired = db::expire_overdue(now, pool).await?;
    for session_id in &expired {
        let _ = tokio::fs::remove_dir_all(layout.spool_dir(session_id)).await;
    }
    Ok(expired.len())
}

async fn fetch_open(
    pool: &sqlx::SqlitePool,
    session_id: &str,
) -> Result<db::SessionRow, SessionError> {
    let session = db::fetch(session_id, pool)
        .await?
        .ok_or(SessionError::NotFound)?;
    let state = session.state().unwrap_or(SessionState::Aborted);
    if state != SessionState::Open {
        return Err(SessionError::WrongState { state });
    }
    if Utc::now() >= session.expires_at {
        db::compare_and_set_state(session_id, SessionState::Open, SessionState::Expired, pool)
            .await?;
        return Err(SessionError::WrongState {
            state: SessionState::Expired,
        });
    }
    Ok(session)
}

/// Reduce a client-supplied filename to its final path component.
pub fn sanitize_filename(raw: &str) -> String {
    let name = std::path::Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.bin");
    if name.is_empty() || name == "." || name == ".." {
        "upload.bin".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Harness {
        _tmp: tempfile::TempDir,
        layout: Layout,
        pool: sqlx::SqlitePool,
        dataset_uuid: String,
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
        let dataset_uuid = uuid::Uuid::new_v4().to_string();
        catalog_sql::datasets::insert(
            &catalog_sql::datasets::NewDataset {
                uuid: &dataset_uuid,
                name: "chunked",
                slug: "a-chunked-2024",
                numeric_id: catalog_sql::datasets::mint_numeric_id(&pool).await.unwrap(),
                owner_email: "a@ex.com",
                team_id: None,
                sensor_kind: models::SensorKind::Hdf5,
                convert: true,
                is_public: models::Visibility::OnlyOwner,
                is_downloadable: models::Visibility::OnlyOwner,
                status: models::DatasetStatus::Uploading,
                folder: None,
                tags: &[],
                description: None,
                remote_source: None,
            },
            Utc::now(),
            &pool,
        )
        .await
        .unwrap();

        Harness {
            _tmp: tmp,
            layout,
            pool,
            dataset_uuid,
        }
    }

    fn sha(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    #[test]
    fn chunk_count_boundaries() {
        assert_eq!(chunk_count(1, 4), 1);
        assert_eq!(chunk_count(4, 4), 1);
        assert_eq!(chunk_count(5, 4), 2);
        assert_eq!(expected_chunk_len(5, 4, 0), 4);
        assert_eq!(expected_chunk_len(5, 4, 1), 1);
        assert_eq!(expected_chunk_len(4, 4, 0), 4);
    }

    #[tokio::test]
    async fn zero_byte_files_are_rejected_at_initiation() {
        let h = harness().await;
        let err = initiate(
            &h.layout,
            &h.pool,
            InitiateSession {
                dataset_uuid: &h.dataset_uuid,
                filename: "empty.bin",
                total_bytes: 0,
                chunk_size: 4,
                overall_hash: None,
                chunk_hashes: None,
                owner_email: "a@ex.com",
                ttl: Duration::hours(1),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SessionError::EmptyFile));
    }

    #[tokio::test]
    async fn out_of_order_chunks_assemble_in_index_order() {
        let h = harness().await;
        let payload = b"the quick brown fox jumps over the lazy dog";
        let chunk_size = 16u64;

        let session = initiate(
            &h.layout,
            &h.pool,
            InitiateSession {
                dataset_uuid: &h.dataset_uuid,
                filename: "fox.txt",
                total_bytes: payload.len() as u64,
                chunk_size,
                overall_hash: Some(&sha(payload)),
                chunk_hashes: None,
                owner_email: "a@ex.com",
                ttl: Duration::hours(1),
            },
        )
        .await
        .unwrap();
        assert_eq!(session.total_chunks, 3);

        // Arrive out of order: 2, 0, 1.
        for index in [2u64, 0, 1] {
            let start = (index * chunk_size) as usize;
            let end = payload.len().min(start + chunk_size as usize);
            let receipt = write_chunk(
                &h.layout,
                &h.pool,
                &session.session_id,
                index,
                &payload[start..end],
                None,
            )
            .await
            .unwrap();
            assert!(!receipt.duplicate);
        }

        let assembled = complete(&h.layout, &h.pool, &session.session_id)
            .await
            .unwrap();
        assert_eq!(assembled.size_bytes, payload.len() as u64);
        assert_eq!(assembled.sha256, sha(payload));

        let on_disk = std::fs::read(&assembled.final_path).unwrap();
        assert_eq!(on_disk, payload);

        // The spool is gone and the file is recorded on the dataset.
        assert!(!h.layout.spool_dir(&session.session_id).exists());
        let files = catalog_sql::datasets::list_files(&h.dataset_uuid, &h.pool)
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "fox.txt");
        assert_eq!(files[0].size_bytes, payload.len() as i64);
    }

    #[tokio::test]
    async fn resume_info_shrinks_as_chunks_arrive() {
        let h = harness().await;
        let payload = vec![7u8; 10];
        let session = initiate(
            &h.layout,
            &h.pool,
            InitiateSession {
                dataset_uuid: &h.dataset_uuid,
                filename: "v.bin",
                total_bytes: 10,
                chunk_size: 4,
                overall_hash: None,
                chunk_hashes: None,
                owner_email: "a@ex.com",
                ttl: Duration::hours(1),
            },
        )
        .await
        .unwrap();

        let mut last_missing = 4usize;
        for (index, range) in [(0u64, 0..4), (2, 8..10), (1, 4..8)] {
            write_chunk(
                &h.layout,
                &h.pool,
                &session.session_id,
                index,
                &payload[range],
                None,
            )
            .await
            .unwrap();
            let info = resume_info(&h.pool, &session.session_id).await.unwrap();
            assert!(info.missing_chunks.len() < last_missing);
            last_missing = info.missing_chunks.len();
        }
        assert_eq!(last_missing, 0);
    }

    #[tokio::test]
    async fn duplicate_chunks_are_idempotent_and_conflicts_rejected() {
        let h = harness().await;
        let session = initiate(
            &h.layout,
            &h.pool,
            InitiateSession {
                dataset_uuid: &h.dataset_uuid,
                filename: "v.bin",
                total_bytes: 8,
                chunk_size: 4,
                overall_hash: None,
                chunk_hashes: None,
                owner_email: "a@ex.com",
                ttl: Duration::hours(1),
            },
        )
        .await
        .unwrap();

        write_chunk(&h.layout, &h.pool, &session.session_id, 0, b"aaaa", None)
            .await
            .unwrap();
        let replay = write_chunk(&h.layout, &h.pool, &session.session_id, 0, b"aaaa", None)
            .await
            .unwrap();
        assert!(replay.duplicate);
        assert_eq!(replay.received, 1);

        let err = write_chunk(&h.layout, &h.pool, &session.session_id, 0, b"bbbb", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ChunkHashMismatch { index: 0 }));
    }

    #[tokio::test]
    async fn declared_chunk_hash_is_enforced() {
        let h = harness().await;
        let session = initiate(
            &h.layout,
            &h.pool,
            InitiateSession {
                dataset_uuid: &h.dataset_uuid,
                filename: "v.bin",
                total_bytes: 4,
                chunk_size: 4,
                overall_hash: None,
                chunk_hashes: None,
                owner_email: "a@ex.com",
                ttl: Duration::hours(1),
            },
        )
        .await
        .unwrap();

        let err = write_chunk(
            &h.layout,
            &h.pool,
            &session.session_id,
            0,
            b"aaaa",
            Some(&sha(b"bbbb")),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SessionError::ChunkHashMismatch { index: 0 }));

        // The mismatching chunk was not marked received.
        let info = resume_info(&h.pool, &session.session_id).await.unwrap();
        assert_eq!(info.missing_chunks, vec![0]);
    }

    #[tokio::test]
    async fn completion_requires_every_chunk() {
        let h = harness().await;
        let session = initiate(
            &h.layout,
            &h.pool,
            InitiateSession {
                dataset_uuid: &h.dataset_uuid,
                filename: "v.bin",
                total_bytes: 8,
                chunk_size: 4,
                overall_hash: None,
                chunk_hashes: None,
                owner_email: "a@ex.com",
                ttl: Duration::hours(1),
            },
        )
        .await
        .unwrap();
        write_chunk(&h.layout, &h.pool, &session.session_id, 1, b"bbbb", None)
            .await
            .unwrap();

        let err = complete(&h.layout, &h.pool, &session.session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::MissingChunks { ref missing } if missing == &[0]));

        // The gate reverted: uploading the hole and retrying succeeds.
        write_chunk(&h.layout, &h.pool, &session.session_id, 0, b"aaaa", None)
            .await
            .unwrap();
        complete(&h.layout, &h.pool, &session.session_id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn overall_hash_mismatch_reverts_the_gate() {
        let h = harness().await;
        let session = initiate(
            &h.layout,
            &h.pool,
            InitiateSession {
                dataset_uuid: &h.dataset_uuid,
                filename: "v.bin",
                total_bytes: 4,
                chunk_size: 4,
                overall_hash: Some(&sha(b"not these bytes")),
                chunk_hashes: None,
                owner_email: "a@ex.com",
                ttl: Duration::hours(1),
            },
        )
        .await
        .unwrap();
        write_chunk(&h.layout, &h.pool, &session.session_id, 0, b"aaaa", None)
            .await
            .unwrap();

        let err = complete(&h.layout, &h.pool, &session.session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::OverallHashMismatch));

        let info = resume_info(&h.pool, &session.session_id).await.unwrap();
        assert_eq!(info.state, SessionState::Open);
    }

    #[tokio::test]
    async fn completed_sessions_refuse_further_writes() {
        let h = harness().await;
        let session = initiate(
            &h.layout,
            &h.pool,
            InitiateSession {
                dataset_uuid: &h.dataset_uuid,
                filename: "v.bin",
                total_bytes: 4,
                chunk_size: 4,
                overall_hash: None,
                chunk_hashes: None,
                owner_email: "a@ex.com",
                ttl: Duration::hours(1),
            },
        )
        .await
        .unwrap();
        write_chunk(&h.layout, &h.pool, &session.session_id, 0, b"aaaa", None)
            .await
            .unwrap();
        complete(&h.layout, &h.pool, &session.session_id)
            .await
            .unwrap();

        let err = write_chunk(&h.layout, &h.pool, &session.session_id, 0, b"aaaa", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::WrongState {
                state: SessionState::Complete
            }
        ));
    }

    #[tokio::test]
    async fn aborted_sessions_drop_their_spool() {
        let h = harness().await;
        let session = initiate(
            &h.layout,
            &h.pool,
            InitiateSession {
                dataset_uuid: &h.dataset_uuid,
                filename: "v.bin",
                total_bytes: 8,
                chunk_size: 4,
                overall_hash: None,
                chunk_hashes: None,
                owner_email: "a@ex.com",
                ttl: Duration::hours(1),
            },
        )
        .await
        .unwrap();
        write_chunk(&h.layout, &h.pool, &session.session_id, 0, b"aaaa", None)
            .await
            .unwrap();

        abort(&h.layout, &h.pool, &session.session_id).await.unwrap();
        assert!(!h.layout.spool_dir(&session.session_id).exists());

        let err = abort(&h.layout, &h.pool, &session.session_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::WrongState {
                state: SessionState::Aborted
            }
        ));
    }

    #[tokio::test]
    async fn filenames_are_reduced_to_their_basename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("scan.tiff"), "scan.tiff");
        assert_eq!(sanitize_filename(""), "upload.bin");
    }
}
