use chrono::{DateTime, Utc};
use models::SessionState;

// Row shape of a chunked-upload session.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub session_id: String,
    pub dataset_uuid: String,
    pub filename: String,
    pub total_bytes: i64,
    pub chunk_size_bytes: i64,
    pub total_chunks: i64,
    pub chunk_hashes: Option<String>,
    pub overall_hash: Option<String>,
    pub owner_email: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionRow {
    pub fn state(&self) -> anyhow::Result<SessionState> {
        self.state
            .parse::<SessionState>()
            .map_err(|err| anyhow::anyhow!(err))
    }

    /// Expected per-chunk SHA-256 digests declared at initiation, if any.
    pub fn chunk_hashes(&self) -> anyhow::Result<Option<Vec<String>>> {
        match &self.chunk_hashes {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChunkRow {
    pub session_id: String,
    pub chunk_index: i64,
    pub chunk_hash: Option<String>,
    pub size_bytes: i64,
    pub received_at: DateTime<Utc>,
}

pub struct NewSession<'a> {
    pub session_id: &'a str,
    pub dataset_uuid: &'a str,
    pub filename: &'a str,
    pub total_bytes: i64,
    pub chunk_size_bytes: i64,
    pub total_chunks: i64,
    pub chunk_hashes: Option<&'a [String]>,
    pub overall_hash: Option<&'a str>,
    pub owner_email: &'a str,
    pub expires_at: DateTime<Utc>,
}

pub async fn insert(s: &NewSession<'_>, now: DateTime<Utc>, pool: &sqlx::SqlitePool) -> sqlx::Result<()> {
    let chunk_hashes = s
        .chunk_hashes
        .map(|hashes| serde_json::to_string(hashes).expect("hashes serialize"));

    sqlx::query(
        r#"
        insert into upload_sessions (
            session_id, dataset_uuid, filename, total_bytes, chunk_size_bytes,
            total_chunks, chunk_hashes, overall_hash, owner_email, state,
            created_at, expires_at
        ) values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'open', ?10, ?11)
        "#,
    )
    .bind(s.session_id)
    .bind(s.dataset_uuid)
    .bind(s.filename)
    .bind(s.total_bytes)
    .bind(s.chunk_size_bytes)
    .bind(s.total_chunks)
    .bind(chunk_hashes)
    .bind(s.overall_hash)
    .bind(s.owner_email)
    .bind(now)
    .bind(s.expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch(session_id: &str, pool: &sqlx::SqlitePool) -> sqlx::Result<Option<SessionRow>> {
    sqlx::query_as::<_, SessionRow>("select * from upload_sessions where session_id = ?1")
        .bind(session_id)
        .fetch_optional(pool)
        .await
}

/// Compare-and-set of the session state; gates completion so that two racing
/// `complete` calls cannot both assemble.
pub async fn compare_and_set_state(
    session_id: &str,
    from: SessionState,
    to: SessionState,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<bool> {
    let done = sqlx::query("update upload_sessions set state = ?3 where session_id = ?1 and state = ?2")
        .bind(session_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(pool)
        .await?;
    Ok(done.rows_affected() == 1)
}

/// Record a received chunk. The insert is a no-op when the slot is already
/// recorded; the caller compares hashes to decide between idempotent success
/// and rejection.
pub async fn record_chunk(
    session_id: &str,
    chunk_index: i64,
    chunk_hash: Option<&str>,
    size_bytes: i64,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        insert into session_chunks (session_id, chunk_index, chunk_hash, size_bytes, received_at)
        values (?1, ?2, ?3, ?4, ?5)
        on conflict (session_id, chunk_index) do nothing
        "#,
    )
    .bind(session_id)
    .bind(chunk_index)
    .bind(chunk_hash)
    .bind(size_bytes)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_chunk(
    session_id: &str,
    chunk_index: i64,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<Option<ChunkRow>> {
    sqlx::query_as::<_, ChunkRow>(
        "select * from session_chunks where session_id = ?1 and chunk_index = ?2",
    )
    .bind(session_id)
    .bind(chunk_index)
    .fetch_optional(pool)
    .await
}

pub async fn received_indices(session_id: &str, pool: &sqlx::SqlitePool) -> sqlx::Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "select chunk_index from session_chunks where session_id = ?1 order by chunk_index asc",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(index,)| index).collect())
}

pub async fn received_bytes(session_id: &str, pool: &sqlx::SqlitePool) -> sqlx::Result<i64> {
    let (total,): (i64,) = sqlx::query_as(
        "select coalesce(sum(size_bytes), 0) from session_chunks where session_id = ?1",
    )
    .bind(session_id)
    .fetch_one(pool)
    .await?;
    Ok(total)
}

/// Flip overdue open sessions to `expired`, returning their ids so the
/// caller can garbage-collect the chunk spool.
pub async fn expire_overdue(
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        update upload_sessions set state = 'expired'
        where state = 'open' and expires_at < ?1
        returning session_id
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
