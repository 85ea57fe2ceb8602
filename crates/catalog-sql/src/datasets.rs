use chrono::{DateTime, Utc};
use models::{DatasetStatus, RemoteSource, SensorKind, Visibility};

// Row shape of the authoritative dataset record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DatasetRow {
    pub uuid: String,
    pub name: String,
    pub slug: String,
    pub numeric_id: i64,
    pub owner_email: String,
    pub team_id: Option<String>,
    pub sensor_kind: String,
    pub convert: bool,
    pub is_public: String,
    pub is_downloadable: String,
    pub status: String,
    pub folder: Option<String>,
    pub tags: String,
    pub description: Option<String>,
    pub data_size_gb: Option<f64>,
    pub remote_source: Option<String>,
    pub error_message: Option<String>,
    pub conversion_attempts: i64,
    pub conversion_seconds: Option<f64>,
    pub cancel_requested: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DatasetRow {
    pub fn status(&self) -> anyhow::Result<DatasetStatus> {
        self.status
            .parse::<DatasetStatus>()
            .map_err(|err| anyhow::anyhow!(err))
    }

    pub fn sensor(&self) -> anyhow::Result<SensorKind> {
        self.sensor_kind
            .parse::<SensorKind>()
            .map_err(|err| anyhow::anyhow!(err))
    }

    pub fn is_public(&self) -> Visibility {
        self.is_public.parse().unwrap_or_default()
    }

    pub fn is_downloadable(&self) -> Visibility {
        self.is_downloadable.parse().unwrap_or_default()
    }

    pub fn tags(&self) -> Vec<String> {
        serde_json::from_str(&self.tags).unwrap_or_default()
    }

    pub fn remote_source(&self) -> anyhow::Result<Option<RemoteSource>> {
        match &self.remote_source {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
        }
    }
}

// File entry within a dataset. `files[]` is append-only while the dataset is
// ingesting; re-ingesting the same relative path refreshes its entry so that
// at-least-once completions stay idempotent.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileRow {
    pub dataset_uuid: String,
    pub relative_path: String,
    pub filename: String,
    pub size_bytes: i64,
    pub uploaded_at: DateTime<Utc>,
}

pub struct NewDataset<'a> {
    pub uuid: &'a str,
    pub name: &'a str,
    pub slug: &'a str,
    pub numeric_id: i64,
    pub owner_email: &'a str,
    pub team_id: Option<&'a str>,
    pub sensor_kind: SensorKind,
    pub convert: bool,
    pub is_public: Visibility,
    pub is_downloadable: Visibility,
    pub status: DatasetStatus,
    pub folder: Option<&'a str>,
    pub tags: &'a [String],
    pub description: Option<&'a str>,
    pub remote_source: Option<&'a RemoteSource>,
}

pub async fn insert(d: &NewDataset<'_>, now: DateTime<Utc>, pool: &sqlx::SqlitePool) -> sqlx::Result<()> {
    let tags = serde_json::to_string(d.tags).unwrap_or_else(|_| "[]".to_string());
    let remote_source = d
        .remote_source
        .map(|s| serde_json::to_string(s).expect("remote source serializes"));

    sqlx::query(
        r#"
        insert into datasets (
            uuid, name, slug, numeric_id, owner_email, team_id, sensor_kind,
            convert, is_public, is_downloadable, status, folder, tags,
            description, remote_source, created_at, updated_at
        ) values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)
        "#,
    )
    .bind(d.uuid)
    .bind(d.name)
    .bind(d.slug)
    .bind(d.numeric_id)
    .bind(d.owner_email)
    .bind(d.team_id)
    .bind(d.sensor_kind.as_str())
    .bind(d.convert)
    .bind(d.is_public.as_str())
    .bind(d.is_downloadable.as_str())
    .bind(d.status.as_str())
    .bind(d.folder)
    .bind(tags)
    .bind(d.description)
    .bind(remote_source)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Which unique column a constraint violation named, if any. Used by the
/// resolver to retry numeric-id collisions without masking name conflicts.
pub fn unique_violation_column(err: &sqlx::Error) -> Option<&str> {
    let sqlx::Error::Database(db) = err else {
        return None;
    };
    let message = db.message();
    let needle = "UNIQUE constraint failed: ";
    let start = message.find(needle)? + needle.len();
    Some(message[start..].split(',').next().unwrap_or("").trim())
}

/// Mint the next numeric id from the monotonic counter. Uniqueness collisions
/// (a manually assigned id, say) surface on insert and the caller re-mints.
pub async fn mint_numeric_id(pool: &sqlx::SqlitePool) -> sqlx::Result<i64> {
    sqlx::query("insert into counters (name, value) values ('dataset_numeric_id', ?1) on conflict (name) do nothing")
        .bind(models::NUMERIC_ID_MIN - 1)
        .execute(pool)
        .await?;

    let (value,): (i64,) = sqlx::query_as(
        "update counters set value = value + 1 where name = 'dataset_numeric_id' returning value",
    )
    .fetch_one(pool)
    .await?;

    if value > models::NUMERIC_ID_MAX {
        return Err(sqlx::Error::Protocol(
            "numeric dataset id space is exhausted".into(),
        ));
    }
    Ok(value)
}

pub async fn fetch_by_uuid(uuid: &str, pool: &sqlx::SqlitePool) -> sqlx::Result<Option<DatasetRow>> {
    sqlx::query_as::<_, DatasetRow>("select * from datasets where uuid = ?1")
        .bind(uuid)
        .fetch_optional(pool)
        .await
}

pub async fn fetch_by_slug(slug: &str, pool: &sqlx::SqlitePool) -> sqlx::Result<Option<DatasetRow>> {
    sqlx::query_as::<_, DatasetRow>("select * from datasets where slug = ?1")
        .bind(slug)
        .fetch_optional(pool)
        .await
}

pub async fn fetch_by_numeric_id(
    numeric_id: i64,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<Option<DatasetRow>> {
    sqlx::query_as::<_, DatasetRow>("select * from datasets where numeric_id = ?1")
        .bind(numeric_id)
        .fetch_optional(pool)
        .await
}

/// Name lookup, owner-scoped when the owner is known. The global variant
/// returns at most two rows so the caller can detect ambiguity.
pub async fn fetch_by_name(
    name: &str,
    owner_email: Option<&str>,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<Vec<DatasetRow>> {
    match owner_email {
        Some(owner) => {
            sqlx::query_as::<_, DatasetRow>(
                "select * from datasets where owner_email = ?1 and name = ?2",
            )
            .bind(owner)
            .bind(name)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, DatasetRow>("select * from datasets where name = ?1 limit 2")
                .bind(name)
                .fetch_all(pool)
                .await
        }
    }
}

pub async fn slug_exists(slug: &str, pool: &sqlx::SqlitePool) -> sqlx::Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("select 1 from datasets where slug = ?1")
        .bind(slug)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

pub async fn list_by_owner(
    owner_email: &str,
    status: Option<DatasetStatus>,
    limit: i64,
    offset: i64,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<Vec<DatasetRow>> {
    match status {
        Some(status) => {
            sqlx::query_as::<_, DatasetRow>(
                r#"
                select * from datasets where owner_email = ?1 and status = ?2
                order by updated_at desc limit ?3 offset ?4
                "#,
            )
            .bind(owner_email)
            .bind(status.as_str())
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, DatasetRow>(
                r#"
                select * from datasets where owner_email = ?1
                order by updated_at desc limit ?2 offset ?3
                "#,
            )
            .bind(owner_email)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
    }
}

/// The single write path for the dataset `status` field. Succeeds only when
/// the stored status still equals `from`; a false return is the StaleState
/// signal of the state machine.
pub async fn compare_and_set_status(
    uuid: &str,
    from: DatasetStatus,
    to: DatasetStatus,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<bool> {
    debug_assert!(
        from.can_transition_to(to),
        "illegal status transition {from} -> {to}"
    );
    let done = sqlx::query(
        "update datasets set status = ?3, updated_at = ?4 where uuid = ?1 and status = ?2",
    )
    .bind(uuid)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(now)
    .execute(pool)
    .await?;
    Ok(done.rows_affected() == 1)
}

/// Compare-and-set into an error status, recording the failure message.
pub async fn fail_status(
    uuid: &str,
    from: DatasetStatus,
    to: DatasetStatus,
    error_message: &str,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<bool> {
    debug_assert!(
        from.can_transition_to(to),
        "illegal status transition {from} -> {to}"
    );
    let done = sqlx::query(
        r#"
        update datasets set status = ?3, error_message = ?4, claimed_at = null, updated_at = ?5
        where uuid = ?1 and status = ?2
        "#,
    )
    .bind(uuid)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(error_message)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(done.rows_affected() == 1)
}

/// Next claimable dataset in the given queued status, oldest first.
pub async fn next_queued(
    status: DatasetStatus,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
        "select uuid from datasets where status = ?1 order by updated_at asc limit 1",
    )
    .bind(status.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(uuid,)| uuid))
}

/// Claim a queued conversion: CAS `conversion_queued -> converting`, stamping
/// the claim time and burning one attempt. At most one racing worker wins.
pub async fn claim_conversion(
    uuid: &str,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<bool> {
    let done = sqlx::query(
        r#"
        update datasets set
            status = 'converting',
            claimed_at = ?2,
            conversion_attempts = conversion_attempts + 1,
            updated_at = ?2
        where uuid = ?1 and status = 'conversion_queued'
        "#,
    )
    .bind(uuid)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(done.rows_affected() == 1)
}

/// Claim a queued remote-source fetch: CAS `sync_queued -> syncing`.
pub async fn claim_sync(
    uuid: &str,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<bool> {
    let done = sqlx::query(
        r#"
        update datasets set status = 'syncing', claimed_at = ?2, updated_at = ?2
        where uuid = ?1 and status = 'sync_queued'
        "#,
    )
    .bind(uuid)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(done.rows_affected() == 1)
}

/// Publish a finished conversion: CAS `converting -> done`, recording the
/// attempt duration and clearing the claim and any prior error.
pub async fn publish_done(
    uuid: &str,
    conversion_seconds: f64,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<bool> {
    let done = sqlx::query(
        r#"
        update datasets set
            status = 'done',
            conversion_seconds = ?2,
            error_message = null,
            claimed_at = null,
            updated_at = ?3
        where uuid = ?1 and status = 'converting'
        "#,
    )
    .bind(uuid)
    .bind(conversion_seconds)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(done.rows_affected() == 1)
}

/// Requeue conversions whose worker stopped heartbeating: any `converting`
/// row claimed before `stale_before` goes back to `conversion_queued`.
/// Returns the rescued uuids.
pub async fn requeue_stale(
    stale_before: DateTime<Utc>,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        update datasets set status = 'conversion_queued', claimed_at = null, updated_at = ?2
        where status = 'converting' and claimed_at is not null and claimed_at < ?1
        returning uuid
        "#,
    )
    .bind(stale_before)
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(uuid,)| uuid).collect())
}

/// Set the cancellation flag on a non-terminal dataset. The running worker
/// observes the flag between steps; queued datasets are cancelled directly by
/// the caller via CAS.
pub async fn request_cancel(
    uuid: &str,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<bool> {
    let done = sqlx::query(
        r#"
        update datasets set cancel_requested = 1, updated_at = ?2
        where uuid = ?1 and status not in ('done', 'conversion_failed', 'cancelled')
        "#,
    )
    .bind(uuid)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(done.rows_affected() == 1)
}

pub async fn cancel_requested(uuid: &str, pool: &sqlx::SqlitePool) -> sqlx::Result<bool> {
    let row: Option<(bool,)> = sqlx::query_as("select cancel_requested from datasets where uuid = ?1")
        .bind(uuid)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(flag,)| flag).unwrap_or(false))
}

pub async fn append_file(
    dataset_uuid: &str,
    relative_path: &str,
    filename: &str,
    size_bytes: i64,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        insert into dataset_files (dataset_uuid, relative_path, filename, size_bytes, uploaded_at)
        values (?1, ?2, ?3, ?4, ?5)
        on conflict (dataset_uuid, relative_path) do update set
            filename = excluded.filename,
            size_bytes = excluded.size_bytes,
            uploaded_at = excluded.uploaded_at
        "#,
    )
    .bind(dataset_uuid)
    .bind(relative_path)
    .bind(filename)
    .bind(size_bytes)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_files(dataset_uuid: &str, pool: &sqlx::SqlitePool) -> sqlx::Result<Vec<FileRow>> {
    sqlx::query_as::<_, FileRow>(
        "select * from dataset_files where dataset_uuid = ?1 order by uploaded_at asc, relative_path asc",
    )
    .bind(dataset_uuid)
    .fetch_all(pool)
    .await
}

pub async fn set_remote_source(
    uuid: &str,
    source: &RemoteSource,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<()> {
    let raw = serde_json::to_string(source).expect("remote source serializes");
    sqlx::query("update datasets set remote_source = ?2, updated_at = ?3 where uuid = ?1")
        .bind(uuid)
        .bind(raw)
        .bind(now)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn file_bytes_total(dataset_uuid: &str, pool: &sqlx::SqlitePool) -> sqlx::Result<i64> {
    let (total,): (i64,) = sqlx::query_as(
        "select coalesce(sum(size_bytes), 0) from dataset_files where dataset_uuid = ?1",
    )
    .bind(dataset_uuid)
    .fetch_one(pool)
    .await?;
    Ok(total)
}

/// Datasets that reached a terminal state without an aggregate size yet; the
/// reconciler fills these in.
pub async fn missing_data_size(pool: &sqlx::SqlitePool) -> sqlx::Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        select uuid from datasets
        where data_size_gb is null and status in ('done', 'conversion_failed')
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(uuid,)| uuid).collect())
}

pub async fn set_data_size(
    uuid: &str,
    data_size_gb: f64,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<()> {
    sqlx::query("update datasets set data_size_gb = ?2 where uuid = ?1")
        .bind(uuid)
        .bind(data_size_gb)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_pool;
    use models::DatasetStatus::*;

    async fn seed(pool: &sqlx::SqlitePool) -> String {
        crate::users::upsert_login("a@ex.com", "u-1", Utc::now(), pool)
            .await
            .unwrap();
        let numeric_id = mint_numeric_id(pool).await.unwrap();
        let uuid = uuid::Uuid::new_v4().to_string();
        insert(
            &NewDataset {
                uuid: &uuid,
                name: "My Data",
                slug: "a-my-data-2024",
                numeric_id,
                owner_email: "a@ex.com",
                team_id: None,
                sensor_kind: models::SensorKind::Tiff,
                convert: true,
                is_public: models::Visibility::OnlyOwner,
                is_downloadable: models::Visibility::OnlyOwner,
                status: Submitted,
                folder: None,
                tags: &["beamline".to_string()],
                description: Some("fixture"),
                remote_source: None,
            },
            Utc::now(),
            pool,
        )
        .await
        .unwrap();
        uuid
    }

    #[tokio::test]
    async fn all_four_identifiers_resolve_to_the_same_record() {
        let pool = test_pool().await;
        let uuid = seed(&pool).await;

        let by_uuid = fetch_by_uuid(&uuid, &pool).await.unwrap().unwrap();
        let by_slug = fetch_by_slug("a-my-data-2024", &pool).await.unwrap().unwrap();
        let by_numeric = fetch_by_numeric_id(by_uuid.numeric_id, &pool)
            .await
            .unwrap()
            .unwrap();
        let by_name = fetch_by_name("My Data", Some("a@ex.com"), &pool)
            .await
            .unwrap();

        assert_eq!(by_slug.uuid, uuid);
        assert_eq!(by_numeric.uuid, uuid);
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].uuid, uuid);
        assert_eq!(by_uuid.tags(), vec!["beamline".to_string()]);
    }

    #[tokio::test]
    async fn numeric_ids_are_monotonic_and_five_digits() {
        let pool = test_pool().await;
        let first = mint_numeric_id(&pool).await.unwrap();
        let second = mint_numeric_id(&pool).await.unwrap();
        assert_eq!(first, models::NUMERIC_ID_MIN);
        assert_eq!(second, first + 1);
    }

    #[tokio::test]
    async fn duplicate_name_per_owner_reports_its_column() {
        let pool = test_pool().await;
        seed(&pool).await;

        let numeric_id = mint_numeric_id(&pool).await.unwrap();
        let err = insert(
            &NewDataset {
                uuid: &uuid::Uuid::new_v4().to_string(),
                name: "My Data",
                slug: "a-my-data-2024-2",
                numeric_id,
                owner_email: "a@ex.com",
                team_id: None,
                sensor_kind: models::SensorKind::Tiff,
                convert: true,
                is_public: models::Visibility::OnlyOwner,
                is_downloadable: models::Visibility::OnlyOwner,
                status: Submitted,
                folder: None,
                tags: &[],
                description: None,
                remote_source: None,
            },
            Utc::now(),
            &pool,
        )
        .await
        .unwrap_err();

        assert_eq!(unique_violation_column(&err), Some("datasets.owner_email"));
    }

    #[tokio::test]
    async fn status_writes_are_compare_and_set() {
        let pool = test_pool().await;
        let uuid = seed(&pool).await;

        assert!(compare_and_set_status(&uuid, Submitted, UploadQueued, Utc::now(), &pool)
            .await
            .unwrap());
        // The prior value no longer matches: StaleState, nothing modified.
        assert!(!compare_and_set_status(&uuid, Submitted, UploadQueued, Utc::now(), &pool)
            .await
            .unwrap());

        let row = fetch_by_uuid(&uuid, &pool).await.unwrap().unwrap();
        assert_eq!(row.status().unwrap(), UploadQueued);
    }

    #[tokio::test]
    async fn exactly_one_claim_wins() {
        let pool = test_pool().await;
        let uuid = seed(&pool).await;
        for (from, to) in [(Submitted, UploadQueued), (UploadQueued, Uploading), (Uploading, ConversionQueued)] {
            assert!(compare_and_set_status(&uuid, from, to, Utc::now(), &pool)
                .await
                .unwrap());
        }

        let first = claim_conversion(&uuid, Utc::now(), &pool).await.unwrap();
        let second = claim_conversion(&uuid, Utc::now(), &pool).await.unwrap();
        assert!(first);
        assert!(!second);

        let row = fetch_by_uuid(&uuid, &pool).await.unwrap().unwrap();
        assert_eq!(row.status().unwrap(), Converting);
        assert_eq!(row.conversion_attempts, 1);
        assert!(row.claimed_at.is_some());
    }

    #[tokio::test]
    async fn stale_claims_are_requeued() {
        let pool = test_pool().await;
        let uuid = seed(&pool).await;
        for (from, to) in [(Submitted, UploadQueued), (UploadQueued, Uploading), (Uploading, ConversionQueued)] {
            compare_and_set_status(&uuid, from, to, Utc::now(), &pool)
                .await
                .unwrap();
        }
        claim_conversion(&uuid, Utc::now() - chrono::Duration::hours(5), &pool)
            .await
            .unwrap();

        let rescued = requeue_stale(Utc::now() - chrono::Duration::hours(3), Utc::now(), &pool)
            .await
            .unwrap();
        assert_eq!(rescued, vec![uuid.clone()]);

        let row = fetch_by_uuid(&uuid, &pool).await.unwrap().unwrap();
        assert_eq!(row.status().unwrap(), ConversionQueued);
        assert!(row.claimed_at.is_none());
    }

    #[tokio::test]
    async fn cancel_flag_skips_terminal_datasets() {
        let pool = test_pool().await;
        let uuid = seed(&pool).await;
        assert!(request_cancel(&uuid, Utc::now(), &pool).await.unwrap());
        assert!(cancel_requested(&uuid, &pool).await.unwrap());

        compare_and_set_status(&uuid, Submitted, Cancelled, Utc::now(), &pool)
            .await
            .unwrap();
        // Cancelling an already-terminal dataset is a no-op.
        assert!(!request_cancel(&uuid, Utc::now(), &pool).await.unwrap());
    }

    #[tokio::test]
    async fn file_appends_are_idempotent_per_path() {
        let pool = test_pool().await;
        let uuid = seed(&pool).await;

        append_file(&uuid, "scan.tiff", "scan.tiff", 100, Utc::now(), &pool)
            .await
            .unwrap();
        append_file(&uuid, "scan.tiff", "scan.tiff", 120, Utc::now(), &pool)
            .await
            .unwrap();
        append_file(&uuid, "meta.json", "meta.json", 9, Utc::now(), &pool)
            .await
            .unwrap();

        let files = list_files(&uuid, &pool).await.unwrap();
        assert_eq!(files.len(), 2);
        let scan = files.iter().find(|f| f.relative_path == "scan.tiff").unwrap();
        assert_eq!(scan.size_bytes, 120);
    }
}
