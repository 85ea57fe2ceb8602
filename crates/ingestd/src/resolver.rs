use chrono::{Datelike, Utc};
use models::{DatasetStatus, Identifier, RemoteSource, SensorKind, Visibility};

use catalog_sql::datasets as db;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("dataset not found")]
    NotFound,
    #[error("identifier matches more than one dataset; retry with its uuid")]
    Ambiguous,
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

/// Resolve any of the four identifier forms to the canonical dataset record.
/// First lexical hit wins: canonical uuid, then all-digits numeric id, then
/// slug, then name (owner-scoped when the caller is known).
pub async fn resolve(
    identifier: &str,
    owner_email: Option<&str>,
    pool: &sqlx::SqlitePool,
) -> Result<db::DatasetRow, ResolveError> {
    match Identifier::classify(identifier) {
        Identifier::Uuid(uuid) => db::fetch_by_uuid(&uuid.to_string(), pool)
            .await?
            .ok_or(ResolveError::NotFound),
        Identifier::Numeric(numeric_id) => db::fetch_by_numeric_id(numeric_id, pool)
            .await?
            .ok_or(ResolveError::NotFound),
        Identifier::Text(text) => {
            if let Some(row) = db::fetch_by_slug(&text, pool).await? {
                return Ok(row);
            }
            if let Some(owner) = owner_email {
                let mut rows = db::fetch_by_name(&text, Some(owner), pool).await?;
                if let Some(row) = rows.pop() {
                    return Ok(row);
                }
            }
            let mut rows = db::fetch_by_name(&text, None, pool).await?;
            match rows.len() {
                0 => Err(ResolveError::NotFound),
                1 => Ok(rows.pop().expect("one row")),
                _ => Err(ResolveError::Ambiguous),
            }
        }
    }
}

/// Allocate a globally unique slug: the derived base, then `-2`, `-3`, ...
pub async fn allocate_slug(
    name: &str,
    owner_email: &str,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<String> {
    let base = models::derive_slug(name, owner_email, Utc::now().year());
    if !db::slug_exists(&base, pool).await? {
        return Ok(base);
    }
    for n in 2.. {
        let candidate = format!("{base}-{n}");
        if !db::slug_exists(&candidate, pool).await? {
            return Ok(candidate);
        }
    }
    unreachable!("slug candidates are unbounded");
}

pub struct CreateDataset<'a> {
    pub name: &'a str,
    pub owner_email: &'a str,
    pub team_id: Option<&'a str>,
    pub sensor_kind: SensorKind,
    pub convert: bool,
    pub is_public: Visibility,
    pub is_downloadable: Visibility,
    pub folder: Option<&'a str>,
    pub tags: &'a [String],
    pub description: Option<&'a str>,
    pub remote_source: Option<&'a RemoteSource>,
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("a dataset named {name:?} already exists for this owner")]
    NameTaken { name: String },
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

/// Create the dataset record in `submitted`, minting its slug and numeric id.
/// Numeric-id collisions (the counter racing a concurrent insert) re-mint and
/// retry; a name collision is the caller's error.
pub async fn create_dataset(
    params: &CreateDataset<'_>,
    pool: &sqlx::SqlitePool,
) -> Result<db::DatasetRow, CreateError> {
    let uuid = uuid::Uuid::new_v4().to_string();

    for attempt in 0..5 {
        let slug = allocate_slug(params.name, params.owner_email, pool).await?;
        let numeric_id = db::mint_numeric_id(pool).await?;

        let insert = db::insert(
            &db::NewDataset {
                uuid: &uuid,
                name: params.name,
                slug: &slug,
                numeric_id,
                owner_email: params.owner_email,
                team_id: params.team_id,
                sensor_kind: params.sensor_kind,
                convert: params.convert,
                is_public: params.is_public,
                is_downloadable: params.is_downloadable,
                status: DatasetStatus::Submitted,
                folder: params.folder,
                tags: params.tags,
                description: params.description,
                remote_source: params.remote_source,
            },
            Utc::now(),
            pool,
        )
        .await;

        match insert {
            Ok(()) => {
                return db::fetch_by_uuid(&uuid, pool)
                    .await?
                    .ok_or_else(|| CreateError::Storage(sqlx::Error::RowNotFound));
            }
            Err(err) => match db::unique_violation_column(&err) {
                Some("datasets.owner_email") | Some("datasets.name") => {
                    return Err(CreateError::NameTaken {
                        name: params.name.to_string(),
                    });
                }
                Some("datasets.numeric_id") | Some("datasets.slug") if attempt + 1 < 5 => {
                    tracing::debug!(%uuid, attempt, "identifier collision; re-minting");
                    continue;
                }
                _ => return Err(err.into()),
            },
        }
    }
    Err(CreateError::Storage(sqlx::Error::Protocol(
        "exhausted identifier minting attempts".into(),
    )))
}

#[cfg(test)]
mod test {
    use super::*;

    async fn pool() -> sqlx::SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();
        catalog_sql::install_schema(&pool).await.unwrap();
        catalog_sql::users::upsert_login("a@ex.com", "u-1", Utc::now(), &pool)
            .await
            .unwrap();
        pool
    }

    fn params<'a>(name: &'a str) -> CreateDataset<'a> {
        CreateDataset {
            name,
            owner_email: "a@ex.com",
            team_id: None,
            sensor_kind: SensorKind::Tiff,
            convert: true,
            is_public: Visibility::OnlyOwner,
            is_downloadable: Visibility::OnlyOwner,
            folder: None,
            tags: &[],
            description: None,
            remote_source: None,
        }
    }

    #[tokio::test]
    async fn every_identifier_form_resolves_to_the_same_record() {
        let pool = pool().await;
        let created = create_dataset(&params("My Data"), &pool).await.unwrap();

        let by_uuid = resolve(&created.uuid, None, &pool).await.unwrap();
        let by_slug = resolve(&created.slug, None, &pool).await.unwrap();
        let by_numeric = resolve(&created.numeric_id.to_string(), None, &pool)
            .await
            .unwrap();
        let by_name = resolve("My Data", Some("a@ex.com"), &pool).await.unwrap();

        for row in [&by_uuid, &by_slug, &by_numeric, &by_name] {
            assert_eq!(row.uuid, created.uuid);
        }
        let year = Utc::now().year();
        assert_eq!(created.slug, format!("a-my-data-{year}"));
    }

    #[tokio::test]
    async fn second_dataset_with_a_colliding_slug_gets_a_suffix() {
        let pool = pool().await;
        catalog_sql::users::upsert_login("a@other.org", "u-2", Utc::now(), &pool)
            .await
            .unwrap();

        // Different owners, same email prefix and name: same base slug.
        let first = create_dataset(&params("Scan"), &pool).await.unwrap();
        let mut second = params("Scan");
        second.owner_email = "a@other.org";
        let second = create_dataset(&second, &pool).await.unwrap();

        assert_eq!(second.slug, format!("{}-2", first.slug));
        assert_ne!(first.numeric_id, second.numeric_id);
    }

    #[tokio::test]
    async fn duplicate_name_for_one_owner_is_refused() {
        let pool = pool().await;
        create_dataset(&params("My Data"), &pool).await.unwrap();
        let err = create_dataset(&params("My Data"), &pool).await.unwrap_err();
        assert!(matches!(err, CreateError::NameTaken { .. }));
    }

    #[tokio::test]
    async fn global_name_ambiguity_requires_a_uuid() {
        let pool = pool().await;
        catalog_sql::users::upsert_login("b@ex.com", "u-2", Utc::now(), &pool)
            .await
            .unwrap();

        create_dataset(&params("Shared Name"), &pool).await.unwrap();
        let mut other = params("Shared Name");
        other.owner_email = "b@ex.com";
        create_dataset(&other, &pool).await.unwrap();

        let err = resolve("Shared Name", None, &pool).await.unwrap_err();
        assert!(matches!(err, ResolveError::Ambiguous));

        // Owner-scoped resolution stays unambiguous.
        let row = resolve("Shared Name", Some("b@ex.com"), &pool).await.unwrap();
        assert_eq!(row.owner_email, "b@ex.com");
    }

    #[tokio::test]
    async fn unknown_identifiers_are_not_found() {
        let pool = pool().await;
        create_dataset(&params("My Data"), &pool).await.unwrap();

        for missing in ["99999", "no-such-slug", "67e55044-10b1-426f-9247-bb680e5fe0c8"] {
            let err = resolve(missing, None, &pool).await.unwrap_err();
            assert!(matches!(err, ResolveError::NotFound), "{missing}");
        }
    }
}
