use chrono::{DateTime, Utc};
use models::TokenKind;

// Row shape of a stored user profile.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProfileRow {
    pub email: String,
    pub user_id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub is_active: bool,
}

// Row shape of an issued-token descriptor. The token secret itself is never
// stored; `token_hash` is the hex SHA-256 of the presented secret.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenRow {
    pub token_id: String,
    pub user_email: String,
    pub token_kind: String,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_revoked: bool,
    pub last_used: Option<DateTime<Utc>>,
}

impl TokenRow {
    pub fn kind(&self) -> anyhow::Result<TokenKind> {
        self.token_kind
            .parse::<TokenKind>()
            .map_err(|err| anyhow::anyhow!(err))
    }
}

/// Create the profile on first login, or stamp `last_login` on a returning
/// one. The profile is never deleted afterward, only marked inactive.
pub async fn upsert_login(
    email: &str,
    user_id: &str,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<ProfileRow> {
    sqlx::query_as::<_, ProfileRow>(
        r#"
        insert into user_profiles (email, user_id, created_at, last_login, last_activity, is_active)
        values (?1, ?2, ?3, ?3, ?3, 1)
        on conflict (email) do update set
            last_login = excluded.last_login,
            last_activity = excluded.last_activity
        returning email, user_id, name, created_at, last_login, last_activity, is_active
        "#,
    )
    .bind(email)
    .bind(user_id)
    .bind(now)
    .fetch_one(pool)
    .await
}

pub async fn fetch_profile(
    email: &str,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<Option<ProfileRow>> {
    sqlx::query_as::<_, ProfileRow>("select * from user_profiles where email = ?1")
        .bind(email)
        .fetch_optional(pool)
        .await
}

pub async fn touch_activity(
    email: &str,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<()> {
    sqlx::query("update user_profiles set last_activity = ?2 where email = ?1")
        .bind(email)
        .bind(now)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn insert_token(
    token_id: &str,
    user_email: &str,
    kind: TokenKind,
    token_hash: &str,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        insert into user_tokens (token_id, user_email, token_kind, token_hash, created_at, expires_at)
        values (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(token_id)
    .bind(user_email)
    .bind(kind.as_str())
    .bind(token_hash)
    .bind(created_at)
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_token_by_hash(
    token_hash: &str,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<Option<TokenRow>> {
    sqlx::query_as::<_, TokenRow>("select * from user_tokens where token_hash = ?1")
        .bind(token_hash)
        .fetch_optional(pool)
        .await
}

/// Mark a token revoked. Returns false when no live descriptor matched.
pub async fn revoke_token(token_id: &str, pool: &sqlx::SqlitePool) -> sqlx::Result<bool> {
    let done = sqlx::query("update user_tokens set is_revoked = 1 where token_id = ?1 and is_revoked = 0")
        .bind(token_id)
        .execute(pool)
        .await?;
    Ok(done.rows_affected() == 1)
}

pub async fn touch_token(
    token_id: &str,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> sqlx::Result<()> {
    sqlx::query("update user_tokens set last_used = ?2 where token_id = ?1")
        .bind(token_id)
        .bind(now)
        .execute(pool)
        .await?;
    Ok(())
}
