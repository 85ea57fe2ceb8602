use chrono::{DateTime, Duration, Utc};
use models::TokenKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Token validation failures are fatal to the request but carry no state;
/// they all surface as Unauthorized at the boundary.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("token is expired")]
    Expired,
    #[error("token is revoked")]
    Revoked,
    #[error("token is not known")]
    Unknown,
    #[error("a {expected} token is required")]
    WrongKind { expected: TokenKind },
    #[error("user account is inactive")]
    Inactive,
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

/// Claims of the signed bearer envelope. The envelope makes validation
/// stateless (signature + expiry); the hashed descriptor row adds revocation.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub email: String,
    /// Token id, keyed to the stored descriptor.
    pub jti: String,
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
}

/// The authenticated principal attached to request extensions.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
    pub token_id: String,
}

#[derive(Debug, Serialize)]
pub struct UserInfo {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
    pub email_verified: bool,
}

#[derive(Debug, Serialize)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: &'static str,
    pub user: UserInfo,
}

/// TokenSigner holds the process-wide symmetric key and expiry windows. It is
/// part of the injected configuration bundle, not ambient state.
pub struct TokenSigner {
    encoding: jsonwebtoken::EncodingKey,
    decoding: jsonwebtoken::DecodingKey,
    validation: jsonwebtoken::Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: &[u8], access_ttl: Duration, refresh_ttl: Duration) -> TokenSigner {
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.leeway = 0;

        TokenSigner {
            encoding: jsonwebtoken::EncodingKey::from_secret(secret),
            decoding: jsonwebtoken::DecodingKey::from_secret(secret),
            validation,
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    fn mint(
        &self,
        user_id: &str,
        email: &str,
        kind: TokenKind,
        now: DateTime<Utc>,
    ) -> Result<Minted, jsonwebtoken::errors::Error> {
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let expires_at = now + ttl;
        let token_id = uuid::Uuid::new_v4().to_string();

        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_string(),
            jti: token_id.clone(),
            kind,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = jsonwebtoken::encode(&jsonwebtoken::Header::default(), &claims, &self.encoding)?;

        Ok(Minted {
            token,
            token_id,
            expires_at,
        })
    }

    fn decode(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        Ok(jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)?.claims)
    }
}

struct Minted {
    token: String,
    token_id: String,
    expires_at: DateTime<Utc>,
}

/// Hex SHA-256 of a presented secret; the only form a token takes at rest.
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Log a user in, creating the profile on first call, and issue a fresh
/// access + refresh token pair.
pub async fn login(
    signer: &TokenSigner,
    email: &str,
    pool: &sqlx::SqlitePool,
) -> Result<IssuedTokens, AuthError> {
    let now = Utc::now();
    let candidate_id = uuid::Uuid::new_v4().to_string();
    let profile = catalog_sql::users::upsert_login(email, &candidate_id, now, pool).await?;
    if !profile.is_active {
        return Err(AuthError::Inactive);
    }

    let mut issued = Vec::with_capacity(2);
    for kind in [TokenKind::Access, TokenKind::Refresh] {
        let minted = signer.mint(&profile.user_id, email, kind, now)?;
        catalog_sql::users::insert_token(
            &minted.token_id,
            email,
            kind,
            &token_hash(&minted.token),
            now,
            minted.expires_at,
            pool,
        )
        .await?;
        issued.push(minted.token);
    }
    let refresh_token = issued.pop().expect("two tokens were minted");
    let access_token = issued.pop().expect("two tokens were minted");

    Ok(IssuedTokens {
        access_token,
        refresh_token,
        expires_in: signer.access_ttl.num_seconds(),
        token_type: "Bearer",
        user: UserInfo {
            user_id: profile.user_id,
            email: profile.email,
            name: profile.name,
            email_verified: true,
        },
    })
}

/// Validate a presented bearer secret of the expected kind: envelope
/// signature and expiry, then the stored descriptor (known, not revoked, not
/// expired). Stamps `last_used` and the profile's `last_activity`.
pub async fn validate(
    signer: &TokenSigner,
    token: &str,
    expected: TokenKind,
    pool: &sqlx::SqlitePool,
) -> Result<AuthedUser, AuthError> {
    let claims = signer.decode(token)?;
    if claims.kind != expected {
        return Err(AuthError::WrongKind { expected });
    }

    let row = catalog_sql::users::fetch_token_by_hash(&token_hash(token), pool)
        .await?
        .ok_or(AuthError::Unknown)?;

    let now = Utc::now();
    if row.is_revoked {
        return Err(AuthError::Revoked);
    }
    if now >= row.expires_at {
        return Err(AuthError::Expired);
    }

    let profile = catalog_sql::users::fetch_profile(&row.user_email, pool)
        .await?
        .ok_or(AuthError::Unknown)?;
    if !profile.is_active {
        return Err(AuthError::Inactive);
    }

    catalog_sql::users::touch_token(&row.token_id, now, pool).await?;
    catalog_sql::users::touch_activity(&profile.email, now, pool).await?;

    Ok(AuthedUser {
        user_id: profile.user_id,
        email: profile.email,
        name: profile.name,
        token_id: row.token_id,
    })
}

#[derive(Debug, Serialize)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_in: i64,
    pub token_type: &'static str,
}

/// Exchange a valid refresh token for a new access token.
pub async fn refresh(
    signer: &TokenSigner,
    refresh_token: &str,
    pool: &sqlx::SqlitePool,
) -> Result<RefreshedToken, AuthError> {
    let user = validate(signer, refresh_token, TokenKind::Refresh, pool).await?;

    let now = Utc::now();
    let minted = signer.mint(&user.user_id, &user.email, TokenKind::Access, now)?;
    catalog_sql::users::insert_token(
        &minted.token_id,
        &user.email,
        TokenKind::Access,
        &token_hash(&minted.token),
        now,
        minted.expires_at,
        pool,
    )
    .await?;

    Ok(RefreshedToken {
        access_token: minted.token,
        expires_in: signer.access_ttl.num_seconds(),
        token_type: "Bearer",
    })
}

/// Revoke the presented token's descriptor.
pub async fn logout(
    signer: &TokenSigner,
    token: &str,
    pool: &sqlx::SqlitePool,
) -> Result<(), AuthError> {
    let user = validate(signer, token, TokenKind::Access, pool).await?;
    catalog_sql::users::revoke_token(&user.token_id, pool).await?;
    Ok(())
}
