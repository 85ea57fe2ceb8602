use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum_extra::extract::CookieJar;
use std::sync::Arc;

mod auth;
mod datasets;
mod error;
mod upload;

pub use error::ApiError;

use crate::app::App;
use crate::tokens::{self, AuthedUser};
use anyhow::Context;
use models::TokenKind;

/// Request wraps a JSON-deserialized request type T which also implements the
/// validator::Validate trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct Request<T>(pub T);

/// Rejection is an error type of reasons why an API request may fail
/// before reaching its handler.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    JsonError(#[from] axum::extract::rejection::JsonRejection),
}

#[axum::async_trait]
impl<T, S> axum::extract::FromRequest<S> for Request<T>
where
    T: serde::de::DeserializeOwned + validator::Validate,
    S: Send + Sync,
    axum::extract::Json<T>:
        axum::extract::FromRequest<S, Rejection = axum::extract::rejection::JsonRejection>,
{
    type Rejection = Rejection;

    async fn from_request(req: axum::extract::Request, state: &S) -> Result<Self, Self::Rejection> {
        let axum::extract::Json(value) = axum::extract::Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(Request(value))
    }
}

impl axum::response::IntoResponse for Rejection {
    fn into_response(self) -> axum::response::Response {
        match self {
            Rejection::ValidationError(inner) => {
                let message = format!("Input validation error: [{inner}]").replace('\n', ", ");
                (StatusCode::BAD_REQUEST, message).into_response()
            }
            Rejection::JsonError(inner) => inner.into_response(),
        }
    }
}

/// Build the daemon's API router: the auth surface, the bearer-protected
/// ingest surface, and the dataset query surface.
pub fn build_router(app: Arc<App>, allow_origin: &[String]) -> anyhow::Result<axum::Router<()>> {
    use axum::routing::{get, post};

    let allow_origin = allow_origin
        .iter()
        .map(|o| o.parse())
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse allowed origins")?;

    let allow_headers = [
        "Cache-Control",
        "Content-Language",
        "Content-Length",
        "Content-Type",
        "Expires",
        "Last-Modified",
        "Pragma",
        "Authorization",
    ]
    .into_iter()
    .map(|h| h.parse().unwrap())
    .collect::<Vec<_>>();

    let cors = tower_http::cors::CorsLayer::new()
        .allow_methods(tower_http::cors::AllowMethods::mirror_request())
        .allow_origin(tower_http::cors::AllowOrigin::list(allow_origin))
        .allow_headers(allow_headers);

    let auth_router = axum::Router::new()
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/refresh", post(auth::refresh))
        .route(
            "/api/auth/status",
            get(auth::status).route_layer(axum::middleware::from_fn_with_state(
                app.clone(),
                authenticate_optional,
            )),
        )
        .route(
            "/api/auth/logout",
            post(auth::logout)
                .route_layer(axum::middleware::from_fn_with_state(app.clone(), authorize)),
        )
        .route(
            "/api/auth/me",
            get(auth::me)
                .route_layer(axum::middleware::from_fn_with_state(app.clone(), authorize)),
        );

    let upload_router = axum::Router::new()
        .route("/api/upload/upload", post(upload::whole_file))
        .route("/api/upload/initiate-chunked", post(upload::initiate_chunked))
        .route("/api/upload/chunk", post(upload::chunk))
        .route("/api/upload/complete-chunked", post(upload::complete_chunked))
        .route("/api/upload/initiate", post(upload::initiate_remote))
        .route("/api/upload/status/:job_id", get(upload::job_status))
        .route("/api/upload/cancel/:job_id", post(upload::cancel))
        .route("/api/upload/jobs", get(upload::list_jobs))
        .route("/api/upload/supported-sources", get(upload::supported_sources))
        .route("/api/upload/limits", get(upload::limits))
        .route("/api/v1/datasets", get(datasets::list))
        .layer(axum::middleware::from_fn_with_state(app.clone(), authorize));

    // Public datasets are readable without credentials, so this route runs
    // the attach-only variant of the middleware.
    let query_router = axum::Router::new()
        .route("/api/v1/datasets/:identifier", get(datasets::get))
        .layer(axum::middleware::from_fn_with_state(
            app.clone(),
            authenticate_optional,
        ));

    // Whole-file uploads and chunks arrive as one multipart body; size the
    // body cap to the larger of the two plus framing slack.
    let body_limit = app
        .limits
        .whole_file_limit
        .max(app.limits.chunk_size_bytes) as usize
        + (1 << 20);

    let router = auth_router
        .merge(upload_router)
        .merge(query_router)
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app);

    Ok(router)
}

/// Pull the bearer secret from the Authorization header, or fall back to the
/// `access_token` cookie for browser contexts.
fn presented_token(headers: &axum::http::HeaderMap, jar: &CookieJar) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        let value = value.to_str().ok()?;
        let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
        return Some(token.trim().to_string());
    }
    jar.get("access_token").map(|c| c.value().to_string())
}

// Middleware which validates bearer tokens before proceeding, and attaches
// the resolved user to request extensions.
async fn authorize(
    axum::extract::State(app): axum::extract::State<Arc<App>>,
    jar: CookieJar,
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let Some(token) = presented_token(req.headers(), &jar) else {
        return ApiError::unauthorized("missing bearer token").into_response();
    };

    match tokens::validate(&app.signer, &token, TokenKind::Access, &app.pool).await {
        Ok(user) => {
            req.extensions_mut().insert::<AuthedUser>(user);
            next.run(req).await
        }
        Err(err) => ApiError::from(err).into_response(),
    }
}

// Attach-only variant: anonymous requests proceed without a user.
async fn authenticate_optional(
    axum::extract::State(app): axum::extract::State<Arc<App>>,
    jar: CookieJar,
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    if let Some(token) = presented_token(req.headers(), &jar) {
        if let Ok(user) = tokens::validate(&app.signer, &token, TokenKind::Access, &app.pool).await
        {
            req.extensions_mut().insert::<AuthedUser>(user);
        }
    }
    next.run(req).await
}
