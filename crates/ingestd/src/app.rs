use crate::{convert, fetch, layout::Layout, logs, tokens::TokenSigner};

/// Size and expiry limits of the ingest surface.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Ceiling on any single file.
    pub max_file_bytes: u64,
    /// Chunk size handed to chunked-upload clients.
    pub chunk_size_bytes: u64,
    /// Files above this must use chunked mode.
    pub whole_file_limit: u64,
    /// How long an open upload session stays resumable.
    pub session_ttl: chrono::Duration,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            max_file_bytes: crate::sessions::MAX_FILE_BYTES,
            chunk_size_bytes: crate::sessions::DEFAULT_CHUNK_SIZE,
            whole_file_limit: 100 << 20,
            session_ttl: chrono::Duration::hours(24),
        }
    }
}

/// App is the injected configuration bundle shared by the HTTP surface and
/// the dispatcher workers: catalog pool, directory layout, signing keys,
/// converter registry, fetch helpers, and limits. There is no ambient state.
pub struct App {
    pub pool: sqlx::SqlitePool,
    pub layout: Layout,
    pub signer: TokenSigner,
    pub registry: convert::Registry,
    pub fetchers: fetch::Helpers,
    pub limits: Limits,
    /// Conversion attempts before a dataset fails terminally.
    pub max_attempts: i64,
    /// Claims older than this are considered abandoned. Must exceed the
    /// longest converter timeout.
    pub stale_after: chrono::Duration,
    pub logs_tx: logs::Tx,
}
