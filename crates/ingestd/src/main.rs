use anyhow::Context;
use clap::Parser;
use std::sync::Arc;

use ingestd::{api, app, convert, dispatcher, fetch, layout::Layout, logs, tokens::TokenSigner};

/// ingestd is the daemon which runs the dataset ingestion and conversion
/// pipeline: the HTTP ingest/query surface plus the conversion worker pool.
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// URL of the catalog database.
    #[clap(
        long = "database",
        env = "DATABASE_URL",
        default_value = "sqlite://ingest-catalog.db"
    )]
    database_url: String,
    /// Root of the ingest directory tree (upload/, converted/, sync/, tmp/,
    /// logs/).
    #[clap(long = "ingest-root", env = "INGEST_ROOT", default_value = "./ingest-data")]
    ingest_root: String,
    /// Symmetric key which signs bearer-token envelopes.
    #[clap(long = "signing-key", env = "SIGNING_KEY", hide_env_values = true)]
    signing_key: String,
    /// The port to listen on for API requests.
    #[clap(long, default_value = "8080", env = "API_PORT")]
    api_port: u16,
    /// Number of conversion/sync workers.
    #[clap(long, default_value = "3", env = "WORKERS")]
    workers: usize,
    /// Access-token lifetime, in hours.
    #[clap(long = "access-ttl-hours", default_value = "24", env = "ACCESS_TTL_HOURS")]
    access_ttl_hours: i64,
    /// Refresh-token lifetime, in days.
    #[clap(long = "refresh-ttl-days", default_value = "30", env = "REFRESH_TTL_DAYS")]
    refresh_ttl_days: i64,
    /// Conversion attempts before a dataset fails terminally.
    #[clap(long = "max-attempts", default_value = "2", env = "MAX_CONVERSION_ATTEMPTS")]
    max_attempts: i64,
    /// Minutes after which a `converting` claim is considered abandoned.
    /// Must exceed the longest converter timeout.
    #[clap(long = "stale-minutes", default_value = "300", env = "STALE_CLAIM_MINUTES")]
    stale_minutes: i64,
    /// Directory holding the converter executables.
    #[clap(long = "bin-dir", env = "BIN_DIR", default_value = "/usr/local/bin")]
    bin_dir: String,
    /// JSON file overriding the built-in converter registry.
    #[clap(long = "converter-config", env = "CONVERTER_CONFIG")]
    converter_config: Option<String>,
    /// Helper executable for s3 remote sources.
    #[clap(long = "s3-helper", env = "S3_FETCH_HELPER")]
    s3_helper: Option<String>,
    /// Helper executable for google_drive remote sources.
    #[clap(long = "gdrive-helper", env = "GDRIVE_FETCH_HELPER")]
    gdrive_helper: Option<String>,
    /// Origin to allow in CORS contexts. May be specified multiple times.
    #[clap(long = "allow-origin")]
    allow_origin: Vec<String>,
}

fn main() -> Result<(), anyhow::Error> {
    // Use reasonable defaults for printing structured logs to stderr.
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(!matches!(std::env::var("NO_COLOR"), Ok(v) if v == "1"))
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(
        ingest_root = %args.ingest_root,
        api_port = args.api_port,
        workers = args.workers,
        "started!"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let task = runtime.spawn(async move { async_main(args).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}

async fn async_main(args: Args) -> Result<(), anyhow::Error> {
    // Bind early in the application lifecycle, to not fail requests which
    // may dispatch as soon as the process is up.
    let api_listener = tokio::net::TcpListener::bind(format!("[::]:{}", args.api_port))
        .await
        .context("failed to bind server port")?;

    let layout = Layout::new(&args.ingest_root);
    layout.ensure().await.context("creating ingest root tree")?;

    let pool = catalog_sql::open(&args.database_url)
        .await
        .context("opening catalog database")?;

    let registry = match &args.converter_config {
        Some(path) => convert::Registry::from_config(std::path::Path::new(path))
            .with_context(|| format!("loading converter config {path}"))?,
        None => convert::Registry::with_defaults(std::path::Path::new(&args.bin_dir)),
    };

    let stale_after = chrono::Duration::minutes(args.stale_minutes);
    if stale_after.to_std().unwrap_or_default() <= registry.max_timeout() {
        anyhow::bail!(
            "--stale-minutes ({}) must exceed the longest converter timeout ({:?})",
            args.stale_minutes,
            registry.max_timeout(),
        );
    }

    let (logs_tx, logs_rx) = logs::channel();
    let log_sink = tokio::spawn(logs::serve_sink(layout.clone(), logs_rx));

    let app = Arc::new(app::App {
        pool,
        layout,
        signer: TokenSigner::new(
            args.signing_key.as_bytes(),
            chrono::Duration::hours(args.access_ttl_hours),
            chrono::Duration::days(args.refresh_ttl_days),
        ),
        registry,
        fetchers: fetch::Helpers {
            s3: args.s3_helper.map(Into::into),
            google_drive: args.gdrive_helper.map(Into::into),
            timeout: None,
        },
        limits: app::Limits::default(),
        max_attempts: args.max_attempts,
        stale_after,
        logs_tx,
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let workers = tokio::spawn(dispatcher::serve(app.clone(), args.workers, shutdown_rx));

    let router = api::build_router(app.clone(), &args.allow_origin)?;
    axum::serve(api_listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("caught signal; exiting...");
        })
        .await
        .context("serving API")?;

    // The API is down; drain the workers and the log sink.
    let _ = shutdown_tx.send(true);
    workers.await.context("joining dispatcher workers")?;
    drop(app);
    let _ = log_sink.await;

    Ok(())
}
