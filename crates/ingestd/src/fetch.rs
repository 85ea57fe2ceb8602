use futures::StreamExt;
use models::RemoteSource;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::{logs, runner};

/// External helper executables for the source kinds the service does not
/// stream natively. The cloud-vendor SDKs stay out of process: helpers are
/// invoked exactly like converters.
#[derive(Debug, Clone, Default)]
pub struct Helpers {
    pub s3: Option<PathBuf>,
    pub google_drive: Option<PathBuf>,
    pub timeout: Option<std::time::Duration>,
}

const DEFAULT_FETCH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(6 * 3600);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("no fetch helper is configured for {kind} sources")]
    Unsupported { kind: &'static str },
    #[error("fetch failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("fetch produced no bytes")]
    Empty,
    #[error("fetch helper exited with {status}: {stderr_tail}")]
    Helper {
        status: std::process::ExitStatus,
        stderr_tail: String,
    },
    #[error(transparent)]
    Runner(#[from] runner::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Runner(err) if err.is_cancelled())
    }
}

/// A fetched file, relative to the landing directory.
#[derive(Debug)]
pub struct Fetched {
    pub filename: String,
    pub size_bytes: u64,
}

/// Pull a remote source into `dest_dir`. URL sources stream through the HTTP
/// client; s3 and google_drive dispatch to their helper executables, stdio
/// captured under the dataset's log token.
pub async fn fetch(
    source: &RemoteSource,
    dest_dir: &Path,
    helpers: &Helpers,
    logs_tx: &logs::Tx,
    token: &str,
    cancel: tokio::sync::watch::Receiver<bool>,
) -> Result<Vec<Fetched>, FetchError> {
    tokio::fs::create_dir_all(dest_dir).await?;

    match source {
        RemoteSource::Url { url } => fetch_url(&url.0, dest_dir).await,
        RemoteSource::S3 {
            bucket,
            key,
            region,
            access_key_id,
            secret_access_key,
        } => {
            let program = helpers
                .s3
                .as_ref()
                .ok_or(FetchError::Unsupported { kind: "s3" })?;
            let filename = filename_from_key(key);
            let dest = dest_dir.join(&filename);

            let mut cmd = tokio::process::Command::new(program);
            cmd.arg(bucket).arg(key).arg(&dest);
            if let Some(region) = region {
                cmd.env("AWS_REGION", region);
            }
            if let (Some(id), Some(secret)) = (access_key_id, secret_access_key) {
                cmd.env("AWS_ACCESS_KEY_ID", id)
                    .env("AWS_SECRET_ACCESS_KEY", secret);
            }
            run_helper("fetch-s3", logs_tx, token, cmd, helpers, cancel, dest, filename).await
        }
        RemoteSource::GoogleDrive {
            file_id,
            service_account,
        } => {
            let program = helpers
                .google_drive
                .as_ref()
                .ok_or(FetchError::Unsupported { kind: "google_drive" })?;
            let filename = format!("{file_id}.bin");
            let dest = dest_dir.join(&filename);

            let mut cmd = tokio::process::Command::new(program);
            cmd.arg(file_id).arg(&dest);
            if let Some(service_account) = service_account {
                cmd.env("GOOGLE_SERVICE_ACCOUNT_JSON", service_account);
            }
            run_helper(
                "fetch-gdrive",
                logs_tx,
                token,
                cmd,
                helpers,
                cancel,
                dest,
                filename,
            )
            .await
        }
    }
}

async fn fetch_url(url: &url::Url, dest_dir: &Path) -> Result<Vec<Fetched>, FetchError> {
    let filename = url
        .path_segments()
        .and_then(|segments| segments.last())
        .filter(|name| !name.is_empty())
        .unwrap_or("download.bin")
        .to_string();
    let filename = crate::sessions::sanitize_filename(&filename);
    let dest = dest_dir.join(&filename);

    let response = reqwest::get(url.clone()).await?.error_for_status()?;

    let part = dest.with_extension("part");
    let mut out = tokio::fs::File::create(&part).await?;
    let mut stream = response.bytes_stream();
    let mut size_bytes = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        out.write_all(&chunk).await?;
        size_bytes += chunk.len() as u64;
    }
    out.flush().await?;
    drop(out);

    if size_bytes == 0 {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(FetchError::Empty);
    }
    tokio::fs::rename(&part, &dest).await?;

    Ok(vec![Fetched {
        filename,
        size_bytes,
    }])
}

#[allow(clippy::too_many_arguments)]
async fn run_helper(
    name: &str,
    logs_tx: &logs::Tx,
    token: &str,
    mut cmd: tokio::process::Command,
    helpers: &Helpers,
    cancel: tokio::sync::watch::Receiver<bool>,
    dest: PathBuf,
    filename: String,
) -> Result<Vec<Fetched>, FetchError> {
    // Helpers inherit PATH alongside the credentials set on the command.
    if let Ok(path) = std::env::var("PATH") {
        cmd.env("PATH", path);
    }
    let timeout = helpers.timeout.unwrap_or(DEFAULT_FETCH_TIMEOUT);

    let outcome = runner::run_with_env(name, logs_tx, token, &mut cmd, timeout, cancel).await?;
    if !outcome.status.success() {
        return Err(FetchError::Helper {
            status: outcome.status,
            stderr_tail: outcome.stderr_tail,
        });
    }

    let size_bytes = tokio::fs::metadata(&dest).await?.len();
    if size_bytes == 0 {
        return Err(FetchError::Empty);
    }
    Ok(vec![Fetched {
        filename,
        size_bytes,
    }])
}

fn filename_from_key(key: &str) -> String {
    crate::sessions::sanitize_filename(key.rsplit('/').next().unwrap_or(key))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layout::Layout;

    fn no_cancel() -> tokio::sync::watch::Receiver<bool> {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        rx
    }

    #[tokio::test]
    async fn unconfigured_helper_is_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, _rx) = logs::channel();
        let source: RemoteSource = serde_json::from_value(serde_json::json!({
            "source_type": "s3",
            "source_config": {"bucket": "b", "key": "k"},
        }))
        .unwrap();

        let err = fetch(
            &source,
            tmp.path(),
            &Helpers::default(),
            &tx,
            "ds-1",
            no_cancel(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::Unsupported { kind: "s3" }));
    }

    #[tokio::test]
    async fn helper_subprocess_lands_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path().join("ingest"));
        layout.ensure().await.unwrap();
        let (tx, rx) = logs::channel();
        let _sink = tokio::spawn(logs::serve_sink(layout, rx));

        // A stand-in s3 helper: writes the "object" to its dest argument.
        let helper = tmp.path().join("s3-helper.sh");
        std::fs::write(&helper, "#!/bin/sh\necho \"object $1/$2\" > \"$3\"\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let source: RemoteSource = serde_json::from_value(serde_json::json!({
            "source_type": "s3",
            "source_config": {"bucket": "scans", "key": "beamline/run42.h5"},
        }))
        .unwrap();

        let dest = tmp.path().join("landing");
        let helpers = Helpers {
            s3: Some(helper),
            google_drive: None,
            timeout: Some(std::time::Duration::from_secs(10)),
        };
        let fetched = fetch(&source, &dest, &helpers, &tx, "ds-1", no_cancel())
            .await
            .unwrap();

        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].filename, "run42.h5");
        let body = std::fs::read_to_string(dest.join("run42.h5")).unwrap();
        assert_eq!(body.trim(), "object scans/beamline/run42.h5");
    }

    #[tokio::test]
    async fn failing_helper_surfaces_its_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, rx) = logs::channel();
        let _sink = tokio::spawn(logs::serve_sink(Layout::new(tmp.path().join("ingest")), rx));

        let helper = tmp.path().join("s3-helper.sh");
        std::fs::write(&helper, "#!/bin/sh\necho access denied >&2\nexit 2\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let source: RemoteSource = serde_json::from_value(serde_json::json!({
            "source_type": "s3",
            "source_config": {"bucket": "b", "key": "k"},
        }))
        .unwrap();
        let helpers = Helpers {
            s3: Some(helper),
            google_drive: None,
            timeout: Some(std::time::Duration::from_secs(10)),
        };

        let err = fetch(&source, tmp.path(), &helpers, &tx, "ds-1", no_cancel())
            .await
            .unwrap_err();
        assert!(
            matches!(&err, FetchError::Helper { stderr_tail, .. } if stderr_tail.contains("access denied"))
        );
    }
}
