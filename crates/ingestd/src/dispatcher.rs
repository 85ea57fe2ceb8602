//! The dispatcher: a small pool of long-lived workers that poll the catalog
//! for claimable datasets, run converter (and fetch-helper) subprocesses, and
//! advance dataset status. Compare-and-set on the status column is the single
//! source of mutual exclusion: of any two workers racing for a dataset, at
//! most one claims it and the loser moves on to the next candidate.

use chrono::Utc;
use models::DatasetStatus;
use std::sync::Arc;
use std::time::Duration;

use crate::app::App;
use crate::{fetch, runner, sessions};
use catalog_sql::datasets as db;

const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Run `workers` claim loops plus the reconciler until `shutdown` flips.
pub async fn serve(
    app: Arc<App>,
    workers: usize,
    shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut tasks = tokio::task::JoinSet::new();
    for worker in 0..workers {
        tasks.spawn(worker_loop(app.clone(), worker, shutdown.clone()));
    }
    tasks.spawn(reconciler_loop(app.clone(), shutdown.clone()));

    while tasks.join_next().await.is_some() {}
}

#[tracing::instrument(skip(app, shutdown))]
async fn worker_loop(app: Arc<App>, worker: usize, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        if *shutdown.borrow() {
            tracing::info!("worker exiting");
            return;
        }
        match poll_once(&app).await {
            Ok(true) => backoff = BACKOFF_INITIAL,
            Ok(false) => {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    () = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
            Err(err) => {
                tracing::error!(error = ?err, "worker poll failed");
                tokio::select! {
                    _ = shutdown.changed() => {}
                    () = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    }
}

/// One poll: claim and run a single queued conversion or sync. Returns true
/// when a job was executed (the caller resets its backoff).
pub async fn poll_once(app: &App) -> anyhow::Result<bool> {
    // Claim loop: a lost compare-and-set means another worker won that
    // dataset, so look again for the next candidate.
    loop {
        let Some(uuid) = db::next_queued(DatasetStatus::ConversionQueued, &app.pool).await? else {
            break;
        };
        if db::claim_conversion(&uuid, Utc::now(), &app.pool).await? {
            run_conversion(app, &uuid).await?;
            return Ok(true);
        }
        tracing::debug!(%uuid, "lost conversion claim; trying next candidate");
    }

    loop {
        let Some(uuid) = db::next_queued(DatasetStatus::SyncQueued, &app.pool).await? else {
            break;
        };
        if db::claim_sync(&uuid, Utc::now(), &app.pool).await? {
            run_sync(app, &uuid).await?;
            return Ok(true);
        }
        tracing::debug!(%uuid, "lost sync claim; trying next candidate");
    }

    Ok(false)
}

/// Spawn a task that watches the dataset's cancel flag and trips the watch
/// channel; the subprocess runner selects on it between output lines.
fn spawn_cancel_probe(
    pool: sqlx::SqlitePool,
    uuid: String,
) -> (tokio::sync::watch::Receiver<bool>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = tokio::sync::watch::channel(false);
    let probe = tokio::spawn(async move {
        let mut interval = tokio::time::interval(CANCEL_POLL_INTERVAL);
        loop {
            interval.tick().await;
            if tx.is_closed() {
                return;
            }
            match db::cancel_requested(&uuid, &pool).await {
                Ok(true) => {
                    let _ = tx.send(true);
                    return;
                }
                Ok(false) => {}
                Err(err) => tracing::warn!(error = ?err, %uuid, "cancel probe query failed"),
            }
        }
    });
    (rx, probe)
}

#[tracing::instrument(skip(app), fields(uuid = %uuid))]
async fn run_conversion(app: &App, uuid: &str) -> anyhow::Result<()> {
    let started = std::time::Instant::now();

    let Some(row) = db::fetch_by_uuid(uuid, &app.pool).await? else {
        anyhow::bail!("claimed dataset {uuid} vanished");
    };

    // The flag may have been set while the dataset sat in the queue.
    if db::cancel_requested(uuid, &app.pool).await? {
        return finish_cancelled(app, uuid, DatasetStatus::Converting).await;
    }

    let sensor = match row.sensor() {
        Ok(sensor) => sensor,
        Err(err) => {
            fail_conversion(app, &row, &format!("unknown sensor kind: {err}"), true).await?;
            return Ok(());
        }
    };
    let Some(converter) = app.registry.get(sensor) else {
        fail_conversion(
            app,
            &row,
            &format!("no converter registered for sensor {sensor}"),
            true,
        )
        .await?;
        return Ok(());
    };

    let input_dir = app.layout.upload_dir(uuid);
    let output_dir = app.layout.converted_dir(uuid);
    tokio::fs::create_dir_all(&output_dir).await?;

    let (cancel_rx, probe) = spawn_cancel_probe(app.pool.clone(), uuid.to_string());
    let mut cmd = converter.command(&input_dir, &output_dir);
    let outcome = runner::run(
        "convert",
        &app.logs_tx,
        uuid,
        &mut cmd,
        converter.timeout,
        cancel_rx,
    )
    .await;
    probe.abort();

    match outcome {
        Ok(outcome) if outcome.status.success() => {
            if dir_is_empty(&output_dir).await? {
                fail_conversion(app, &row, "converter exited 0 but produced no output", false)
                    .await?;
                return Ok(());
            }
            let elapsed = started.elapsed().as_secs_f64();
            if db::publish_done(uuid, elapsed, Utc::now(), &app.pool).await? {
                tracing::info!(%sensor, elapsed_secs = elapsed, "conversion done");
            } else {
                tracing::warn!(%uuid, "conversion finished but its claim was lost");
            }
            Ok(())
        }
        Ok(outcome) => {
            let message = if outcome.stderr_tail.is_empty() {
                format!("converter exited with {}", outcome.status)
            } else {
                outcome.stderr_tail
            };
            fail_conversion(app, &row, &message, false).await
        }
        Err(err) if err.is_cancelled() => {
            let _ = tokio::fs::remove_dir_all(&output_dir).await;
            finish_cancelled(app, uuid, DatasetStatus::Converting).await
        }
        Err(err) if err.is_timeout() => {
            fail_conversion(
                app,
                &row,
                &format!("conversion timed out after {:?}", converter.timeout),
                false,
            )
            .await
        }
        Err(err) => fail_conversion(app, &row, &format!("converter did not run: {err:#}"), false).await,
    }
}

/// Record a failed attempt: requeue while attempts remain, else fail
/// terminally with the message on the dataset.
async fn fail_conversion(
    app: &App,
    row: &db::DatasetRow,
    message: &str,
    terminal: bool,
) -> anyhow::Result<()> {
    // The claim already burned this attempt into conversion_attempts.
    let attempts = row.conversion_attempts;
    let exhausted = terminal || attempts >= app.max_attempts;
    let to = if exhausted {
        DatasetStatus::ConversionFailed
    } else {
        DatasetStatus::ConversionQueued
    };

    tracing::warn!(
        uuid = %row.uuid,
        attempts,
        requeue = !exhausted,
        %message,
        "conversion attempt failed"
    );
    db::fail_status(
        &row.uuid,
        DatasetStatus::Converting,
        to,
        message,
        Utc::now(),
        &app.pool,
    )
    .await?;
    Ok(())
}

async fn finish_cancelled(app: &App, uuid: &str, from: DatasetStatus) -> anyhow::Result<()> {
    let _ = tokio::fs::remove_dir_all(app.layout.converted_dir(uuid)).await;
    if db::compare_and_set_status(uuid, from, DatasetStatus::Cancelled, Utc::now(), &app.pool)
        .await?
    {
        tracing::info!(%uuid, "job cancelled");
    }
    Ok(())
}

#[tracing::instrument(skip(app), fields(uuid = %uuid))]
async fn run_sync(app: &App, uuid: &str) -> anyhow::Result<()> {
    let Some(row) = db::fetch_by_uuid(uuid, &app.pool).await? else {
        anyhow::bail!("claimed dataset {uuid} vanished");
    };

    if db::cancel_requested(uuid, &app.pool).await? {
        return finish_sync_cancelled(app, uuid).await;
    }

    let source = match row.remote_source() {
        Ok(Some(source)) => source,
        Ok(None) => {
            db::fail_status(
                uuid,
                DatasetStatus::Syncing,
                DatasetStatus::SyncError,
                "dataset is queued for sync but has no remote source",
                Utc::now(),
                &app.pool,
            )
            .await?;
            return Ok(());
        }
        Err(err) => {
            db::fail_status(
                uuid,
                DatasetStatus::Syncing,
                DatasetStatus::SyncError,
                &format!("stored remote source is unreadable: {err}"),
                Utc::now(),
                &app.pool,
            )
            .await?;
            return Ok(());
        }
    };

    tracing::info!(source = %source.describe(), "fetching remote source");
    let landing = app.layout.sync_dir(uuid);
    let (cancel_rx, probe) = spawn_cancel_probe(app.pool.clone(), uuid.to_string());
    let fetched = fetch::fetch(
        &source,
        &landing,
        &app.fetchers,
        &app.logs_tx,
        uuid,
        cancel_rx,
    )
    .await;
    probe.abort();

    match fetched {
        Ok(files) => {
            // Promote landed bytes into the dataset's file area.
            let upload_dir = app.layout.upload_dir(uuid);
            tokio::fs::create_dir_all(&upload_dir).await?;
            for file in &files {
                tokio::fs::rename(landing.join(&file.filename), upload_dir.join(&file.filename))
                    .await?;
                db::append_file(
                    uuid,
                    &file.filename,
                    &file.filename,
                    file.size_bytes as i64,
                    Utc::now(),
                    &app.pool,
                )
                .await?;
            }
            let _ = tokio::fs::remove_dir_all(&landing).await;

            let to = if row.convert {
                DatasetStatus::ConversionQueued
            } else {
                DatasetStatus::Done
            };
            db::compare_and_set_status(uuid, DatasetStatus::Syncing, to, Utc::now(), &app.pool)
                .await?;
            tracing::info!(files = files.len(), next = %to, "remote source landed");
            Ok(())
        }
        Err(err) if err.is_cancelled() => finish_sync_cancelled(app, uuid).await,
        Err(err) => {
            db::fail_status(
                uuid,
                DatasetStatus::Syncing,
                DatasetStatus::SyncError,
                &format!("{err:#}"),
                Utc::now(),
                &app.pool,
            )
            .await?;
            Ok(())
        }
    }
}

async fn finish_sync_cancelled(app: &App, uuid: &str) -> anyhow::Result<()> {
    let _ = tokio::fs::remove_dir_all(app.layout.sync_dir(uuid)).await;
    db::compare_and_set_status(
        uuid,
        DatasetStatus::Syncing,
        DatasetStatus::Cancelled,
        Utc::now(),
        &app.pool,
    )
    .await?;
    Ok(())
}

async fn reconciler_loop(app: Arc<App>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if let Err(err) = reconcile_once(&app).await {
            tracing::error!(error = ?err, "reconcile pass failed");
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            () = tokio::time::sleep(RECONCILE_INTERVAL) => {}
        }
    }
}

/// One reconciler sweep: rescue stale claims, expire overdue sessions and
/// their spools, and fill in aggregate sizes for freshly terminal datasets.
pub async fn reconcile_once(app: &App) -> anyhow::Result<()> {
    let now = Utc::now();

    let rescued = db::requeue_stale(now - app.stale_after, now, &app.pool).await?;
    for uuid in &rescued {
        tracing::warn!(%uuid, "requeued stale conversion claim");
    }

    let swept = sessions::gc_expired(&app.layout, &app.pool, now).await?;
    if swept > 0 {
        tracing::info!(swept, "expired upload sessions");
    }

    for uuid in db::missing_data_size(&app.pool).await? {
        let bytes = db::file_bytes_total(&uuid, &app.pool).await?;
        let gb = bytes as f64 / (1u64 << 30) as f64;
        db::set_data_size(&uuid, gb, &app.pool).await?;
    }

    Ok(())
}

async fn dir_is_empty(dir: &std::path::Path) -> std::io::Result<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_none())
}
