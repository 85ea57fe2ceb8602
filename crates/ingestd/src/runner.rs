use crate::logs;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("job {name:?} with exec {exec:?} encountered an error")]
    NameDetail {
        name: String,
        exec: std::ffi::OsString,
        #[source]
        err: Box<Error>,
    },
    #[error("failed to spawn")]
    Spawn(#[source] std::io::Error),
    #[error("failed to service stdout")]
    Stdout(#[source] std::io::Error),
    #[error("failed to service stderr")]
    Stderr(#[source] std::io::Error),
    #[error("error while waiting for the process")]
    Wait(#[source] std::io::Error),
    #[error("timed out after {0:?} and was killed")]
    Timeout(std::time::Duration),
    #[error("cancelled by request")]
    Cancelled,
}

impl Error {
    /// True when this error (possibly wrapped in name detail) is the
    /// cancellation kill.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::NameDetail { err, .. } => err.is_cancelled(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::NameDetail { err, .. } => err.is_timeout(),
            _ => false,
        }
    }

    fn detail(err: Self, name: &str, cmd: &tokio::process::Command) -> Self {
        Self::NameDetail {
            name: name.to_string(),
            exec: cmd.as_std().get_program().to_os_string(),
            err: err.into(),
        }
    }
}

/// Outcome of a completed (non-killed) subprocess.
#[derive(Debug)]
pub struct Outcome {
    pub status: std::process::ExitStatus,
    /// Bounded tail of stderr, recorded on the dataset when the job fails.
    pub stderr_tail: String,
}

const STDERR_TAIL_BYTES: usize = 4096;

/// run spawns the provided Command, capturing its stdout and stderr into the
/// provided logs_tx identified by |token|, with a hard deadline and a
/// cancellation watch. The child's environment is cleared except PATH.
/// Timeout or cancellation kills the subprocess and surfaces as an error.
pub async fn run(
    name: &str,
    logs_tx: &logs::Tx,
    token: &str,
    cmd: &mut tokio::process::Command,
    timeout: std::time::Duration,
    cancel: tokio::sync::watch::Receiver<bool>,
) -> Result<Outcome, Error> {
    cmd.env_clear()
        .envs(std::env::vars().filter(|(k, _)| k == "PATH"));
    run_with_env(name, logs_tx, token, cmd, timeout, cancel).await
}

/// Does the same thing as `run`, but leaves the environment configured on
/// `cmd` untouched. Fetch helpers use this to pass source credentials.
#[tracing::instrument(err, skip(logs_tx, cmd, cancel))]
pub async fn run_with_env(
    name: &str,
    logs_tx: &logs::Tx,
    token: &str,
    cmd: &mut tokio::process::Command,
    timeout: std::time::Duration,
    mut cancel: tokio::sync::watch::Receiver<bool>,
) -> Result<Outcome, Error> {
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    debug!(program = ?cmd.as_std().get_program(), args = ?cmd.as_std().get_args().collect::<Vec<_>>(), "invoking");

    let mut child = cmd.spawn().map_err(|err| Error::detail(Error::Spawn(err), name, cmd))?;

    let c_stdout = child.stdout.take();
    let c_stderr = child.stderr.take();

    let stdout = async {
        if let Some(reader) = c_stdout {
            logs::capture_lines(logs_tx.clone(), format!("{name}:1"), token.to_string(), reader)
                .await
                .map_err(Error::Stdout)?;
        }
        Ok(())
    };

    // stderr is both streamed to the log sink and retained in a bounded tail
    // for the dataset's error_message.
    let tail = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::<u8>::new()));
    let stderr = {
        let tail = tail.clone();
        let logs_tx = logs_tx.clone();
        let stream = format!("{name}:2");
        let token = token.to_string();
        async move {
            if let Some(reader) = c_stderr {
                use tokio::io::AsyncBufReadExt;
                let mut splits = tokio::io::BufReader::new(reader).split(b'\n');
                while let Some(line) = splits.next_segment().await.map_err(Error::Stderr)? {
                    {
                        let mut tail = tail.lock().await;
                        tail.extend_from_slice(&line);
                        tail.push(b'\n');
                        if tail.len() > STDERR_TAIL_BYTES {
                            let cut = tail.len() - STDERR_TAIL_BYTES;
                            tail.drain(..cut);
                        }
                    }
                    logs::send(&logs_tx, stream.clone(), token.clone(), line).await;
                }
            }
            Ok(())
        }
    };

    let io = async { futures::try_join!(stdout, stderr) };
    tokio::pin!(io);

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    // Drive child IO and exit concurrently so a chatty converter can't fill
    // its pipe buffers and deadlock against wait().
    let mut io_done = false;
    let mut cancel_open = true;
    let status = loop {
        tokio::select! {
            result = &mut io, if !io_done => {
                result.map_err(|err| Error::detail(err, name, cmd))?;
                io_done = true;
            }
            status = child.wait() => {
                break status.map_err(|err| Error::detail(Error::Wait(err), name, cmd))?;
            }
            () = &mut deadline => {
                let _ = child.kill().await;
                return Err(Error::detail(Error::Timeout(timeout), name, cmd));
            }
            changed = cancel.changed(), if cancel_open => {
                match changed {
                    Ok(()) if *cancel.borrow() => {
                        let _ = child.kill().await;
                        return Err(Error::detail(Error::Cancelled, name, cmd));
                    }
                    Ok(()) => {}
                    // The watch sender is gone; cancellation can no longer
                    // arrive, keep waiting on the child.
                    Err(_) => cancel_open = false,
                }
            }
        }
    };

    if !io_done {
        // The child exited; drain whatever remains of its pipes.
        io.await.map_err(|err| Error::detail(err, name, cmd))?;
    }

    let tail = tail.lock().await;
    Ok(Outcome {
        status,
        stderr_tail: String::from_utf8_lossy(&tail).into_owned(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layout::Layout;

    fn harness(tmp: &std::path::Path) -> (logs::Tx, tokio::task::JoinHandle<Result<(), std::io::Error>>) {
        let (tx, rx) = logs::channel();
        let sink = tokio::spawn(logs::serve_sink(Layout::new(tmp), rx));
        (tx, sink)
    }

    fn no_cancel() -> tokio::sync::watch::Receiver<bool> {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        rx
    }

    #[tokio::test]
    async fn successful_job_reports_zero_and_logs() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, _sink) = harness(tmp.path());

        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2"]);
        let outcome = run(
            "convert",
            &tx,
            "ds-run",
            &mut cmd,
            std::time::Duration::from_secs(10),
            no_cancel(),
        )
        .await
        .unwrap();

        assert!(outcome.status.success());
        assert_eq!(outcome.stderr_tail, "err\n");
    }

    #[tokio::test]
    async fn failing_job_keeps_a_stderr_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, _sink) = harness(tmp.path());

        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "echo boom: no input volume >&2; exit 3"]);
        let outcome = run(
            "convert",
            &tx,
            "ds-fail",
            &mut cmd,
            std::time::Duration::from_secs(10),
            no_cancel(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.status.code(), Some(3));
        assert!(outcome.stderr_tail.contains("no input volume"));
    }

    #[tokio::test]
    async fn overrunning_job_is_killed() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, _sink) = harness(tmp.path());

        let mut cmd = tokio::process::Command::new("sleep");
        cmd.arg("30");
        let err = run(
            "convert",
            &tx,
            "ds-slow",
            &mut cmd,
            std::time::Duration::from_millis(50),
            no_cancel(),
        )
        .await
        .unwrap_err();

        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn cancellation_kills_the_job() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, _sink) = harness(tmp.path());
        let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

        let mut cmd = tokio::process::Command::new("sleep");
        cmd.arg("30");

        let job = run(
            "convert",
            &tx,
            "ds-cancel",
            &mut cmd,
            std::time::Duration::from_secs(30),
            cancel_rx,
        );
        tokio::pin!(job);

        tokio::select! {
            _ = &mut job => panic!("job finished before cancellation"),
            () = tokio::time::sleep(std::time::Duration::from_millis(50)) => {
                cancel_tx.send(true).unwrap();
            }
        }
        let err = job.await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
