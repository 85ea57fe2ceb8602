use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::debug;

use crate::layout::Layout;

// Line is a recorded log line of a converter or fetch subprocess.
#[derive(Debug)]
pub struct Line {
    // Dataset uuid identifying the line's log file.
    token: String,
    // Stream of this logged line ("convert:1", "convert:2", ...).
    stream: String,
    // Contents of the line.
    line: Vec<u8>,
}

// Tx is the channel sender of log Lines.
pub type Tx = tokio::sync::mpsc::Sender<Line>;

pub fn channel() -> (Tx, tokio::sync::mpsc::Receiver<Line>) {
    tokio::sync::mpsc::channel(256)
}

// send forwards a single pre-split line. A closed receiver means shutdown is
// underway and the line is dropped.
pub async fn send(tx: &Tx, stream: String, token: String, line: Vec<u8>) {
    let _ = tx.send(Line { token, stream, line }).await;
}

// capture_lines consumes newline-delimited lines from the AsyncRead and
// streams each as a Line to the channel Sender.
#[tracing::instrument(err, skip(tx, reader))]
pub async fn capture_lines<R>(
    tx: Tx,
    stream: String,
    token: String,
    reader: R,
) -> Result<(), std::io::Error>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut splits = tokio::io::BufReader::new(reader).split(b'\n');
    while let Some(line) = splits.next_segment().await? {
        // The receiver lives for the whole process; a send error means
        // shutdown is already underway and the line can be dropped.
        if tx
            .send(Line {
                token: token.clone(),
                stream: stream.clone(),
                line,
            })
            .await
            .is_err()
        {
            break;
        }
    }
    Ok(())
}

// serve_sink consumes log Lines from the receiver, appending each to the
// per-dataset log file of its token.
#[tracing::instrument(ret, skip_all)]
pub async fn serve_sink(
    layout: Layout,
    mut rx: tokio::sync::mpsc::Receiver<Line>,
) -> Result<(), std::io::Error> {
    let mut files: HashMap<String, tokio::fs::File> = HashMap::new();

    while let Some(Line { token, stream, line }) = rx.recv().await {
        if !files.contains_key(&token) {
            let path = layout.log_path(&token);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            files.insert(token.clone(), file);
        }
        let file = files.get_mut(&token).expect("file was just inserted");

        let mut record = Vec::with_capacity(stream.len() + line.len() + 2);
        record.extend_from_slice(stream.as_bytes());
        record.push(b' ');
        record.extend_from_slice(&line);
        record.push(b'\n');
        file.write_all(&record).await?;

        // Bound the open-file cache; conversions are long-lived so churn is
        // rare.
        if files.len() > 32 {
            files.clear();
        }
    }

    debug!("log rx closed; sink exiting");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn captured_lines_land_in_the_token_log() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path());
        let (tx, rx) = channel();

        let sink = tokio::spawn(serve_sink(layout.clone(), rx));

        let reader: &[u8] = b"starting\nprogress 50%\ndone\n";
        capture_lines(tx.clone(), "convert:1".to_string(), "ds-1".to_string(), reader)
            .await
            .unwrap();
        drop(tx);
        sink.await.unwrap().unwrap();

        let logged = std::fs::read_to_string(layout.log_path("ds-1")).unwrap();
        assert_eq!(logged, "convert:1 starting\nconvert:1 progress 50%\nconvert:1 done\n");
    }
}
