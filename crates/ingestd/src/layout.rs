use std::path::{Path, PathBuf};

/// Layout is the on-disk directory contract under the ingest root. The tree
/// is partitioned by dataset uuid (and session id for the chunk spool), so
/// concurrent ingests never collide at the filesystem level.
///
/// ```text
/// {root}/upload/{uuid}/      raw inputs as uploaded
/// {root}/converted/{uuid}/   converter outputs
/// {root}/sync/{uuid}/        remote-source landing
/// {root}/tmp/{session}/      per-session chunk spool
/// {root}/logs/{uuid}.log     per-job subprocess logs
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Layout {
        Layout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn upload_dir(&self, uuid: &str) -> PathBuf {
        self.root.join("upload").join(uuid)
    }

    pub fn converted_dir(&self, uuid: &str) -> PathBuf {
        self.root.join("converted").join(uuid)
    }

    pub fn sync_dir(&self, uuid: &str) -> PathBuf {
        self.root.join("sync").join(uuid)
    }

    pub fn spool_dir(&self, session_id: &str) -> PathBuf {
        self.root.join("tmp").join(session_id)
    }

    /// Chunk files are named by zero-padded index so a directory listing is
    /// already in assembly order.
    pub fn chunk_path(&self, session_id: &str, chunk_index: u64) -> PathBuf {
        self.spool_dir(session_id).join(format!("{chunk_index:08}"))
    }

    pub fn log_path(&self, uuid: &str) -> PathBuf {
        self.root.join("logs").join(format!("{uuid}.log"))
    }

    /// Create the top-level tree. Idempotent.
    pub async fn ensure(&self) -> std::io::Result<()> {
        for dir in ["upload", "converted", "sync", "tmp", "logs"] {
            tokio::fs::create_dir_all(self.root.join(dir)).await?;
        }
        Ok(())
    }
}
