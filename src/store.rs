use std::io;
use std::path::PathBuf;
use tokio::fs::{self, File};

/// Uploads are duplicated into this subdirectory of the store root after
/// they complete.
pub const BACKUP_DIR: &str = "backup";

/// The local file storage the transfer engine reads from and writes to.
/// Names arriving off the wire are resolved under a fixed root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> FileStore {
        FileStore { root: root.into() }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name.trim_start_matches('/'))
    }

    /// Opens a file for a download and reports its size, so oversized
    /// sources can be refused before any block is sent.
    pub async fn open_for_read(&self, name: &str) -> io::Result<(File, u64)> {
        let file = File::open(self.resolve(name)).await?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Opens (or truncates) a file as the destination of an upload.
    pub async fn open_for_write(&self, name: &str) -> io::Result<File> {
        File::create(self.resolve(name)).await
    }

    pub async fn remove(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(name)).await
    }

    /// Copies a completed upload into the backup directory. Best-effort: a
    /// failed backup is logged and never rolls back the transfer.
    pub async fn duplicate(&self, name: &str) {
        match self.try_duplicate(name).await {
            Ok(path) => log::info!("backup created: {}", path.display()),
            Err(e) => log::warn!("backup of '{}' failed: {}", name, e),
        }
    }

    async fn try_duplicate(&self, name: &str) -> io::Result<PathBuf> {
        let dir = self.root.join(BACKUP_DIR);
        fs::create_dir_all(&dir).await?;
        let dst = dir.join(name.trim_start_matches('/'));
        fs::copy(self.resolve(name), &dst).await?;
        Ok(dst)
    }
}
