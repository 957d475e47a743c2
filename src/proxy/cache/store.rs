use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tokio::task;
use tracing::{info, trace, warn};

/// Prefix of in-progress writes. Lives in the reserved namespace so no
/// request path can name one.
pub const TEMP_PREFIX: &str = ".gw-tmp-";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create cache directory {}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache path {} exists but is not a directory", path.display())]
    NotADirectory { path: PathBuf },
    #[error("failed to write cache temp file {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to move cache entry into place at {}", path.display())]
    Commit {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read cache entry {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Path-addressed cache tree on disk.
///
/// Entries only ever appear through a rename of a fully written temporary
/// file in the same directory, so readers see either nothing or a complete
/// body. Concurrent writers for one key need no coordination: the last
/// rename wins and every candidate is complete.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Create the cache root if needed and clear temp files left by a crash.
    pub async fn open(root: PathBuf) -> Result<Self> {
        async_fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create cache root {}", root.display()))?;

        let sweep_root = root.clone();
        let removed = task::spawn_blocking(move || remove_orphaned_temp_files(&sweep_root))
            .await
            .map_err(|err| anyhow!("cache temp sweep task failed: {err}"))?;
        if removed > 0 {
            info!(removed, root = %root.display(), "removed orphaned cache temp files");
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn get(&self, directory: &Path, filename: &str) -> Result<Option<Bytes>, StorageError> {
        let path = directory.join(filename);
        match async_fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Read { path, source }),
        }
    }

    pub async fn put(
        &self,
        directory: &Path,
        filename: &str,
        body: &[u8],
    ) -> Result<(), StorageError> {
        ensure_directory(directory).await?;

        let temp_path = directory.join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()));
        if let Err(source) = write_synced(&temp_path, body).await {
            async_fs::remove_file(&temp_path).await.ok();
            return Err(StorageError::Write {
                path: temp_path,
                source,
            });
        }

        let final_path = directory.join(filename);
        if let Err(source) = async_fs::rename(&temp_path, &final_path).await {
            async_fs::remove_file(&temp_path).await.ok();
            return Err(StorageError::Commit {
                path: final_path,
                source,
            });
        }

        trace!(path = %final_path.display(), bytes = body.len(), "stored cache entry");
        Ok(())
    }
}

/// Recursive create where an existing directory, including one created by a
/// racing request, counts as success.
async fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    match async_fs::create_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            match async_fs::metadata(path).await {
                Ok(meta) if meta.is_dir() => Ok(()),
                _ => Err(StorageError::NotADirectory {
                    path: path.to_path_buf(),
                }),
            }
        }
        Err(source) => Err(StorageError::CreateDir {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn write_synced(path: &Path, body: &[u8]) -> io::Result<()> {
    let mut options = async_fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options.open(path).await?;
    file.write_all(body).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

fn remove_orphaned_temp_files(root: &Path) -> usize {
    let mut removed = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, dir = %dir.display(), "failed to scan cache directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(TEMP_PREFIX))
                && fs::remove_file(entry.path()).is_ok()
            {
                removed += 1;
            }
        }
    }
    removed
}
