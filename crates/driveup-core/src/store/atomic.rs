use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Replace `path` with `contents` so readers only ever see the old or the new
/// bytes: write a sibling temp file, fsync it, then rename over the target.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = temp_path_for(path);
    let result = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result?;

    sync_parent_dir(path).await;
    Ok(())
}

/// Remove `path`, treating an already-missing file as success.
pub async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

// Persist the rename itself. Directories cannot be opened for sync on Windows.
#[cfg(unix)]
async fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent).await {
            if let Err(e) = dir.sync_all().await {
                tracing::debug!(dir = %parent.display(), error = %e, "Directory fsync failed");
            }
        }
    }
}

#[cfg(not(unix))]
async fn sync_parent_dir(_path: &Path) {}
