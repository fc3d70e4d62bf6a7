use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::models::FileMetadata;

/// Read buffer used while hashing
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Content fingerprint of a local file: `sha256:<hex>` over its bytes.
///
/// Hashing runs on the blocking pool so large files do not stall the runtime.
pub async fn fingerprint_file(path: &Path) -> io::Result<String> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// Fingerprint of a remote revision, used to decide whether a partial
/// download still belongs to the file currently on the server.
pub fn remote_fingerprint(metadata: &FileMetadata) -> String {
    metadata.revision_tag()
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
