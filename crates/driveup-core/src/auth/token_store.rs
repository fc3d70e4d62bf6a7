use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use super::cipher::TokenCipher;
use super::credential::{AuthProfile, Credential};
use crate::error::{Error, Result};
use crate::store::atomic::{remove_if_exists, write_atomic};

/// File-backed credential cache: one record per auth profile at
/// `<dir>/<profile>.json`, optionally sealed with a [`TokenCipher`].
pub struct TokenStore {
    dir: PathBuf,
    cipher: Option<TokenCipher>,
}

impl TokenStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, cipher: None }
    }

    pub fn with_cipher(mut self, cipher: TokenCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the credential for `profile`.
    ///
    /// Returns `Ok(None)` when nothing is stored and `Error::StateCorrupt`
    /// when a record exists but cannot be decoded.
    pub async fn load(&self, profile: AuthProfile) -> Result<Option<Credential>> {
        let path = self.token_path(profile);
        let contents = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::corrupt(&path, e)),
        };

        let plaintext = match self.cipher {
            Some(ref cipher) => cipher.open(&contents).map_err(|e| Error::corrupt(&path, e))?,
            None => contents,
        };

        let credential: Credential =
            serde_json::from_slice(&plaintext).map_err(|e| Error::corrupt(&path, e))?;

        if credential.profile != profile {
            return Err(Error::corrupt(
                &path,
                format!("record belongs to profile '{}'", credential.profile),
            ));
        }

        debug!(profile = %profile, expires_at = %credential.expires_at, "Loaded cached credential");
        Ok(Some(credential))
    }

    /// Persist `credential`, replacing whatever its profile held before.
    pub async fn save(&self, credential: &Credential) -> Result<()> {
        let path = self.token_path(credential.profile);
        let json = serde_json::to_vec_pretty(credential)
            .map_err(|e| Error::Auth(format!("Failed to serialize credential: {}", e)))?;

        let contents = match self.cipher {
            Some(ref cipher) => cipher
                .seal(&json)
                .map_err(|e| Error::Auth(format!("Failed to seal credential: {}", e)))?,
            None => json,
        };

        write_atomic(&path, &contents).await?;
        restrict_permissions(&path).await;
        debug!(profile = %credential.profile, "Saved credential");
        Ok(())
    }

    /// Remove the stored credential for `profile`; missing records are fine.
    pub async fn delete(&self, profile: AuthProfile) -> Result<()> {
        remove_if_exists(&self.token_path(profile)).await?;
        Ok(())
    }

    fn token_path(&self, profile: AuthProfile) -> PathBuf {
        self.dir.join(format!("{}.json", profile.as_str()))
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to restrict token file permissions");
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}
