use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use keyring::Entry;
use tracing::info;

use super::cipher::{TokenCipher, KEY_LEN};

const SERVICE_NAME: &str = "driveup";

/// Keychain account holding the token-file encryption key
const TOKEN_KEY_ACCOUNT: &str = "token-encryption-key";

/// OS keychain access for values that should not live in config files.
pub struct SecretStore;

impl SecretStore {
    /// Retrieve the OAuth client secret stored for `client_id`, if any
    pub fn client_secret(client_id: &str) -> Result<Option<String>> {
        let entry = Entry::new(SERVICE_NAME, &Self::client_account(client_id))
            .context("Failed to create keyring entry")?;
        match entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve client secret from keychain"),
        }
    }

    /// Store the OAuth client secret for `client_id` in the OS keychain
    pub fn store_client_secret(client_id: &str, secret: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, &Self::client_account(client_id))
            .context("Failed to create keyring entry")?;
        entry
            .set_password(secret)
            .context("Failed to store client secret in keychain")?;
        Ok(())
    }

    /// Load the token encryption key, creating and storing one on first use
    pub fn token_key() -> Result<[u8; KEY_LEN]> {
        let entry = Entry::new(SERVICE_NAME, TOKEN_KEY_ACCOUNT)
            .context("Failed to create keyring entry")?;

        match entry.get_password() {
            Ok(encoded) => {
                let bytes = STANDARD
                    .decode(encoded.trim())
                    .context("Token encryption key in keychain is not valid base64")?;
                bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("Token encryption key in keychain has wrong length"))
            }
            Err(keyring::Error::NoEntry) => {
                let key = TokenCipher::generate_key();
                entry
                    .set_password(&STANDARD.encode(key))
                    .context("Failed to store token encryption key in keychain")?;
                info!("Generated new token encryption key");
                Ok(key)
            }
            Err(e) => Err(e).context("Failed to read token encryption key from keychain"),
        }
    }

    fn client_account(client_id: &str) -> String {
        format!("client-secret:{}", client_id)
    }
}
