//! Credential lifecycle.
//!
//! - `credential`: the access token record and auth profiles
//! - `token_store`: file-backed cache, optionally encrypted
//! - `cipher`: token file sealing
//! - `secrets`: OS keychain access
//! - `manager`: acquire, refresh and revoke

pub mod cipher;
pub mod credential;
pub mod manager;
pub mod secrets;
pub mod token_store;

pub use cipher::{CipherError, TokenCipher};
pub use credential::{AuthProfile, Credential};
pub use manager::{RevokeReport, TokenManager, TokenStatus};
pub use secrets::SecretStore;
pub use token_store::TokenStore;
