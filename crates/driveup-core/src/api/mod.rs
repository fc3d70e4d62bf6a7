//! Remote Drive access.
//!
//! - `transport`: the traits the core is written against
//! - `client`: reqwest implementation over the Drive v3 REST API
//! - `oauth`: device and loopback authorization flows for the same client
//! - `error`: transport-level failures and their classification

pub mod client;
pub mod error;
pub mod oauth;
pub mod transport;

pub use client::DriveClient;
pub use error::ApiError;
pub use oauth::{AuthPrompt, OAuthClient};
pub use transport::{AuthTransport, DriveTransport};
