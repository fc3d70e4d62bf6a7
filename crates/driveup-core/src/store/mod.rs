//! Durable transfer state.

pub mod atomic;
pub mod resume;
pub mod session;

pub use resume::ResumeStore;
pub use session::{session_key, Direction, SessionStatus, TransferSession};
