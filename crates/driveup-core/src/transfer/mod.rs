//! Chunked, resumable byte transfer.

pub mod chunk;
pub mod fingerprint;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod stall;

pub use chunk::{ChunkAck, ChunkRange};
pub use progress::{NoProgress, Progress, ProgressDispatcher, ProgressSink};
pub use retry::RetryPolicy;
pub use scheduler::ChunkScheduler;
pub use stall::Activity;
