//! Idle detection for remote operations.
//!
//! A transfer is stalled when no bytes move for the stall timeout, not when
//! a whole chunk takes longer than it. The transport calls
//! [`Activity::touch`] each time a body frame goes out or comes in, and the
//! scheduler races the operation against [`Activity::idle_for`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// Shared "bytes last moved at" marker for one attempt.
#[derive(Debug, Clone)]
pub struct Activity {
    last: Arc<Mutex<Instant>>,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn touch(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolves once `idle` has elapsed without a [`touch`](Self::touch).
    pub async fn idle_for(&self, idle: Duration) {
        loop {
            let deadline = self.last() + idle;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}
