//! Cooperative cancellation with an optional hard deadline.

use crate::error::OrganizeError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Shared stop signal checked at entry and file boundaries.
///
/// Clones share the same flag. A token built with a deadline also reports
/// itself as cancelled once the deadline passes, so every phase that polls
/// the token honours the hard time limit without extra plumbing.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    started: Instant,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            deadline: None,
        }
    }

    /// A token that also stops once `limit` has elapsed.
    pub fn with_deadline(limit: Option<Duration>) -> Self {
        let mut token = Self::new();
        token.deadline = limit.map(|limit| token.started + limit);
        token
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.timed_out()
    }

    pub fn timed_out(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The error a run should stop with once the token fired.
    pub fn stop_error(&self) -> OrganizeError {
        if self.flag.load(Ordering::SeqCst) {
            OrganizeError::Cancelled
        } else {
            OrganizeError::TimedOut {
                elapsed: self.elapsed(),
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
