//! Cooperative cancellation
//!
//! Background windows granted by the OS can be revoked at any moment. Work
//! checks a shared token before each network call and each cache write and
//! bails out with [`Cancelled`] when the window has been taken away.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Raised at a check point after cancellation was requested.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cancelled before {step}")]
pub struct Cancelled {
    pub step: &'static str,
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Check point. `step` names what was about to happen.
    pub fn check(&self, step: &'static str) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled { step })
        } else {
            Ok(())
        }
    }
}

/// True when an `anyhow` error chain is a cancellation.
pub fn is_cancelled_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Cancelled>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(clone.check("fetch").is_ok());

        token.cancel();
        assert!(clone.is_cancelled());
        assert_eq!(clone.check("fetch"), Err(Cancelled { step: "fetch" }));
    }

    #[test]
    fn test_detects_cancellation_in_anyhow() {
        let err: anyhow::Error = Cancelled { step: "write" }.into();
        assert!(is_cancelled_error(&err));
        assert!(!is_cancelled_error(&anyhow::anyhow!("boom")));
    }
}
