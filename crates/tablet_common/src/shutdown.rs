//! Cooperative cancellation signal for long-running copies.
//!
//! A copy checks the signal between chunk requests. A request already in
//! flight is never interrupted; once it returns, the copy stops issuing new
//! ones and fails with `CopyError::Cancelled`.
//!
//! # Usage
//! ```ignore
//! let signal = client.cancel_signal();
//! std::thread::spawn(move || {
//!     // operator asked to stop
//!     signal.cancel();
//! });
//! if let Err(e) = client.fetch_all(None) {
//!     client.abort()?;
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A clonable cancellation flag shared between a copy and its controller.
#[derive(Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    /// Create a new signal in the non-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Visible to every clone.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation has been requested (non-blocking).
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_visible_to_clones() {
        let signal = CancelSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_cancelled());
        signal.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_cancel_from_other_thread() {
        let signal = CancelSignal::new();
        let s2 = signal.clone();
        std::thread::spawn(move || s2.cancel()).join().unwrap();
        assert!(signal.is_cancelled());
    }
}
