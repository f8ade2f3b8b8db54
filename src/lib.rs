//! Browser-driven harvest-and-relay pipeline: pull newly-posted intelligence
//! records from one internal portal with up to two accounts, then relay the
//! downloaded files as chat attachments into a group on a second portal,
//! deduplicating across cycles with a time cursor and an on-disk ledger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod config;
pub mod download;
pub mod error;
pub mod harvest;
pub mod ledger;
pub mod pipeline;
pub mod relay;
pub mod selector;
pub mod session;

/// Cooperative stop flag shared between the control surface and the worker.
/// Checked at account, row, artifact and poll boundaries; an operation
/// already in flight finishes before the stop takes effect.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_shared_across_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
