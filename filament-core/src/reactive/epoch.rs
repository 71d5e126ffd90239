//! The epoch clock.
//!
//! A single global, monotonically increasing integer is the logical clock
//! against which every staleness decision is made. It advances exactly once
//! per committed atom mutation (not per derived recomputation), plus once
//! more when a transaction aborts so that cached values computed during the
//! transaction are invalidated.

use std::sync::atomic::{AtomicU64, Ordering};

/// The logical clock type. Epochs only ever move forward.
pub type Epoch = u64;

/// The epoch a derived value starts on, before it has ever been computed.
/// The global clock starts above this, so "never computed" is unambiguous.
pub(crate) const START_EPOCH: Epoch = 0;

static GLOBAL_EPOCH: AtomicU64 = AtomicU64::new(START_EPOCH + 1);

/// Get the current global epoch.
pub fn global_epoch() -> Epoch {
    GLOBAL_EPOCH.load(Ordering::Relaxed)
}

/// Advance the global epoch, returning the new value.
pub(crate) fn advance_global_epoch() -> Epoch {
    GLOBAL_EPOCH.fetch_add(1, Ordering::Relaxed) + 1
}
