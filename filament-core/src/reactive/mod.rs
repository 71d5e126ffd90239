//! The reactive graph.
//!
//! State lives in [`Atom`]s, derived values in [`Computed`]s, and side
//! effects in [`EffectScheduler`]s created through [`react`] or
//! [`Reactor`]. The graph is pull based: setting an atom advances a
//! global epoch and notifies downstream effect schedulers, but derived
//! values only recompute when read. Dependencies are captured
//! automatically by running derive functions and effect bodies inside a
//! capture frame that records every signal they dereference.
//!
//! Mutations can be batched and undone with [`transact`] and
//! [`transaction`], and signals can carry a bounded history of diffs
//! queryable through `diff_since`.

mod array_set;
mod atom;
mod capture;
mod computed;
mod effect;
mod epoch;
mod history;
mod node;
mod transactions;

pub use atom::{Atom, AtomOptions};
pub use capture::{why_am_i_running, without_capture};
pub use computed::{with_diff, Computed, ComputedOptions, ComputedProperty, Derivation};
pub use effect::{react, EffectHandle, EffectScheduler, Reactor};
pub use epoch::{global_epoch, Epoch};
pub use history::Diffs;
pub use transactions::{in_transaction, transact, transaction, RollbackHandle};

/// Custom equality used for no-op and invalidation cutoffs. Receives the
/// previous and next value.
pub type EqualityFn<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Derives a diff between two values. Receives the previous and next
/// value and the epochs they belong to; returning `None` records a
/// history reset instead of a diff.
pub type ComputeDiffFn<T, D> = Box<dyn Fn(&T, &T, Epoch, Epoch) -> Option<D> + Send + Sync>;
