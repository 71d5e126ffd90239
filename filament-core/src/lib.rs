//! Filament Core
//!
//! This crate implements an incremental, pull-based dependency-tracking
//! engine:
//!
//! - Atoms: mutable source values that notify dependents when set
//! - Computed signals: memoized derived values, recomputed lazily
//! - Effect schedulers: side effects that run once per logical change
//! - Transactions: batched mutations with rollback
//! - Diff history: bounded change logs for incremental recomputation
//!
//! # Architecture
//!
//! The engine is organized around a single dependency graph. Sources and
//! derived values record the epoch (a global logical clock) at which they
//! last changed; dependents compare those epochs against snapshots taken
//! during their last run to decide whether anything needs recomputing.
//! Dependencies are captured automatically: reading a signal inside a
//! computed or effect body registers it as a parent of that computation.
//!
//! # Example
//!
//! ```
//! use filament_core::reactive::{Atom, Computed};
//!
//! let count = Atom::new("count", 1);
//!
//! let doubled = Computed::new("doubled", {
//!     let count = count.clone();
//!     move |_, _| count.get() * 2
//! });
//!
//! assert_eq!(doubled.get(), 2);
//! count.set(5);
//! assert_eq!(doubled.get(), 10);
//! ```

pub mod error;
pub mod reactive;
