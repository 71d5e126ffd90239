//! Transactions and change flushing.
//!
//! A transaction batches atom mutations: dependents observe nothing until
//! the outermost transaction commits, at which point a single flush
//! notifies everything downstream of every atom touched. Each transaction
//! frame records the first-touch original value of every atom set inside
//! it, so an abort (explicit rollback or a panic) can restore them.
//!
//! # How It Works
//!
//! The transaction stack is thread local. An atom that changes reports
//! here: with no frame on the stack the change flushes immediately;
//! otherwise the outermost original value is recorded and the flush is
//! deferred. Committing an inner frame folds its records into the parent
//! frame, so a later abort of the parent still restores the values from
//! before the inner transaction.
//!
//! Flushing traverses the children of the changed atoms, deduplicating
//! shared subgraphs by stamping each node with the flush epoch, and asks
//! every effect scheduler it reaches whether it should run. Mutating an
//! atom while that traversal is running panics, which keeps the notified
//! state consistent.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::ReactiveError;
use crate::reactive::array_set::ArraySet;
use crate::reactive::epoch::{advance_global_epoch, global_epoch, Epoch};
use crate::reactive::node::{ChildRef, DependentNode, NodeId, SourceNode};

struct TransactionFrame {
    /// The value each touched source had when this frame first saw it,
    /// keyed by node and kept in touch order.
    initial_values: IndexMap<NodeId, (Arc<dyn SourceNode>, Box<dyn Any + Send>)>,
    /// Set while an abort is restoring values, so the restores themselves
    /// are not recorded as new touches.
    rolling_back: bool,
}

thread_local! {
    static TRANSACTION_STACK: RefCell<Vec<TransactionFrame>> = const { RefCell::new(Vec::new()) };
    static IS_REACTING: Cell<bool> = const { Cell::new(false) };
}

/// Panics if called while a flush is notifying dependents. Mutating state
/// mid-flush would leave some dependents notified against one value and
/// some against another.
pub(crate) fn ensure_can_mutate(name: &str) {
    if IS_REACTING.with(Cell::get) {
        panic!("{}", ReactiveError::ReentrantMutation(name.to_owned()));
    }
}

/// Called by a source after its value actually changed. Either defers to
/// the enclosing transaction or flushes immediately.
pub(crate) fn source_did_change(
    source: &Arc<dyn SourceNode>,
    previous: impl FnOnce() -> Box<dyn Any + Send>,
) {
    let deferred = TRANSACTION_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.last_mut() {
            Some(frame) => {
                if !frame.rolling_back {
                    frame
                        .initial_values
                        .entry(source.id())
                        .or_insert_with(|| (source.clone(), previous()));
                }
                true
            }
            None => false,
        }
    });

    if !deferred {
        flush_changes(std::iter::once(source.clone()));
    }
}

/// Notify everything downstream of `sources` exactly once.
fn flush_changes(sources: impl IntoIterator<Item = Arc<dyn SourceNode>>) {
    // A commit can happen inside an effect body (an empty `transact`
    // costs nothing to open), so the flag must be restored rather than
    // cleared: the outer flush is still iterating its sinks.
    struct ReactingGuard {
        was_reacting: bool,
    }

    impl Drop for ReactingGuard {
        fn drop(&mut self) {
            IS_REACTING.with(|flag| flag.set(self.was_reacting));
        }
    }

    let _guard = ReactingGuard {
        was_reacting: IS_REACTING.with(|flag| flag.replace(true)),
    };

    let epoch = global_epoch();
    let mut sinks: Vec<Arc<dyn DependentNode>> = Vec::new();

    fn traverse(
        children: &Mutex<ArraySet<ChildRef>>,
        epoch: Epoch,
        sinks: &mut Vec<Arc<dyn DependentNode>>,
    ) {
        // Snapshot before recursing; visiting other nodes must not hold
        // this lock.
        let snapshot = children.lock().to_vec();
        for child_ref in snapshot {
            let Some(child) = child_ref.node.upgrade() else {
                continue;
            };
            if child.last_traversed_epoch() == epoch {
                continue;
            }
            child.set_last_traversed_epoch(epoch);
            match child.children_for_traversal() {
                Some(grandchildren) => traverse(grandchildren, epoch, sinks),
                None => sinks.push(child),
            }
        }
    }

    for source in sources {
        traverse(source.children(), epoch, &mut sinks);
    }

    for sink in sinks {
        sink.maybe_schedule_effect();
    }
}

/// Whether the calling thread is inside a transaction.
pub fn in_transaction() -> bool {
    TRANSACTION_STACK.with(|stack| !stack.borrow().is_empty())
}

/// Requests that the enclosing [`transaction`] roll back instead of
/// committing.
pub struct RollbackHandle {
    requested: Cell<bool>,
}

impl RollbackHandle {
    /// Mark the transaction for rollback. The transaction body keeps
    /// running; the restore happens when it returns.
    pub fn rollback(&self) {
        self.requested.set(true);
    }
}

/// Run `f` in a new transaction frame, even if one is already open.
///
/// Changes made inside are invisible to effects until the outermost
/// transaction commits. If `f` panics, or calls
/// [`RollbackHandle::rollback`], every atom it touched is restored to its
/// value from before the transaction (and the panic resumes).
pub fn transaction<R>(f: impl FnOnce(&RollbackHandle) -> R) -> R {
    struct AbortOnUnwind {
        armed: Cell<bool>,
    }

    impl Drop for AbortOnUnwind {
        fn drop(&mut self) {
            if self.armed.get() {
                abort_top();
            }
        }
    }

    TRANSACTION_STACK.with(|stack| {
        stack.borrow_mut().push(TransactionFrame {
            initial_values: IndexMap::new(),
            rolling_back: false,
        });
    });
    tracing::trace!(target: "filament::transactions", "transaction opened");

    let guard = AbortOnUnwind {
        armed: Cell::new(true),
    };
    let handle = RollbackHandle {
        requested: Cell::new(false),
    };

    let result = f(&handle);
    guard.armed.set(false);

    if handle.requested.get() {
        abort_top();
    } else {
        commit_top();
    }

    result
}

/// Run `f` inside the enclosing transaction if one is open, or in a new
/// one otherwise. The usual way to batch changes.
pub fn transact<R>(f: impl FnOnce() -> R) -> R {
    if in_transaction() {
        f()
    } else {
        transaction(|_| f())
    }
}

/// Pop the top frame. Inner frames fold their first-touch records into
/// the parent; the outermost frame flushes.
fn commit_top() {
    let frame = TRANSACTION_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let frame = stack
            .pop()
            .expect("transaction stack empty during commit");

        if let Some(parent) = stack.last_mut() {
            for (id, entry) in frame.initial_values {
                parent.initial_values.entry(id).or_insert(entry);
            }
            None
        } else {
            Some(frame)
        }
    });

    if let Some(frame) = frame {
        tracing::trace!(
            target: "filament::transactions",
            touched = frame.initial_values.len(),
            "transaction committed"
        );
        flush_changes(
            frame
                .initial_values
                .into_values()
                .map(|(source, _)| source),
        );
    }
}

/// Restore every touched source to its first-touch value, then commit the
/// now-restored frame so the restoration itself propagates.
fn abort_top() {
    // Cached derived values computed during the transaction must not
    // survive it, even ones whose sources were restored to equal values.
    advance_global_epoch();

    let entries = TRANSACTION_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let frame = stack
            .last_mut()
            .expect("transaction stack empty during abort");
        frame.rolling_back = true;
        std::mem::take(&mut frame.initial_values)
    });

    tracing::debug!(
        target: "filament::transactions",
        touched = entries.len(),
        "transaction rolled back"
    );

    for (source, value) in entries.values() {
        source.restore(value.as_ref());
        // The buffered diffs describe changes that officially never
        // happened.
        source.clear_history();
    }

    TRANSACTION_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        if let Some(frame) = stack.last_mut() {
            frame.initial_values = entries;
            frame.rolling_back = false;
        }
    });

    commit_top();
}
