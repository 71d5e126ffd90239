//! Mutable source signals.
//!
//! An [`Atom`] holds a plain value and is the only place state enters the
//! graph. Setting it advances the global epoch, optionally records a diff
//! in a bounded history buffer, and notifies dependents (immediately, or
//! at commit when inside a transaction).
//!
//! # How It Works
//!
//! The handle is a thin wrapper over an `Arc`'d inner node, so cloning an
//! atom clones a reference to the same state. The inner node implements
//! the graph traits: as a `SignalNode` it is always up to date (`pull` is
//! a no-op), and as a `SourceNode` the transaction manager can snapshot
//! and restore it.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::reactive::array_set::ArraySet;
use crate::reactive::capture::maybe_capture_parent;
use crate::reactive::epoch::{advance_global_epoch, Epoch};
use crate::reactive::history::{Diffs, HistoryBuffer};
use crate::reactive::node::{ChildRef, NodeId, SignalNode, SourceNode};
use crate::reactive::transactions::{ensure_can_mutate, source_did_change};
use crate::reactive::{ComputeDiffFn, EqualityFn};

/// Configuration for [`Atom::with_options`].
pub struct AtomOptions<T, D = ()> {
    /// How many diffs to retain. Zero disables history: [`Atom::diff_since`]
    /// then always answers [`Diffs::Reset`] for epochs before a change.
    pub history_length: usize,
    /// Derive a diff between the previous and next value when one is not
    /// passed explicitly. Without it, plain `set` calls break the history.
    pub compute_diff: Option<ComputeDiffFn<T, D>>,
    /// Custom equality for the no-op check. Defaults to `PartialEq`.
    pub is_equal: Option<EqualityFn<T>>,
}

impl<T, D> Default for AtomOptions<T, D> {
    fn default() -> Self {
        Self {
            history_length: 0,
            compute_diff: None,
            is_equal: None,
        }
    }
}

struct AtomState<T, D> {
    value: T,
    history: Option<HistoryBuffer<D>>,
}

pub(crate) struct AtomInner<T, D> {
    id: NodeId,
    name: String,
    last_changed: AtomicU64,
    state: Mutex<AtomState<T, D>>,
    children: Mutex<ArraySet<ChildRef>>,
    compute_diff: Option<ComputeDiffFn<T, D>>,
    is_equal: Option<EqualityFn<T>>,
    weak_self: Weak<AtomInner<T, D>>,
}

impl<T, D> AtomInner<T, D>
where
    T: Clone + Send + Sync + PartialEq + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// The set path shared by `set`, `set_with_diff`, and transaction
    /// rollback. `diff` is the caller-provided diff, if any.
    fn set_value(&self, value: T, diff: Option<D>) {
        ensure_can_mutate(&self.name);

        let mut state = self.state.lock();

        let unchanged = match &self.is_equal {
            Some(is_equal) => is_equal(&state.value, &value),
            None => state.value == value,
        };
        if unchanged {
            return;
        }

        let previous_epoch = self.last_changed.load(Ordering::Relaxed);
        let epoch = advance_global_epoch();

        if state.history.is_some() {
            let diff = diff.or_else(|| {
                let compute_diff = self.compute_diff.as_ref()?;
                compute_diff(&state.value, &value, previous_epoch, epoch)
            });
            if let Some(history) = &mut state.history {
                history.push_entry(previous_epoch, epoch, diff);
            }
        }

        let previous = std::mem::replace(&mut state.value, value);
        self.last_changed.store(epoch, Ordering::Relaxed);
        drop(state);

        if let Some(inner) = self.weak_self.upgrade() {
            let source: Arc<dyn SourceNode> = inner;
            source_did_change(&source, move || Box::new(previous));
        }
    }
}

impl<T, D> SignalNode for AtomInner<T, D>
where
    T: Clone + Send + Sync + PartialEq + 'static,
    D: Clone + Send + Sync + 'static,
{
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn last_changed_epoch(&self) -> Epoch {
        self.last_changed.load(Ordering::Relaxed)
    }

    fn pull(&self) {
        // Atoms are always up to date.
    }

    fn children(&self) -> &Mutex<ArraySet<ChildRef>> {
        &self.children
    }

    fn as_child_ref(&self) -> Option<ChildRef> {
        None
    }

    fn parent_snapshot(&self) -> Vec<Arc<dyn SignalNode>> {
        Vec::new()
    }
}

impl<T, D> SourceNode for AtomInner<T, D>
where
    T: Clone + Send + Sync + PartialEq + 'static,
    D: Clone + Send + Sync + 'static,
{
    fn restore(&self, value: &(dyn Any + Send)) {
        if let Some(value) = value.downcast_ref::<T>() {
            self.set_value(value.clone(), None);
        }
    }

    fn clear_history(&self) {
        if let Some(history) = &mut self.state.lock().history {
            history.clear();
        }
    }
}

/// A mutable source signal.
///
/// Cloning the handle shares the underlying state. The diff type `D`
/// defaults to `()` for atoms whose changes are not tracked as diffs.
pub struct Atom<T, D = ()> {
    inner: Arc<AtomInner<T, D>>,
}

impl<T, D> Clone for Atom<T, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Atom<T, ()>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Create an atom with default options (no history, `PartialEq`
    /// equality).
    pub fn new(name: impl Into<String>, value: T) -> Self {
        Self::with_options(name, value, AtomOptions::default())
    }
}

impl<T, D> Atom<T, D>
where
    T: Clone + Send + Sync + PartialEq + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// Create an atom with explicit options.
    pub fn with_options(name: impl Into<String>, value: T, options: AtomOptions<T, D>) -> Self {
        let history = if options.history_length > 0 {
            Some(HistoryBuffer::new(options.history_length))
        } else {
            None
        };

        let inner = Arc::new_cyclic(|weak_self| AtomInner {
            id: NodeId::new(),
            name: name.into(),
            last_changed: AtomicU64::new(crate::reactive::epoch::global_epoch()),
            state: Mutex::new(AtomState {
                value,
                history,
            }),
            children: Mutex::new(ArraySet::default()),
            compute_diff: options.compute_diff,
            is_equal: options.is_equal,
            weak_self: weak_self.clone(),
        });

        Self { inner }
    }

    /// Read the value, registering it as a dependency of the capturing
    /// computation, if any.
    pub fn get(&self) -> T {
        let node: Arc<dyn SignalNode> = self.inner.clone();
        maybe_capture_parent(&node);
        self.inner.state.lock().value.clone()
    }

    /// Read the value without registering a dependency.
    pub fn get_untracked(&self) -> T {
        self.inner.state.lock().value.clone()
    }

    /// Replace the value. If a `compute_diff` was configured, the diff it
    /// derives is recorded; otherwise history (if any) is broken.
    pub fn set(&self, value: T) {
        self.inner.set_value(value, None);
    }

    /// Replace the value and record `diff` as the change description.
    pub fn set_with_diff(&self, value: T, diff: D) {
        self.inner.set_value(value, Some(diff));
    }

    /// Replace the value with a function of the current value. The state
    /// lock is not held while `f` runs, so the closure may read other
    /// signals, including ones derived from this atom.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let current = self.get_untracked();
        let next = f(&current);
        self.inner.set_value(next, None);
    }

    /// The diffs for every change after `epoch`, or [`Diffs::Reset`] when
    /// the history no longer reaches back that far.
    pub fn diff_since(&self, epoch: Epoch) -> Diffs<D> {
        let node: Arc<dyn SignalNode> = self.inner.clone();
        maybe_capture_parent(&node);

        if epoch >= self.inner.last_changed.load(Ordering::Relaxed) {
            return Diffs::Changes(Vec::new());
        }

        let state = self.inner.state.lock();
        match &state.history {
            Some(history) => match history.changes_since(epoch) {
                Some(changes) => Diffs::Changes(changes),
                None => Diffs::Reset,
            },
            None => Diffs::Reset,
        }
    }

    /// The epoch of the last change to this atom.
    pub fn last_changed_epoch(&self) -> Epoch {
        self.inner.last_changed.load(Ordering::Relaxed)
    }

    /// The name given at construction, used in logs and panic messages.
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}
