//! Derived signals.
//!
//! A [`Computed`] memoizes a pure function of other signals. It is pull
//! based: nothing recomputes when sources change, only when someone asks
//! for the value and a dependency's epoch no longer matches the snapshot
//! taken during the previous run.
//!
//! # How It Works
//!
//! Reading a computed first checks two short circuits: the value was
//! already validated this epoch, or every parent still carries the epoch
//! recorded last run (each parent is pulled up to date before comparing,
//! so staleness propagates through chains of computeds). Otherwise the
//! derive function reruns inside a capture frame, which rebuilds the
//! parent list from the signals the function actually dereferenced this
//! time. An equality check suppresses downstream invalidation when the
//! recomputed value is unchanged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::reactive::array_set::ArraySet;
use crate::reactive::capture::{maybe_capture_parent, CaptureGuard};
use crate::reactive::epoch::{global_epoch, Epoch, START_EPOCH};
use crate::reactive::history::{Diffs, HistoryBuffer};
use crate::reactive::node::{
    have_parents_changed, ChildRef, DependentNode, NodeId, ParentList, SignalNode,
};
use crate::reactive::{ComputeDiffFn, EqualityFn};

/// What a derive function produces: the next value, optionally paired
/// with a diff describing how it differs from the previous value.
pub enum Derivation<T, D = ()> {
    Value(T),
    WithDiff(T, D),
}

/// Pair a derived value with the diff that produced it. Sugar for
/// [`Derivation::WithDiff`] inside derive functions.
pub fn with_diff<T, D>(value: T, diff: D) -> Derivation<T, D> {
    Derivation::WithDiff(value, diff)
}

/// Configuration for [`Computed::with_options`].
pub struct ComputedOptions<T, D = ()> {
    /// How many diffs to retain for [`Computed::diff_since`].
    pub history_length: usize,
    /// Derive a diff when the derive function returned a bare value.
    pub compute_diff: Option<ComputeDiffFn<T, D>>,
    /// Custom equality for the invalidation cutoff. Defaults to
    /// `PartialEq`.
    pub is_equal: Option<EqualityFn<T>>,
}

impl<T, D> Default for ComputedOptions<T, D> {
    fn default() -> Self {
        Self {
            history_length: 0,
            compute_diff: None,
            is_equal: None,
        }
    }
}

type DeriveFn<T, D> = Box<dyn Fn(Option<&T>, Epoch) -> Derivation<T, D> + Send + Sync>;

struct ComputedState<T, D> {
    value: Option<T>,
    history: Option<HistoryBuffer<D>>,
}

pub(crate) struct ComputedInner<T, D> {
    id: NodeId,
    name: String,
    last_changed: AtomicU64,
    last_checked: AtomicU64,
    last_traversed: AtomicU64,
    state: Mutex<ComputedState<T, D>>,
    parents: Mutex<ParentList>,
    children: Mutex<ArraySet<ChildRef>>,
    derive: DeriveFn<T, D>,
    compute_diff: Option<ComputeDiffFn<T, D>>,
    is_equal: Option<EqualityFn<T>>,
    weak_self: Weak<ComputedInner<T, D>>,
}

impl<T, D> ComputedInner<T, D>
where
    T: Clone + Send + Sync + PartialEq + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// Bring the cached value up to date, recomputing only if a parent
    /// changed since the last run.
    fn compute(&self) {
        let now = global_epoch();
        let last_checked = self.last_checked.load(Ordering::Relaxed);
        let initialized = last_checked != START_EPOCH;

        if initialized && last_checked == now {
            return;
        }

        if initialized && !have_parents_changed(self) {
            self.last_checked.store(now, Ordering::Relaxed);
            return;
        }

        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let previous = self.state.lock().value.clone();

        // The derive runs inside a capture frame so the parent list is
        // rebuilt from what it actually reads this time. The guard pops
        // and reconciles even if the derive panics, in which case the
        // previous value and epochs stay as they were.
        let derivation = {
            let child: Arc<dyn DependentNode> = this;
            let _guard = CaptureGuard::capture(child);
            (self.derive)(previous.as_ref(), last_checked)
        };

        let (next, diff) = match derivation {
            Derivation::Value(value) => (value, None),
            Derivation::WithDiff(value, diff) => (value, Some(diff)),
        };

        let epoch = global_epoch();
        let mut state = self.state.lock();

        let unchanged = match (&state.value, &self.is_equal) {
            (Some(prev), Some(is_equal)) => is_equal(prev, &next),
            (Some(prev), None) => *prev == next,
            (None, _) => false,
        };
        if unchanged {
            self.last_checked.store(epoch, Ordering::Relaxed);
            return;
        }

        // A history entry only makes sense once there is a previous value
        // to diff against.
        if state.value.is_some() && state.history.is_some() {
            let from = self.last_changed.load(Ordering::Relaxed);
            let diff = diff.or_else(|| {
                let prev = state.value.as_ref()?;
                let compute_diff = self.compute_diff.as_ref()?;
                compute_diff(prev, &next, from, epoch)
            });
            if let Some(history) = &mut state.history {
                history.push_entry(from, epoch, diff);
            }
        }

        state.value = Some(next);
        self.last_changed.store(epoch, Ordering::Relaxed);
        self.last_checked.store(epoch, Ordering::Relaxed);
    }
}

impl<T, D> SignalNode for ComputedInner<T, D>
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
        self.compute();
    }

    fn children(&self) -> &Mutex<ArraySet<ChildRef>> {
        &self.children
    }

    fn as_child_ref(&self) -> Option<ChildRef> {
        Some(ChildRef {
            id: self.id,
            node: self.weak_self.clone(),
        })
    }

    fn parent_snapshot(&self) -> Vec<Arc<dyn SignalNode>> {
        self.parents.lock().parents.to_vec()
    }
}

impl<T, D> DependentNode for ComputedInner<T, D>
where
    T: Clone + Send + Sync + PartialEq + 'static,
    D: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn parent_list(&self) -> &Mutex<ParentList> {
        &self.parents
    }

    fn is_actively_listening(&self) -> bool {
        !self.children.lock().is_empty()
    }

    fn child_ref(&self) -> ChildRef {
        ChildRef {
            id: self.id,
            node: self.weak_self.clone(),
        }
    }

    fn last_traversed_epoch(&self) -> Epoch {
        self.last_traversed.load(Ordering::Relaxed)
    }

    fn set_last_traversed_epoch(&self, epoch: Epoch) {
        self.last_traversed.store(epoch, Ordering::Relaxed);
    }

    fn children_for_traversal(&self) -> Option<&Mutex<ArraySet<ChildRef>>> {
        Some(&self.children)
    }

    fn maybe_schedule_effect(&self) {
        // Computed signals never schedule anything themselves.
    }
}

/// A memoized signal derived from other signals.
///
/// Cloning the handle shares the underlying state.
pub struct Computed<T, D = ()> {
    inner: Arc<ComputedInner<T, D>>,
}

impl<T, D> Clone for Computed<T, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Computed<T, ()>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Create a computed signal from a plain derive function.
    ///
    /// The function receives the previous value (if any) and the epoch of
    /// the previous run, and returns the next value.
    pub fn new(
        name: impl Into<String>,
        derive: impl Fn(Option<&T>, Epoch) -> T + Send + Sync + 'static,
    ) -> Self {
        Self::with_options(
            name,
            move |prev, epoch| Derivation::Value(derive(prev, epoch)),
            ComputedOptions::default(),
        )
    }
}

impl<T, D> Computed<T, D>
where
    T: Clone + Send + Sync + PartialEq + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// Create a computed signal whose derive function may attach a diff
    /// to each new value via [`with_diff`].
    pub fn with_options(
        name: impl Into<String>,
        derive: impl Fn(Option<&T>, Epoch) -> Derivation<T, D> + Send + Sync + 'static,
        options: ComputedOptions<T, D>,
    ) -> Self {
        let history = if options.history_length > 0 {
            Some(HistoryBuffer::new(options.history_length))
        } else {
            None
        };

        let inner = Arc::new_cyclic(|weak_self| ComputedInner {
            id: NodeId::new(),
            name: name.into(),
            last_changed: AtomicU64::new(START_EPOCH),
            last_checked: AtomicU64::new(START_EPOCH),
            last_traversed: AtomicU64::new(START_EPOCH),
            state: Mutex::new(ComputedState {
                value: None,
                history,
            }),
            parents: Mutex::new(ParentList::default()),
            children: Mutex::new(ArraySet::default()),
            derive: Box::new(derive),
            compute_diff: options.compute_diff,
            is_equal: options.is_equal,
            weak_self: weak_self.clone(),
        });

        Self { inner }
    }

    /// Read the value, recomputing if stale, and register it as a
    /// dependency of the capturing computation, if any.
    pub fn get(&self) -> T {
        self.inner.compute();
        let node: Arc<dyn SignalNode> = self.inner.clone();
        maybe_capture_parent(&node);
        self.cached()
    }

    /// Read the value, recomputing if stale, without registering a
    /// dependency.
    pub fn get_untracked(&self) -> T {
        self.inner.compute();
        self.cached()
    }

    /// The diffs for every change after `epoch`, or [`Diffs::Reset`] when
    /// the history no longer reaches back that far. Recomputes first, so
    /// the answer reflects the current value.
    pub fn diff_since(&self, epoch: Epoch) -> Diffs<D> {
        self.inner.compute();
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

    /// The epoch of the last actual change to the derived value.
    pub fn last_changed_epoch(&self) -> Epoch {
        self.inner.last_changed.load(Ordering::Relaxed)
    }

    /// The name given at construction.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn cached(&self) -> T {
        self.inner
            .state
            .lock()
            .value
            .clone()
            .expect("computed value present after compute")
    }
}

/// A lazily constructed [`Computed`], for deriving signals stored in
/// statics or struct fields without building them eagerly.
///
/// ```
/// use filament_core::reactive::{Atom, ComputedProperty};
///
/// static DOUBLED: ComputedProperty<i32> = ComputedProperty::new("doubled");
///
/// let count = Atom::new("count", 2);
/// let count_for_derive = count.clone();
/// let doubled = DOUBLED.get_with(move |_, _| count_for_derive.get() * 2);
/// assert_eq!(doubled, 4);
/// ```
pub struct ComputedProperty<T, D = ()> {
    name: &'static str,
    slot: OnceLock<Computed<T, D>>,
}

impl<T, D> ComputedProperty<T, D>
where
    T: Clone + Send + Sync + PartialEq + 'static,
    D: Clone + Send + Sync + 'static,
{
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: OnceLock::new(),
        }
    }

    /// The computed signal, building it with `init` on first use.
    pub fn get_or_init(&self, init: impl FnOnce() -> Computed<T, D>) -> &Computed<T, D> {
        self.slot.get_or_init(init)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> ComputedProperty<T, ()>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Read the value, constructing the computed from `derive` on first
    /// use. Later calls ignore `derive` and reuse the stored signal.
    pub fn get_with(&self, derive: impl Fn(Option<&T>, Epoch) -> T + Send + Sync + 'static) -> T {
        self.get_or_init(|| Computed::new(self.name, derive)).get()
    }
}
