//! Effect scheduling.
//!
//! Effects are the graph's sinks: they run a side-effecting closure when
//! the signals it reads change. An [`EffectScheduler`] decides *whether*
//! the closure should run after a flush reaches it, and a deferral hook
//! decides *when* (immediately by default, or handed to an external
//! executor such as an animation-frame batcher).
//!
//! # How It Works
//!
//! A notification flush traverses downstream from the changed atoms and
//! calls [`maybe_schedule_effect`] on every scheduler it reaches. The
//! scheduler bails out cheaply when it is stopped, when it already ran
//! this epoch, or when pulling its parents shows none actually changed
//! (an upstream equality cutoff absorbed the change). Only then does the
//! closure run, inside a capture frame that rebuilds the dependency list.
//!
//! [`maybe_schedule_effect`]: crate::reactive::node::DependentNode::maybe_schedule_effect

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::reactive::array_set::ArraySet;
use crate::reactive::capture::CaptureGuard;
use crate::reactive::epoch::{global_epoch, Epoch, START_EPOCH};
use crate::reactive::node::{
    attach, detach, have_parents_changed, ChildRef, DependentNode, NodeId, ParentList,
};

type RunFn = Box<dyn Fn(Epoch) + Send + Sync>;
type DeferFn = Box<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

pub(crate) struct EffectInner {
    id: NodeId,
    name: String,
    actively_listening: AtomicBool,
    last_traversed: AtomicU64,
    last_reacted: AtomicU64,
    schedule_count: AtomicU64,
    parents: Mutex<ParentList>,
    run: RunFn,
    defer: Option<DeferFn>,
    weak_self: Weak<EffectInner>,
}

impl EffectInner {
    /// Execute unless nothing changed since the last run. Deferred
    /// executors can invoke a stale callback long after the schedule that
    /// produced it, or several of them back to back.
    fn maybe_execute(&self) {
        let epoch = global_epoch();
        if self.last_reacted.load(Ordering::Relaxed) == epoch {
            return;
        }
        let has_parents = !self.parents.lock().parents.is_empty();
        if has_parents && !have_parents_changed(self) {
            self.last_reacted.store(epoch, Ordering::Relaxed);
            return;
        }
        self.execute();
    }

    fn execute(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let child: Arc<dyn DependentNode> = this;
        let _guard = CaptureGuard::capture(child);
        (self.run)(self.last_reacted.load(Ordering::Relaxed));
        self.last_reacted.store(global_epoch(), Ordering::Relaxed);
    }

    fn attach_to_parents(&self) {
        self.actively_listening.store(true, Ordering::Relaxed);
        let child_ref = self.child_ref();
        let parents: Vec<_> = self.parents.lock().parents.to_vec();
        for parent in parents {
            attach(&parent, &child_ref);
        }
    }

    fn detach_from_parents(&self) {
        self.actively_listening.store(false, Ordering::Relaxed);
        let child_ref = self.child_ref();
        let parents: Vec<_> = self.parents.lock().parents.to_vec();
        for parent in parents {
            detach(&parent, &child_ref);
        }
    }
}

impl Drop for EffectInner {
    fn drop(&mut self) {
        // Dropped while attached: remove this node's edges so parents do
        // not accumulate dead child references. Removal compares by node
        // ID, which is still valid even though the weak self is gone.
        if self.actively_listening.load(Ordering::Relaxed) {
            self.detach_from_parents();
        }
    }
}

impl DependentNode for EffectInner {
    fn name(&self) -> &str {
        &self.name
    }

    fn parent_list(&self) -> &Mutex<ParentList> {
        &self.parents
    }

    fn is_actively_listening(&self) -> bool {
        self.actively_listening.load(Ordering::Relaxed)
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
        // Effects are sinks; a flush stops here.
        None
    }

    fn maybe_schedule_effect(&self) {
        if !self.actively_listening.load(Ordering::Relaxed) {
            return;
        }

        let epoch = global_epoch();
        if self.last_reacted.load(Ordering::Relaxed) == epoch {
            return;
        }

        // Pulling the parents may show the change was absorbed upstream
        // by an equality cutoff. Mark this epoch as seen either way.
        let has_parents = !self.parents.lock().parents.is_empty();
        if has_parents && !have_parents_changed(self) {
            self.last_reacted.store(epoch, Ordering::Relaxed);
            return;
        }

        self.schedule_count.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target: "filament::effect", name = %self.name, "scheduling effect");

        match &self.defer {
            Some(defer) => {
                let weak = self.weak_self.clone();
                defer(Box::new(move || {
                    // The effect may have been stopped or dropped between
                    // scheduling and execution.
                    if let Some(inner) = weak.upgrade() {
                        if inner.actively_listening.load(Ordering::Relaxed) {
                            inner.maybe_execute();
                        }
                    }
                }));
            }
            None => self.execute(),
        }
    }
}

/// Decides whether and when an effect closure reruns in response to
/// changes in the signals it reads.
pub struct EffectScheduler {
    inner: Arc<EffectInner>,
}

impl EffectScheduler {
    /// Create a scheduler that runs `run` synchronously whenever its
    /// dependencies change. The closure receives the epoch of its own
    /// previous run.
    pub fn new(name: impl Into<String>, run: impl Fn(Epoch) + Send + Sync + 'static) -> Self {
        Self::build(name.into(), Box::new(run), None)
    }

    /// Create a scheduler that hands execution to `defer` instead of
    /// running synchronously. The deferral callback receives a closure to
    /// invoke when the external executor is ready; by then the effect may
    /// have been stopped, in which case the closure is a no-op.
    pub fn with_deferral(
        name: impl Into<String>,
        run: impl Fn(Epoch) + Send + Sync + 'static,
        defer: impl Fn(Box<dyn FnOnce() + Send>) + Send + Sync + 'static,
    ) -> Self {
        Self::build(name.into(), Box::new(run), Some(Box::new(defer)))
    }

    fn build(name: String, run: RunFn, defer: Option<DeferFn>) -> Self {
        let inner = Arc::new_cyclic(|weak_self| EffectInner {
            id: NodeId::new(),
            name,
            actively_listening: AtomicBool::new(false),
            last_traversed: AtomicU64::new(START_EPOCH),
            last_reacted: AtomicU64::new(START_EPOCH),
            schedule_count: AtomicU64::new(0),
            parents: Mutex::new(ParentList::default()),
            run,
            defer,
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    /// Start listening: register as a dependent of the parents recorded
    /// during the previous run, if any.
    pub fn attach(&self) {
        self.inner.attach_to_parents();
    }

    /// Stop listening and unregister from all parents.
    pub fn detach(&self) {
        self.inner.detach_from_parents();
    }

    /// Run the closure now, inside a capture frame.
    pub fn execute(&self) {
        self.inner.execute();
    }

    /// How many times this effect has been scheduled to run.
    pub fn schedule_count(&self) -> u64 {
        self.inner.schedule_count.load(Ordering::Relaxed)
    }

    pub fn is_actively_listening(&self) -> bool {
        self.inner.actively_listening.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

/// A running effect created by [`react`]. Dropping the handle stops the
/// effect.
pub struct EffectHandle {
    scheduler: EffectScheduler,
}

impl EffectHandle {
    /// Stop the effect. It will not run again unless restarted through a
    /// new [`react`] call.
    pub fn stop(&self) {
        self.scheduler.detach();
    }
}

impl Drop for EffectHandle {
    fn drop(&mut self) {
        self.scheduler.detach();
    }
}

/// Run `f` now and rerun it whenever a signal it reads changes, until the
/// returned handle is stopped or dropped.
pub fn react(name: impl Into<String>, f: impl Fn() + Send + Sync + 'static) -> EffectHandle {
    let scheduler = EffectScheduler::new(name, move |_| f());
    scheduler.attach();
    scheduler.execute();
    EffectHandle { scheduler }
}

/// An effect that can be stopped and started repeatedly.
///
/// Starting after a stop only reruns the closure if a dependency changed
/// in between.
pub struct Reactor {
    scheduler: EffectScheduler,
}

impl Reactor {
    pub fn new(name: impl Into<String>, f: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            scheduler: EffectScheduler::new(name, move |_| f()),
        }
    }

    pub fn with_deferral(
        name: impl Into<String>,
        f: impl Fn() + Send + Sync + 'static,
        defer: impl Fn(Box<dyn FnOnce() + Send>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            scheduler: EffectScheduler::with_deferral(name, move |_| f(), defer),
        }
    }

    /// Begin listening. Runs the closure immediately on first start, and
    /// on later starts only if a dependency changed while stopped.
    pub fn start(&self) {
        self.scheduler.attach();
        self.scheduler.inner.maybe_schedule_effect();
    }

    /// Stop listening. The dependency list is kept so a later start can
    /// check whether anything changed.
    pub fn stop(&self) {
        self.scheduler.detach();
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_actively_listening()
    }

    pub fn scheduler(&self) -> &EffectScheduler {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI32;

    use super::*;
    use crate::reactive::atom::Atom;

    #[test]
    fn react_runs_immediately_and_on_change() {
        let count = Atom::new("count", 1);
        let seen = Arc::new(AtomicI32::new(0));

        let count_in_effect = count.clone();
        let seen_in_effect = seen.clone();
        let handle = react("observer", move || {
            seen_in_effect.store(count_in_effect.get(), Ordering::SeqCst);
        });

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        count.set(7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);

        handle.stop();
        count.set(100);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn dropping_the_handle_stops_the_effect() {
        let count = Atom::new("count", 1);
        let runs = Arc::new(AtomicI32::new(0));

        let count_in_effect = count.clone();
        let runs_in_effect = runs.clone();
        let handle = react("observer", move || {
            count_in_effect.get();
            runs_in_effect.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        drop(handle);
        count.set(2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deferred_effects_wait_for_the_executor() {
        let count = Atom::new("count", 1);
        let runs = Arc::new(AtomicI32::new(0));
        let queue: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>> = Arc::new(Mutex::new(Vec::new()));

        let count_in_effect = count.clone();
        let runs_in_effect = runs.clone();
        let queue_in_defer = queue.clone();
        let scheduler = EffectScheduler::with_deferral(
            "deferred",
            move |_| {
                count_in_effect.get();
                runs_in_effect.fetch_add(1, Ordering::SeqCst);
            },
            move |run| queue_in_defer.lock().push(run),
        );
        scheduler.attach();
        scheduler.execute();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        count.set(2);
        // Scheduled but not yet executed.
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.schedule_count(), 1);

        for run in queue.lock().drain(..) {
            run();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stopping_before_the_executor_runs_cancels_the_work() {
        let count = Atom::new("count", 1);
        let runs = Arc::new(AtomicI32::new(0));
        let queue: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>> = Arc::new(Mutex::new(Vec::new()));

        let count_in_effect = count.clone();
        let runs_in_effect = runs.clone();
        let queue_in_defer = queue.clone();
        let scheduler = EffectScheduler::with_deferral(
            "deferred",
            move |_| {
                count_in_effect.get();
                runs_in_effect.fetch_add(1, Ordering::SeqCst);
            },
            move |run| queue_in_defer.lock().push(run),
        );
        scheduler.attach();
        scheduler.execute();

        count.set(2);
        scheduler.detach();

        for run in queue.lock().drain(..) {
            run();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn restarting_a_reactor_only_reruns_if_something_changed() {
        let count = Atom::new("count", 1);
        let runs = Arc::new(AtomicI32::new(0));

        let count_in_effect = count.clone();
        let runs_in_effect = runs.clone();
        let reactor = Reactor::new("reactor", move || {
            count_in_effect.get();
            runs_in_effect.fetch_add(1, Ordering::SeqCst);
        });

        reactor.start();
        assert!(reactor.is_running());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        reactor.stop();
        reactor.start();
        // Nothing changed while stopped.
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        reactor.stop();
        count.set(2);
        reactor.start();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
