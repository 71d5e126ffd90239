//! End-to-end tests for the reactive graph: laziness, batching,
//! rollback, and dependency reconciliation across module boundaries.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use filament_core::reactive::{
    react, transact, transaction, why_am_i_running, with_diff, without_capture, Atom,
    AtomOptions, Computed, ComputedOptions, Derivation, Diffs, Reactor,
};

#[test]
fn derived_values_recompute_only_when_read() {
    let runs = Arc::new(AtomicI32::new(0));
    let a = Atom::new("a", 1);

    let b = Computed::new("b", {
        let a = a.clone();
        let runs = runs.clone();
        move |_, _| {
            runs.fetch_add(1, Ordering::SeqCst);
            a.get() * 2
        }
    });

    assert_eq!(b.get(), 2);
    assert_eq!(b.get(), 2);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Setting alone recomputes nothing; the work happens on the next read.
    a.set(5);
    a.set(6);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    assert_eq!(b.get(), 12);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn chains_propagate_staleness_lazily() {
    let runs = Arc::new(AtomicI32::new(0));
    let a = Atom::new("a", 1);

    let b = Computed::new("b", {
        let a = a.clone();
        move |_, _| a.get() + 1
    });
    let c = Computed::new("c", {
        let b = b.clone();
        let runs = runs.clone();
        move |_, _| {
            runs.fetch_add(1, Ordering::SeqCst);
            b.get() + 1
        }
    });

    assert_eq!(c.get(), 3);
    a.set(10);
    assert_eq!(c.get(), 12);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // An absorbed change upstream never reaches the tail of the chain:
    // the middle value is recomputed during the staleness check and found
    // equal, so the tail's parent epoch still matches.
    a.set(10);
    assert_eq!(c.get(), 12);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn diamond_dependencies_run_the_effect_once() {
    let a = Atom::new("a", 1);
    let left = Computed::new("left", {
        let a = a.clone();
        move |_, _| a.get() + 1
    });
    let right = Computed::new("right", {
        let a = a.clone();
        move |_, _| a.get() * 10
    });

    let runs = Arc::new(AtomicI32::new(0));
    let seen = Arc::new(AtomicI32::new(0));
    let _handle = react("join", {
        let left = left.clone();
        let right = right.clone();
        let runs = runs.clone();
        let seen = seen.clone();
        move || {
            runs.fetch_add(1, Ordering::SeqCst);
            seen.store(left.get() + right.get(), Ordering::SeqCst);
        }
    });

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(seen.load(Ordering::SeqCst), 12);

    // One change, two paths, one run: the flush deduplicates the shared
    // sink and the effect sees a consistent pair of values.
    a.set(2);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(seen.load(Ordering::SeqCst), 23);
}

#[test]
fn transactions_batch_effect_runs() {
    let a = Atom::new("a", 1);
    let b = Atom::new("b", 2);
    let runs = Arc::new(AtomicI32::new(0));
    let sum = Arc::new(AtomicI32::new(0));

    let _handle = react("sum", {
        let a = a.clone();
        let b = b.clone();
        let runs = runs.clone();
        let sum = sum.clone();
        move || {
            runs.fetch_add(1, Ordering::SeqCst);
            sum.store(a.get() + b.get(), Ordering::SeqCst);
        }
    });
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    transact({
        let a = a.clone();
        let b = b.clone();
        move || {
            a.set(10);
            b.set(20);
        }
    });

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(sum.load(Ordering::SeqCst), 30);
}

#[test]
fn rollback_is_invisible_except_for_the_restore() {
    let a = Atom::new("a", 1);
    let observed = Arc::new(Mutex::new(Vec::new()));

    let _handle = react("observer", {
        let a = a.clone();
        let observed = observed.clone();
        move || observed.lock().push(a.get())
    });

    transaction({
        let a = a.clone();
        move |rollback| {
            a.set(2);
            a.set(3);
            rollback.rollback();
        }
    });

    // The effect never saw the intermediate values. The restore itself
    // advances the epoch, so it is observed exactly once.
    assert_eq!(a.get(), 1);
    assert_eq!(*observed.lock(), vec![1, 1]);
}

#[test]
fn rollback_resets_diff_history() {
    let a = Atom::with_options(
        "a",
        0,
        AtomOptions {
            history_length: 8,
            compute_diff: Some(Box::new(|prev, next, _, _| Some(next - prev))),
            ..Default::default()
        },
    );

    let start = a.last_changed_epoch();
    a.set(5);
    assert_eq!(a.diff_since(start), Diffs::Changes(vec![5]));

    transaction({
        let a = a.clone();
        move |rollback| {
            a.set(100);
            rollback.rollback();
        }
    });

    // The aborted change and its diff officially never happened, and the
    // buffer cannot vouch for anything older either.
    assert_eq!(a.get(), 5);
    assert_eq!(a.diff_since(start), Diffs::Reset);
}

#[test]
fn rollback_leaves_a_forward_then_backward_diff_pair() {
    let a = Atom::new("a", 1);
    let b = Computed::with_options(
        "b",
        {
            let a = a.clone();
            move |prev: Option<&i32>, _| {
                let next = a.get() * 2;
                match prev {
                    Some(prev) => with_diff(next, next - prev),
                    None => Derivation::Value(next),
                }
            }
        },
        ComputedOptions {
            history_length: 8,
            ..Default::default()
        },
    );

    assert_eq!(b.get(), 2);
    let start = b.last_changed_epoch();

    transaction({
        let a = a.clone();
        let b = b.clone();
        move |rollback| {
            a.set(5);
            // Reading inside the transaction sees the in-flight value.
            assert_eq!(b.get(), 10);
            rollback.rollback();
        }
    });

    // The derived history records the change and its undo, not silence:
    // a reader replaying diffs from `start` lands back on the same value.
    assert_eq!(b.get(), 2);
    assert_eq!(b.diff_since(start), Diffs::Changes(vec![8, -8]));
}

#[test]
fn committed_transactions_keep_diff_continuity() {
    let a = Atom::with_options(
        "a",
        0,
        AtomOptions {
            history_length: 8,
            compute_diff: Some(Box::new(|prev, next, _, _| Some(next - prev))),
            ..Default::default()
        },
    );

    let start = a.last_changed_epoch();
    transact({
        let a = a.clone();
        move || {
            a.set(3);
            a.set(10);
        }
    });

    assert_eq!(a.diff_since(start), Diffs::Changes(vec![3, 7]));
}

#[test]
fn conditional_dependencies_are_dropped_when_unread() {
    let flag = Atom::new("flag", true);
    let x = Atom::new("x", 10);
    let y = Atom::new("y", 20);
    let runs = Arc::new(AtomicI32::new(0));

    let _handle = react("conditional", {
        let flag = flag.clone();
        let x = x.clone();
        let y = y.clone();
        let runs = runs.clone();
        move || {
            runs.fetch_add(1, Ordering::SeqCst);
            if flag.get() {
                x.get();
            } else {
                y.get();
            }
        }
    });
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // The untaken branch is not a dependency.
    y.set(21);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    flag.set(false);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // The branches have swapped roles.
    x.set(11);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    y.set(22);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[test]
fn read_order_changes_are_reconciled() {
    let swap = Atom::new("swap", false);
    let a = Atom::new("a", 1);
    let b = Atom::new("b", 100);

    let joined = Computed::new("joined", {
        let swap = swap.clone();
        let a = a.clone();
        let b = b.clone();
        move |_, _| {
            if swap.get() {
                (b.get(), a.get())
            } else {
                (a.get(), b.get())
            }
        }
    });

    assert_eq!(joined.get(), (1, 100));
    swap.set(true);
    assert_eq!(joined.get(), (100, 1));

    // Both remain live dependencies after the reorder.
    a.set(2);
    assert_eq!(joined.get(), (100, 2));
    b.set(200);
    assert_eq!(joined.get(), (200, 2));
}

#[test]
fn without_capture_reads_are_not_dependencies() {
    let tracked = Atom::new("tracked", 1);
    let peeked = Atom::new("peeked", 10);
    let runs = Arc::new(AtomicI32::new(0));

    let _handle = react("peeker", {
        let tracked = tracked.clone();
        let peeked = peeked.clone();
        let runs = runs.clone();
        move || {
            runs.fetch_add(1, Ordering::SeqCst);
            tracked.get();
            without_capture(|| peeked.get());
        }
    });
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    peeked.set(11);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    tracked.set(2);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
#[should_panic(expected = "while effects are being flushed")]
fn mutating_an_atom_during_a_flush_panics() {
    let a = Atom::new("a", 0);
    let b = Atom::new("b", 0);

    let _handle = react("writer", {
        let a = a.clone();
        let b = b.clone();
        move || {
            if a.get() > 0 {
                b.set(1);
            }
        }
    });

    a.set(1);
}

#[test]
fn an_empty_commit_inside_an_effect_keeps_the_flush_guard_armed() {
    let a = Atom::new("a", 0);
    let b = Atom::new("b", 0);
    let set_panicked = Arc::new(AtomicI32::new(0));

    let _handle = react("nested-committer", {
        let a = a.clone();
        let b = b.clone();
        let set_panicked = set_panicked.clone();
        move || {
            if a.get() > 0 {
                // Committing an (empty) transaction mid-flush must not
                // disarm the reentrancy guard for the rest of the flush.
                transact(|| {});
                let caught =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| b.set(42)));
                set_panicked.store(caught.is_err() as i32, Ordering::SeqCst);
            }
        }
    });

    a.set(1);
    assert_eq!(set_panicked.load(Ordering::SeqCst), 1);
    assert_eq!(b.get(), 0);
}

#[test]
fn deferred_reactors_batch_until_the_executor_runs() {
    let a = Atom::new("a", 1);
    let runs = Arc::new(AtomicI32::new(0));
    let queue: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>> = Arc::new(Mutex::new(Vec::new()));

    let reactor = Reactor::with_deferral(
        "deferred",
        {
            let a = a.clone();
            let runs = runs.clone();
            move || {
                a.get();
                runs.fetch_add(1, Ordering::SeqCst);
            }
        },
        {
            let queue = queue.clone();
            move |run| queue.lock().push(run)
        },
    );

    reactor.start();
    for run in queue.lock().drain(..) {
        run();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    a.set(2);
    a.set(3);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let pending: Vec<_> = queue.lock().drain(..).collect();
    for run in pending {
        run();
    }
    // Two schedules, but the second found nothing newer to do after the
    // first already caught up.
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn why_am_i_running_reports_the_changed_parent() {
    let a = Atom::new("interesting-input", 1);
    let reports = Arc::new(Mutex::new(Vec::new()));

    let _handle = react("curious", {
        let a = a.clone();
        let reports = reports.clone();
        move || {
            // Ask before reading: the read refreshes the recorded parent
            // epoch, which would hide the culprit.
            reports.lock().push(why_am_i_running());
            a.get();
        }
    });

    a.set(2);

    let reports = reports.lock();
    assert_eq!(reports.len(), 2);
    // First run: nothing had changed yet.
    assert!(reports[0].as_ref().is_ok_and(|r| r.contains("none of its parents")));
    // Second run: the atom is named as the culprit.
    assert!(reports[1]
        .as_ref()
        .is_ok_and(|r| r.contains("interesting-input")));
}

#[test]
fn computed_diffs_survive_batched_updates() {
    let items = Atom::new("items", vec![1, 2]);

    let count = Computed::with_options(
        "count",
        {
            let items = items.clone();
            move |prev: Option<&usize>, _| {
                let next = items.get().len();
                match prev {
                    Some(prev) => with_diff(next, next as i64 - *prev as i64),
                    None => Derivation::Value(next),
                }
            }
        },
        ComputedOptions {
            history_length: 8,
            ..Default::default()
        },
    );

    assert_eq!(count.get(), 2);
    let start = count.last_changed_epoch();

    transact({
        let items = items.clone();
        move || {
            items.update(|v| {
                let mut v = v.clone();
                v.push(3);
                v
            });
        }
    });
    assert_eq!(count.get(), 3);

    items.update(|v| v[..1].to_vec());
    assert_eq!(count.get(), 1);

    assert_eq!(count.diff_since(start), Diffs::Changes(vec![1, -2]));
}
