//! Dependency capture.
//!
//! While a computed signal or effect body runs, a capture frame records
//! which signals it dereferences, in order, and reconciles that against
//! the dependency list from its previous run.
//!
//! # How It Works
//!
//! Each thread keeps a stack of frames. A frame tracks an `offset` into
//! the capturing node's existing parent list (how many parents have been
//! confirmed present-and-in-order this pass) and a count of brand-new
//! parents. Reading a signal calls [`maybe_capture_parent`]:
//!
//! - A parent absent from the previous list is new: it is written at the
//!   offset, and if the node is actively listening it is attached as a
//!   child immediately so changes during this very pass are not missed.
//! - A parent present but out of order displaces whichever parent sat at
//!   the offset; the displaced one is queued as "maybe removed" and only
//!   detached at the end if it never reappears.
//! - A parent already at the offset just advances the offset.
//!
//! Its epoch is snapshotted into the parallel epoch array either way.
//! Popping the frame detaches parents that fell off the end and truncates
//! the lists. The common case (identical dependency set, same order) is
//! a length comparison and no allocation.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::ReactiveError;
use crate::reactive::node::{attach, detach, DependentNode, SignalNode};

struct ActiveFrame {
    child: Arc<dyn DependentNode>,
    offset: usize,
    num_new_parents: usize,
    maybe_removed: SmallVec<[Arc<dyn SignalNode>; 4]>,
}

enum Frame {
    Active(ActiveFrame),
    /// Pushed by [`without_capture`]: reads under this frame register
    /// nothing against the enclosing computation.
    Suspended,
}

thread_local! {
    static CAPTURE_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard for a capture session. Dropping it pops the frame and
/// reconciles the dependency list, so a panicking computation body still
/// leaves the stack balanced.
pub(crate) struct CaptureGuard {
    _private: (),
}

impl CaptureGuard {
    /// Open a capture frame for `child`.
    pub fn capture(child: Arc<dyn DependentNode>) -> Self {
        CAPTURE_STACK.with(|stack| {
            stack.borrow_mut().push(Frame::Active(ActiveFrame {
                child,
                offset: 0,
                num_new_parents: 0,
                maybe_removed: SmallVec::new(),
            }));
        });
        Self { _private: () }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        stop_capturing();
    }
}

/// Record that `parent` was read by the computation currently capturing,
/// if any. Must be called after the parent's value is up to date.
pub(crate) fn maybe_capture_parent(parent: &Arc<dyn SignalNode>) {
    CAPTURE_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let Some(Frame::Active(frame)) = stack.last_mut() else {
            return;
        };

        let mut list = frame.child.parent_list().lock();
        let idx = list.parents.iter().position(|p| p.id() == parent.id());

        // Four cases:
        // - the child didn't deref this parent last run: idx is None
        // - it did, but in a different order: idx > offset
        // - it did, in the same order: idx == offset
        // - it already deref'd it during this capture pass: idx < offset

        if idx.is_none() {
            frame.num_new_parents += 1;
            if frame.child.is_actively_listening() {
                // Attach now so a change to this parent during the rest
                // of the pass is not missed.
                attach(parent, &frame.child.child_ref());
            }
        }

        match idx {
            Some(i) if i < frame.offset => {
                // Already confirmed this pass; nothing to do.
            }
            idx => {
                if let Some(i) = idx {
                    if i != frame.offset {
                        // Reordered: the parent that held this slot may no
                        // longer be a dependency. Decide when the frame pops.
                        let displaced = list.parents[frame.offset].clone();
                        if !frame.maybe_removed.iter().any(|p| p.id() == displaced.id()) {
                            frame.maybe_removed.push(displaced);
                        }
                    }
                }

                let epoch = parent.last_changed_epoch();
                if frame.offset < list.parents.len() {
                    list.parents[frame.offset] = parent.clone();
                    list.epochs[frame.offset] = epoch;
                } else {
                    list.parents.push(parent.clone());
                    list.epochs.push(epoch);
                }
                frame.offset += 1;
            }
        }
    });
}

fn stop_capturing() {
    let frame = CAPTURE_STACK.with(|stack| stack.borrow_mut().pop());
    let Some(Frame::Active(frame)) = frame else {
        return;
    };

    let child_ref = frame.child.child_ref();
    let mut list = frame.child.parent_list().lock();

    let did_parents_change =
        frame.num_new_parents > 0 || frame.offset != list.parents.len();
    if !did_parents_change {
        return;
    }

    // Everything past the offset is no longer a dependency, unless the
    // same signal also survives at an earlier slot (a duplicate left by
    // reordering).
    for i in frame.offset..list.parents.len() {
        let parent = list.parents[i].clone();
        let first_idx = list
            .parents
            .iter()
            .position(|p| p.id() == parent.id())
            .unwrap_or(i);
        if first_idx >= frame.offset {
            detach(&parent, &child_ref);
        }
    }

    let offset = frame.offset;
    list.parents.truncate(offset);
    list.epochs.truncate(offset);

    for parent in &frame.maybe_removed {
        if !list.parents.iter().any(|p| p.id() == parent.id()) {
            detach(parent, &child_ref);
        }
    }
}

/// Run `f` such that any signal reads inside it are invisible to the
/// enclosing capture frame.
///
/// Useful when an effect needs to dereference a signal without rerunning
/// when that signal changes.
pub fn without_capture<R>(f: impl FnOnce() -> R) -> R {
    struct SuspendGuard;

    impl Drop for SuspendGuard {
        fn drop(&mut self) {
            CAPTURE_STACK.with(|stack| {
                stack.borrow_mut().pop();
            });
        }
    }

    CAPTURE_STACK.with(|stack| stack.borrow_mut().push(Frame::Suspended));
    let _guard = SuspendGuard;
    f()
}

/// Report which of the currently capturing computation's parents changed
/// since it last ran. A debugging aid: call it inside a computed or
/// effect body to find out why the body is running.
///
/// The report is also emitted at debug level via `tracing`.
pub fn why_am_i_running() -> Result<String, ReactiveError> {
    let report = CAPTURE_STACK.with(|stack| {
        let stack = stack.borrow();
        let Some(Frame::Active(frame)) = stack.last() else {
            return Err(ReactiveError::NotCapturing);
        };

        let list = frame.child.parent_list().lock();
        let mut changed = Vec::new();
        for (parent, epoch) in list.parents.iter().zip(list.epochs.iter()) {
            if parent.last_changed_epoch() > *epoch {
                changed.push((
                    parent.name().to_string(),
                    *epoch,
                    parent.last_changed_epoch(),
                ));
            }
        }

        let mut report = String::new();
        if changed.is_empty() {
            let _ = write!(
                report,
                "'{}' is running but none of its parents changed",
                frame.child.name()
            );
        } else {
            let _ = write!(report, "'{}' is running because:", frame.child.name());
            for (name, seen, current) in changed {
                let _ = write!(
                    report,
                    "\n\t'{name}' changed (epoch {current}, last seen {seen})"
                );
            }
        }
        Ok(report)
    })?;

    tracing::debug!(target: "filament::capture", "{report}");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn why_am_i_running_needs_a_frame() {
        assert!(matches!(
            why_am_i_running(),
            Err(ReactiveError::NotCapturing)
        ));
    }

    #[test]
    fn without_capture_is_reentrant() {
        let value = without_capture(|| without_capture(|| 7));
        assert_eq!(value, 7);
    }
}
