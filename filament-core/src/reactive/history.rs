//! Bounded diff history.
//!
//! A `HistoryBuffer` is a fixed-capacity ring of `(from_epoch, to_epoch,
//! diff)` tuples kept alongside a signal's value. It answers "what changed
//! since epoch E" without holding unbounded history: when the requested
//! range has fallen off the ring, the caller gets the reset sentinel and
//! must treat the change as a full replace.

use crate::reactive::epoch::Epoch;

/// The result of asking a signal for its diffs since an epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diffs<D> {
    /// The ordered diffs for every committed change after the requested
    /// epoch, oldest first.
    Changes(Vec<D>),
    /// Not enough history was retained to answer; the caller must treat
    /// the change as a full replacement of the value.
    Reset,
}

impl<D> Diffs<D> {
    /// Whether this result is the reset sentinel.
    pub fn is_reset(&self) -> bool {
        matches!(self, Diffs::Reset)
    }

    /// Unpack the diff list, if any.
    pub fn into_changes(self) -> Option<Vec<D>> {
        match self {
            Diffs::Changes(changes) => Some(changes),
            Diffs::Reset => None,
        }
    }
}

/// A ring buffer of diffs, each tagged with the epoch range it covers.
pub(crate) struct HistoryBuffer<D> {
    index: usize,
    buffer: Vec<Option<(Epoch, Epoch, D)>>,
}

impl<D: Clone> HistoryBuffer<D> {
    pub fn new(capacity: usize) -> Self {
        Self {
            index: 0,
            buffer: std::iter::repeat_with(|| None).take(capacity).collect(),
        }
    }

    /// Record a change covering `(from_epoch, to_epoch]`. A `None` diff is
    /// the reset sentinel: the history is no longer continuous, so the
    /// whole buffer is discarded.
    pub fn push_entry(&mut self, from_epoch: Epoch, to_epoch: Epoch, diff: Option<D>) {
        match diff {
            Some(diff) => {
                self.buffer[self.index] = Some((from_epoch, to_epoch, diff));
                self.index = (self.index + 1) % self.buffer.len();
            }
            None => self.clear(),
        }
    }

    /// Drop all recorded history.
    pub fn clear(&mut self) {
        self.index = 0;
        for slot in &mut self.buffer {
            *slot = None;
        }
    }

    /// The diffs for every change after `since`, oldest first, or `None`
    /// if the buffer no longer reaches back that far.
    pub fn changes_since(&self, since: Epoch) -> Option<Vec<D>> {
        let capacity = self.buffer.len();
        let mut out = Vec::new();

        // Walk from the newest entry backwards until an entry that starts
        // at or before the requested epoch closes the range.
        for i in 0..capacity {
            let slot = (self.index + capacity - 1 - i) % capacity;
            let (from_epoch, to_epoch, diff) = self.buffer[slot].as_ref()?;

            if *to_epoch <= since {
                return Some(out);
            }

            out.insert(0, diff.clone());

            if *from_epoch <= since {
                return Some(out);
            }
        }

        None
    }
}
