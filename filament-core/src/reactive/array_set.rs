//! An adaptive set for child bookkeeping.
//!
//! Most signals have a handful of dependents, so an `ArraySet` stores its
//! elements in a plain array and does membership checks by linear scan.
//! Past a size threshold it converts itself to a hash set. Either way the
//! same methods add, remove, and visit the items.

use std::collections::HashSet;
use std::hash::Hash;

use smallvec::SmallVec;

/// The maximum number of elements kept in the array representation.
pub(crate) const ARRAY_SIZE_THRESHOLD: usize = 32;

enum Storage<T> {
    Array(SmallVec<[T; 8]>),
    Set(HashSet<T>),
}

/// A small ownership-free collection that behaves as a linear array below
/// a size threshold and as a hash set above it.
pub(crate) struct ArraySet<T> {
    storage: Storage<T>,
}

impl<T> Default for ArraySet<T> {
    fn default() -> Self {
        Self {
            storage: Storage::Array(SmallVec::new()),
        }
    }
}

impl<T: Eq + Hash + Clone> ArraySet<T> {
    /// Get whether this set has any elements.
    pub fn is_empty(&self) -> bool {
        match &self.storage {
            Storage::Array(array) => array.is_empty(),
            Storage::Set(set) => set.is_empty(),
        }
    }

    /// The number of elements in the set.
    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Array(array) => array.len(),
            Storage::Set(set) => set.len(),
        }
    }

    /// Add an element if it is not already present. Returns true if the
    /// element was added.
    pub fn add(&mut self, elem: T) -> bool {
        match &mut self.storage {
            Storage::Array(array) => {
                if array.contains(&elem) {
                    return false;
                }

                if array.len() < ARRAY_SIZE_THRESHOLD {
                    array.push(elem);
                } else {
                    // Too big for linear scans; convert to a hash set.
                    let mut set: HashSet<T> = array.drain(..).collect();
                    set.insert(elem);
                    self.storage = Storage::Set(set);
                }

                true
            }
            Storage::Set(set) => set.insert(elem),
        }
    }

    /// Remove an element if it is present. Returns true if the element was
    /// removed.
    pub fn remove(&mut self, elem: &T) -> bool {
        match &mut self.storage {
            Storage::Array(array) => match array.iter().position(|e| e == elem) {
                Some(idx) => {
                    array.swap_remove(idx);
                    true
                }
                None => false,
            },
            Storage::Set(set) => set.remove(elem),
        }
    }

    /// Run a callback for each element in the set.
    pub fn visit(&self, mut visitor: impl FnMut(&T)) {
        match &self.storage {
            Storage::Array(array) => {
                for elem in array {
                    visitor(elem);
                }
            }
            Storage::Set(set) => {
                for elem in set {
                    visitor(elem);
                }
            }
        }
    }

    /// Collect the elements into a vector. Used to take a snapshot before
    /// traversing, so no lock is held while visiting other nodes.
    pub fn to_vec(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        self.visit(|elem| out.push(elem.clone()));
        out
    }
}
