// Object pinning
//
// While every thread is suspended, object ids handed to the debugger must stay
// valid. The runtime owns the objects; the agent only keeps the set of ids it
// has promised to hold on to.

use crate::types::ObjectId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

#[derive(Debug, Default)]
pub struct ObjectPins {
    engaged: AtomicBool,
    kept: Mutex<HashSet<ObjectId>>,
}

impl ObjectPins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self) {
        if !self.engaged.swap(true, Ordering::SeqCst) {
            debug!("Object pinning engaged");
        }
    }

    /// Drop every kept reference
    pub fn release(&self) {
        if self.engaged.swap(false, Ordering::SeqCst) {
            let released = std::mem::take(&mut *self.kept.lock());
            debug!("Object pinning released ({} objects)", released.len());
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    /// Keep `id` alive while pinning is engaged; null ids are ignored
    pub fn keep(&self, id: ObjectId) {
        if id != 0 && self.is_engaged() {
            self.kept.lock().insert(id);
        }
    }

    pub fn is_pinned(&self, id: ObjectId) -> bool {
        self.kept.lock().contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_only_while_engaged() {
        let pins = ObjectPins::new();
        pins.keep(5);
        assert!(!pins.is_pinned(5));

        pins.engage();
        pins.keep(5);
        pins.keep(0);
        assert!(pins.is_pinned(5));
        assert!(!pins.is_pinned(0));

        pins.release();
        assert!(!pins.is_engaged());
        assert!(!pins.is_pinned(5));
    }
}
