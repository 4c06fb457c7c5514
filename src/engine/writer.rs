// Coalescing state for index persistence: one armed timer, two callback generations.

use std::mem;

use crate::error::PersistError;

pub type WriteCallback = Box<dyn FnOnce(Result<(), PersistError>) + Send>;

/// Callbacks waiting on index writes.
///
/// `current` always belongs to the next write to begin. While a write is in flight,
/// new callbacks go to `next` instead: the bytes being written were snapshotted
/// before those callers asked, so they must wait for the following cycle.
#[derive(Default)]
pub struct WriteQueue {
    armed: bool,
    in_flight: bool,
    current: Vec<WriteCallback>,
    next: Vec<WriteCallback>,
}

impl WriteQueue {
    /// Queue a callback. Returns `true` when the caller has to arm the debounce timer.
    pub fn enqueue(&mut self, callback: Option<WriteCallback>) -> bool {
        if let Some(cb) = callback {
            if self.in_flight {
                self.next.push(cb);
            } else {
                self.current.push(cb);
            }
        }
        if self.armed {
            false
        } else {
            self.armed = true;
            true
        }
    }

    /// Timer fired: mark the write in flight and hand over the callbacks it satisfies.
    pub fn begin(&mut self) -> Vec<WriteCallback> {
        self.armed = false;
        self.in_flight = true;
        mem::take(&mut self.current)
    }

    /// Write finished: callbacks deferred during the write move up a generation.
    pub fn finish(&mut self) {
        self.in_flight = false;
        self.current.append(&mut self.next);
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn pending(&self) -> usize {
        self.current.len() + self.next.len()
    }
}
