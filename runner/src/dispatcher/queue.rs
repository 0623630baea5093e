use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::trace;

/// Result of asking the queue for work without blocking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    Case(usize),
    /// nothing the slot may take right now, but work is still outstanding
    Wait,
    /// nothing pending and nothing running
    Done,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<usize>,
    in_flight: BTreeSet<usize>,
    /// slot that ran the previous attempt of a re-queued case
    last_slot: HashMap<usize, usize>,
}

impl QueueState {
    fn take(&mut self, slot: usize, slots: usize) -> Pull {
        let last_slot = &self.last_slot;
        let position = self
            .pending
            .iter()
            .position(|case| slots <= 1 || last_slot.get(case) != Some(&slot));

        match position.and_then(|position| self.pending.remove(position)) {
            Some(case) => {
                self.in_flight.insert(case);
                Pull::Case(case)
            }
            None if self.pending.is_empty() && self.in_flight.is_empty() => Pull::Done,
            None => Pull::Wait,
        }
    }
}

/// FIFO of pending cases shared by a fixed number of slots.
///
/// A case is either pending or in flight, never both. Retries go to the back of the queue and
/// are not handed to the slot that ran the failed attempt unless it is the only slot.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
    slots: usize,
}

impl WorkQueue {
    pub fn new(cases: impl IntoIterator<Item = usize>, slots: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: cases.into_iter().collect(),
                ..QueueState::default()
            }),
            changed: Condvar::new(),
            slots,
        }
    }

    pub fn try_pull(&self, slot: usize) -> Pull {
        self.state.lock().take(slot, self.slots)
    }

    /// Block until a case is available for `slot`, `None` once all work is done
    pub fn pull(&self, slot: usize) -> Option<usize> {
        let mut state = self.state.lock();

        loop {
            match state.take(slot, self.slots) {
                Pull::Case(case) => {
                    trace!(slot = slot, case = case, "Pulled case");
                    return Some(case);
                }
                Pull::Done => {
                    self.changed.notify_all();
                    return None;
                }
                Pull::Wait => self.changed.wait(&mut state),
            }
        }
    }

    /// put a failed case back at the end of the queue
    pub fn requeue(&self, case: usize, slot: usize) {
        let mut state = self.state.lock();

        state.in_flight.remove(&case);
        state.last_slot.insert(case, slot);
        state.pending.push_back(case);

        self.changed.notify_all();
    }

    /// mark a case as finished for good
    pub fn complete(&self, case: usize) {
        let mut state = self.state.lock();

        state.in_flight.remove(&case);
        state.last_slot.remove(&case);

        self.changed.notify_all();
    }

    pub fn pending(&self) -> Vec<usize> {
        self.state.lock().pending.iter().copied().collect()
    }

    pub fn in_flight(&self) -> Vec<usize> {
        self.state.lock().in_flight.iter().copied().collect()
    }
}
