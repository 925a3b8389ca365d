use crate::errors::VipError;
use crate::platform::CoreMask;
use crate::task::TaskId;
use crate::utils::Signal;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::time::Duration;

#[cfg(test)]
mod tests;

/// Capacity of the FIFO variant.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Ordering policy of a device's submission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Bounded, insertion order.
    Fifo { capacity: usize },

    /// Unbounded, highest priority first then insertion order.
    Priority,
}

impl Default for QueueKind {
    fn default() -> Self {
        QueueKind::Fifo {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// A pending submission. The TCB it refers to is looked up by `task_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueEntry {
    pub(crate) task_id: TaskId,

    /// Cores that must all be free before the entry can be read.
    pub(crate) cores: CoreMask,

    pub(crate) priority: u32,

    /// Duration of the previous run of the same subtask, if any.
    pub(crate) estimated_time: Option<Duration>,
}

/// Selects entries drained by [`SubmitQueue::clean`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CleanFilter {
    All,

    /// Every subtask of one descriptor.
    Descriptor(TaskId),

    /// A single subtask.
    Entry(TaskId),
}

impl CleanFilter {
    fn matches(&self, entry: &QueueEntry) -> bool {
        match self {
            CleanFilter::All => true,
            CleanFilter::Descriptor(id) => entry.task_id.descriptor() == id.descriptor(),
            CleanFilter::Entry(id) => entry.task_id == *id,
        }
    }
}

// Ordered map standing in for the max-heap: iteration yields the highest
// priority first and, within one priority, the oldest entry first. The FIFO
// variant pins every priority to 0 which reduces the key to insertion order.
type Key = (Reverse<u32>, u64);

struct QueueState {
    entries: BTreeMap<Key, QueueEntry>,
    next_seq: u64,
    stopped: bool,
}

/// Per-device queue of submissions waiting for free cores.
///
/// `read` never blocks: callers pair it with [`SubmitQueue::wait`], which is
/// woken by every `write`, `notify` and `stop`.
pub(crate) struct SubmitQueue {
    kind: QueueKind,
    state: Mutex<QueueState>,
    ready: Signal,
}

impl SubmitQueue {
    pub(crate) fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            state: Mutex::new(QueueState {
                entries: BTreeMap::new(),
                next_seq: 0,
                stopped: false,
            }),
            ready: Signal::auto_reset(),
        }
    }

    /// Appends an entry. Fails when the queue is stopped or, for the FIFO
    /// variant, full.
    pub(crate) fn write(&self, entry: QueueEntry) -> Result<(), VipError> {
        {
            let mut state = self.state.lock();

            if state.stopped {
                return Err(VipError::failure("submit queue is stopped"));
            }

            let priority = match self.kind {
                QueueKind::Fifo { capacity } => {
                    if state.entries.len() >= capacity {
                        return Err(VipError::out_of_resource(format!(
                            "submit queue is full ({} entries)",
                            capacity
                        )));
                    }
                    0
                }
                QueueKind::Priority => entry.priority,
            };

            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.insert((Reverse(priority), seq), entry);
        }

        self.ready.set();
        Ok(())
    }

    /// Takes the first entry, in queue order, whose cores are all in `free`.
    pub(crate) fn read(&self, free: CoreMask) -> Option<QueueEntry> {
        let mut state = self.state.lock();

        let key = state
            .entries
            .iter()
            .find(|(_, entry)| entry.cores.is_subset_of(free))
            .map(|(key, _)| *key)?;

        state.entries.remove(&key)
    }

    /// Removes and returns every entry matching `filter`, in queue order.
    pub(crate) fn clean(&self, filter: CleanFilter) -> Vec<QueueEntry> {
        let mut state = self.state.lock();

        let keys = state
            .entries
            .iter()
            .filter(|(_, entry)| filter.matches(entry))
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();

        keys.iter()
            .filter_map(|key| state.entries.remove(key))
            .collect()
    }

    /// One-way: `write` fails from now on, `read` keeps draining.
    pub(crate) fn stop(&self) {
        self.state.lock().stopped = true;
        self.ready.set();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes the reader without adding an entry, e.g. after cores were freed.
    pub(crate) fn notify(&self) {
        self.ready.set();
    }

    /// Blocks until the queue was written to, notified or stopped.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        self.ready.wait(timeout)
    }
}
