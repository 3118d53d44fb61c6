//! The three queues wiring the pipeline stages together (`SPEC_FULL.md`
//! §2, §5). Execution and evaluation are plain bounded FIFOs — backpressure
//! is just a blocking `send`, no polling loop needed. The mutation queue is
//! a priority queue keyed by case name so a champion's priority can be
//! rescored by removing and reinserting it as one atomic "move".

use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendError, Sender};
use parking_lot::{Condvar, Mutex};

use crate::testcase::{TestCase, TestCaseResult};

/// A bounded, thread-safe FIFO. Cloning a `Sender`/`Receiver` handle is
/// cheap (both are reference-counted), so each worker thread keeps its own.
pub struct BoundedQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        BoundedQueue { sender, receiver }
    }

    pub fn sender(&self) -> Sender<T> {
        self.sender.clone()
    }

    pub fn receiver(&self) -> Receiver<T> {
        self.receiver.clone()
    }

    /// Blocks until there is room. This *is* the backpressure mechanism:
    /// a full execution queue simply stalls the mutation worker that's
    /// trying to feed it, rather than dropping work.
    pub fn push(&self, item: T) -> Result<(), SendError<T>> {
        self.sender.send(item)
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

/// Produced by the Executor, consumed by the Evaluator.
pub struct EvaluationJob {
    pub case: TestCase,
    pub result: TestCaseResult,
}

pub type ExecutionQueue = BoundedQueue<TestCase>;
pub type EvaluationQueue = BoundedQueue<EvaluationJob>;

/// The mutation priority queue. Pop always returns the highest-priority
/// entry currently held; `rescore` lets the Corpus Manager atomically
/// replace an entry in place (remove + reinsert under one lock acquisition)
/// so a concurrent pop can never observe the case both present and absent.
pub struct MutationQueue {
    entries: Mutex<HashMap<String, TestCase>>,
    not_empty: Condvar,
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationQueue {
    pub fn new() -> Self {
        MutationQueue { entries: Mutex::new(HashMap::new()), not_empty: Condvar::new() }
    }

    /// Insert or overwrite the entry for `case.name`.
    pub fn push(&self, case: TestCase) {
        let mut guard = self.entries.lock();
        guard.insert(case.name.clone(), case);
        self.not_empty.notify_one();
    }

    /// Remove and reinsert a case under the same name as a single atomic
    /// step, used to rescore a champion after its priority changes. A
    /// no-op (returns `None`) if the named case isn't queued, e.g. it is
    /// currently checked out by a Mutation Worker.
    pub fn rescore(&self, name: &str, updated: TestCase) -> Option<TestCase> {
        let mut guard = self.entries.lock();
        let previous = guard.remove(name);
        guard.insert(updated.name.clone(), updated);
        previous
    }

    pub fn remove(&self, name: &str) -> Option<TestCase> {
        self.entries.lock().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    /// Blocks up to `timeout` for a case to become available, then returns
    /// the one with the highest `priority` (ties broken by name so the
    /// choice is deterministic for a given queue content).
    pub fn pop_highest_priority(&self, timeout: Duration) -> Option<TestCase> {
        let mut guard = self.entries.lock();
        if guard.is_empty() {
            let result = self.not_empty.wait_for(&mut guard, timeout);
            if result.timed_out() && guard.is_empty() {
                return None;
            }
        }
        let best_name = guard
            .values()
            .max_by(|a, b| {
                a.priority
                    .partial_cmp(&b.priority)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.name.cmp(&a.name))
            })
            .map(|c| c.name.clone())?;
        guard.remove(&best_name)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<TestCase> {
        self.entries.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcase::TestCase;

    fn case(name: &str, priority: f64) -> TestCase {
        let mut c = TestCase::new_seed(name.to_string());
        c.priority = priority;
        c
    }

    #[test]
    fn pops_highest_priority_first() {
        let q = MutationQueue::new();
        q.push(case("low", 0.1));
        q.push(case("high", 9.0));
        q.push(case("mid", 3.0));
        assert_eq!(q.pop_highest_priority(Duration::from_millis(10)).unwrap().name, "high");
        assert_eq!(q.pop_highest_priority(Duration::from_millis(10)).unwrap().name, "mid");
        assert_eq!(q.pop_highest_priority(Duration::from_millis(10)).unwrap().name, "low");
        assert!(q.pop_highest_priority(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn rescore_replaces_entry_atomically() {
        let q = MutationQueue::new();
        q.push(case("a", 1.0));
        let previous = q.rescore("a", case("a", 5.0));
        assert_eq!(previous.unwrap().priority, 1.0);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_highest_priority(Duration::from_millis(10)).unwrap().priority, 5.0);
    }

    #[test]
    fn rescore_on_missing_name_still_inserts() {
        let q = MutationQueue::new();
        assert!(q.rescore("ghost", case("ghost", 2.0)).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn bounded_execution_queue_round_trips() {
        let q: ExecutionQueue = BoundedQueue::new(4);
        q.push(TestCase::new_seed("s1".into())).unwrap();
        let popped = q.pop_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(popped.name, "s1");
    }
}
