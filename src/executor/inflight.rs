//! In-flight task tracking
//!
//! The set of task ids currently executing on this agent. Claiming an id is
//! a single insert-if-absent operation; the returned guard removes the id
//! when dropped, so removal happens exactly once on every exit path.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

/// Concurrency-safe set of in-flight task ids
#[derive(Debug, Default)]
pub struct InFlightSet {
    ids: Mutex<HashSet<String>>,
}

impl InFlightSet {
    /// Create an empty set
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Atomically claim `task_id`
    ///
    /// Returns `None` if the id is already in flight.
    pub fn try_claim(self: &Arc<Self>, task_id: &str) -> Option<InFlightGuard> {
        let inserted = self.ids.lock().insert(task_id.to_string());
        inserted.then(|| InFlightGuard {
            set: Arc::clone(self),
            task_id: task_id.to_string(),
        })
    }

    /// Whether `task_id` is currently executing
    pub fn contains(&self, task_id: &str) -> bool {
        self.ids.lock().contains(task_id)
    }

    /// Number of tasks in flight
    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }

    /// Snapshot of the in-flight ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ids.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    fn release(&self, task_id: &str) -> bool {
        self.ids.lock().remove(task_id)
    }
}

/// Ownership of one in-flight slot
///
/// Dropping the guard removes the id from the set.
#[derive(Debug)]
pub struct InFlightGuard {
    set: Arc<InFlightSet>,
    task_id: String,
}

impl InFlightGuard {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let removed = self.set.release(&self.task_id);
        debug_assert!(removed, "in-flight id {} released twice", self.task_id);
        tracing::trace!(task_id = %self.task_id, "Released in-flight claim");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_claim_is_exclusive() {
        let set = InFlightSet::new();

        let guard = set.try_claim("t1").expect("first claim succeeds");
        assert!(set.try_claim("t1").is_none());
        assert!(set.contains("t1"));
        assert_eq!(set.len(), 1);
        assert_eq!(guard.task_id(), "t1");

        drop(guard);
        assert!(!set.contains("t1"));
        assert!(set.is_empty());
        assert!(set.try_claim("t1").is_some());
    }

    #[test]
    fn test_independent_ids() {
        let set = InFlightSet::new();
        let _a = set.try_claim("a").unwrap();
        let _b = set.try_claim("b").unwrap();
        assert_eq!(set.ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let set = InFlightSet::new();
        let threads = 16;
        let start = Arc::new(Barrier::new(threads));
        let attempted = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let set = Arc::clone(&set);
                let start = Arc::clone(&start);
                let attempted = Arc::clone(&attempted);
                thread::spawn(move || {
                    start.wait();
                    let guard = set.try_claim("dup");
                    // Hold any claim until every thread has tried
                    attempted.wait();
                    guard.is_some()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_release_on_panic() {
        let set = InFlightSet::new();
        let cloned = Arc::clone(&set);

        let result = thread::spawn(move || {
            let _guard = cloned.try_claim("t1").unwrap();
            panic!("callable blew up");
        })
        .join();

        assert!(result.is_err());
        assert!(!set.contains("t1"));
    }
}
