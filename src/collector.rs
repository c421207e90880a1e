//! Fixed-capacity ordered slot array for indexed batch results (C2, §4.6).

use parking_lot::Mutex;

struct Inner<T> {
    slots: Vec<Option<T>>,
    completed: usize,
}

/// Collects results from a batch of concurrently-running tasks, indexed by
/// their original position. Idempotent with respect to completed-count: a
/// slot can only transition empty → filled once.
pub struct ResultCollector<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> ResultCollector<T> {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            inner: Mutex::new(Inner {
                slots,
                completed: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Write a result into slot `index`. Writing an already-filled slot
    /// again overwrites the value but does not increment `completed_count`.
    pub fn set_result(&self, index: usize, result: T) {
        let mut inner = self.inner.lock();
        let was_empty = inner.slots[index].is_none();
        inner.slots[index] = Some(result);
        if was_empty {
            inner.completed += 1;
        }
    }

    pub fn completed_count(&self) -> usize {
        self.inner.lock().completed
    }

    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock();
        inner.completed == inner.slots.len()
    }

    /// Filled slots only, preserving index order.
    pub fn results(&self) -> Vec<T> {
        self.inner
            .lock()
            .slots
            .iter()
            .filter_map(|slot| slot.clone())
            .collect()
    }

    /// All slots, `None` where unfilled, preserving index order — useful
    /// when a caller needs to correlate results back to their index.
    pub fn slots(&self) -> Vec<Option<T>> {
        self.inner.lock().slots.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty_and_incomplete() {
        let collector: ResultCollector<i32> = ResultCollector::new(3);
        assert_eq!(collector.completed_count(), 0);
        assert!(!collector.is_complete());
    }

    #[test]
    fn set_result_increments_completed_once() {
        let collector = ResultCollector::new(2);
        collector.set_result(0, "a");
        assert_eq!(collector.completed_count(), 1);
        collector.set_result(0, "a-again");
        assert_eq!(collector.completed_count(), 1);
        assert_eq!(collector.results(), vec!["a-again"]);
    }

    #[test]
    fn is_complete_when_all_slots_filled() {
        let collector = ResultCollector::new(2);
        collector.set_result(1, "b");
        assert!(!collector.is_complete());
        collector.set_result(0, "a");
        assert!(collector.is_complete());
    }

    #[test]
    fn results_preserve_index_order() {
        let collector = ResultCollector::new(3);
        collector.set_result(2, 30);
        collector.set_result(0, 10);
        collector.set_result(1, 20);
        assert_eq!(collector.results(), vec![10, 20, 30]);
    }
}
