use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::job::JobId;

/// Percent complete, floored, clamped to 100. A zero total counts as one frame.
pub fn percent(processed: u64, total: u64) -> u8 {
    let total = total.max(1);
    (processed.saturating_mul(100) / total).min(100) as u8
}

/// Last published percent per job.
///
/// A job with no record reads as 100: a cleared record means the job is done.
#[derive(Default)]
pub struct ProgressStore {
    records: Mutex<HashMap<JobId, u8>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, job: &JobId, percent: u8) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.clone(), percent.min(100));
    }

    pub fn get(&self, job: &JobId) -> u8 {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job)
            .copied()
            .unwrap_or(100)
    }

    pub fn contains(&self, job: &JobId) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(job)
    }

    pub fn clear(&self, job: &JobId) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_floors_and_clamps() {
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(10, 10), 100);
        assert_eq!(percent(12, 10), 100, "under-estimated totals clamp");
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(1, 0), 100, "zero total counts as one");
    }

    #[test]
    fn missing_records_read_as_done() {
        let store = ProgressStore::new();
        let job = JobId::new_random();
        assert_eq!(store.get(&job), 100);
        store.publish(&job, 40);
        assert_eq!(store.get(&job), 40);
        store.clear(&job);
        assert!(!store.contains(&job));
        assert_eq!(store.get(&job), 100);
    }
}
