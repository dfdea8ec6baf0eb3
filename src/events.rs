//! Dependency parking lot.
//!
//! A job is registered with the set of IDs it waits on. As those IDs
//! are fulfilled or abandoned the job's remaining set shrinks; when it
//! empties, the job is handed back to the caller to run, together with
//! a flag saying whether any dependency was abandoned. Jobs are plain
//! values (not callbacks), so the registry never re-enters the engine.

use std::collections::HashMap;
use std::hash::Hash;

/// A parked job together with its remaining dependencies.
struct Parked<K, J> {
    job: J,
    pending: usize,
    abandoned: bool,
    _key: std::marker::PhantomData<K>,
}

/// Registry of jobs blocked on dependency IDs.
///
/// Every job registered under an ID is notified exactly once per
/// `fulfill`/`abandon` of that ID. Termination is guaranteed because
/// dependency IDs form a DAG.
pub struct Blocker<K: Copy + Eq + Hash, J> {
    jobs: HashMap<u64, Parked<K, J>>,
    waiting: HashMap<K, Vec<u64>>,
    next_handle: u64,
}

impl<K: Copy + Eq + Hash, J> Default for Blocker<K, J> {
    fn default() -> Self {
        Blocker {
            jobs: HashMap::new(),
            waiting: HashMap::new(),
            next_handle: 0,
        }
    }
}

impl<K: Copy + Eq + Hash, J> Blocker<K, J> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `job` until every ID in `deps` has been fulfilled or
    /// abandoned. A job with no dependencies is returned immediately.
    pub fn register(&mut self, deps: impl IntoIterator<Item = K>, job: J) -> Option<(J, bool)> {
        let mut count = 0;
        let handle = self.next_handle;
        for dep in deps {
            let queue = self.waiting.entry(dep).or_default();
            // One wait per distinct dependency.
            if !queue.contains(&handle) {
                queue.push(handle);
                count += 1;
            }
        }
        if count == 0 {
            return Some((job, false));
        }
        self.next_handle += 1;
        self.jobs.insert(
            handle,
            Parked {
                job,
                pending: count,
                abandoned: false,
                _key: std::marker::PhantomData,
            },
        );
        None
    }

    /// Mark `id` delivered. Returns every job whose last dependency
    /// this was, with its abandoned flag.
    pub fn fulfill(&mut self, id: K) -> Vec<(J, bool)> {
        self.resolve(id, false)
    }

    /// Mark `id` as never arriving. Completed jobs come back flagged.
    pub fn abandon(&mut self, id: K) -> Vec<(J, bool)> {
        self.resolve(id, true)
    }

    fn resolve(&mut self, id: K, abandoned: bool) -> Vec<(J, bool)> {
        let handles = match self.waiting.remove(&id) {
            Some(handles) => handles,
            None => return Vec::new(),
        };
        let mut ready = Vec::new();
        for handle in handles {
            let parked = match self.jobs.get_mut(&handle) {
                Some(parked) => parked,
                None => continue,
            };
            parked.pending -= 1;
            parked.abandoned |= abandoned;
            if parked.pending == 0 {
                let parked = self.jobs.remove(&handle).unwrap();
                ready.push((parked.job, parked.abandoned));
            }
        }
        ready
    }

    /// Number of jobs still parked.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_deps_run_immediately() {
        let mut blocker: Blocker<u32, &str> = Blocker::new();
        let ready = blocker.register([], "job");
        assert_eq!(ready, Some(("job", false)));
        assert!(blocker.is_empty());
    }

    #[test]
    fn fulfillment_releases_job() {
        let mut blocker: Blocker<u32, &str> = Blocker::new();
        assert!(blocker.register([1, 2], "job").is_none());
        assert_eq!(blocker.len(), 1);

        assert!(blocker.fulfill(1).is_empty());
        let ready = blocker.fulfill(2);
        assert_eq!(ready, vec![("job", false)]);
        assert!(blocker.is_empty());
    }

    #[test]
    fn abandonment_flags_job() {
        let mut blocker: Blocker<u32, &str> = Blocker::new();
        blocker.register([1, 2], "job");

        blocker.fulfill(1);
        let ready = blocker.abandon(2);
        assert_eq!(ready, vec![("job", true)]);
    }

    #[test]
    fn abandoned_flag_sticks_across_later_fulfills() {
        let mut blocker: Blocker<u32, &str> = Blocker::new();
        blocker.register([1, 2], "job");

        assert!(blocker.abandon(1).is_empty());
        let ready = blocker.fulfill(2);
        assert_eq!(ready, vec![("job", true)]);
    }

    #[test]
    fn duplicate_dependencies_counted_once() {
        let mut blocker: Blocker<u32, &str> = Blocker::new();
        blocker.register([7, 7, 7], "job");
        let ready = blocker.fulfill(7);
        assert_eq!(ready, vec![("job", false)]);
    }

    #[test]
    fn multiple_jobs_share_a_dependency() {
        let mut blocker: Blocker<u32, u8> = Blocker::new();
        blocker.register([1], 10);
        blocker.register([1, 2], 20);

        let mut ready = blocker.fulfill(1);
        ready.sort();
        assert_eq!(ready, vec![(10, false)]);

        assert_eq!(blocker.fulfill(2), vec![(20, false)]);
    }

    #[test]
    fn unknown_id_is_noop() {
        let mut blocker: Blocker<u32, &str> = Blocker::new();
        assert!(blocker.fulfill(99).is_empty());
        assert!(blocker.abandon(99).is_empty());
    }
}
