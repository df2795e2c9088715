//! The bounded job table of the broker.

use std::path::PathBuf;

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::status::JobStatus;

/// A job known to the broker.
#[derive(Debug, Clone)]
pub struct QueueJob {
    /// The job identifier.
    pub id: u64,
    /// The shell command line.
    pub cmd: String,
    /// The working directory.
    pub cwd: PathBuf,
    /// The environment of the command.
    pub env: IndexMap<String, String>,
    /// The job state.
    pub state: JobStatus,
    /// The exit code once the process exited.
    pub returncode: Option<i32>,
    /// Cancels the running process.
    pub token: CancellationToken,
}

/// Jobs by identifier in insertion order.
///
/// When the table grows over its capacity the oldest job is forgotten.
#[derive(Debug)]
pub struct JobTable {
    /// The maximum number of jobs.
    capacity: usize,
    /// The jobs.
    jobs: IndexMap<u64, QueueJob>,
}

impl JobTable {
    /// Constructs an empty table.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            jobs: IndexMap::new(),
        }
    }

    /// Gets the number of jobs in the table.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns `true` if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Inserts a job, evicting the oldest jobs over capacity.
    ///
    /// Evicted jobs that are still running are cancelled.
    pub fn insert(&mut self, job: QueueJob) {
        self.jobs.insert(job.id, job);
        while self.jobs.len() > self.capacity {
            if let Some((_, evicted)) = self.jobs.shift_remove_index(0)
                && evicted.state == JobStatus::Running
            {
                evicted.token.cancel();
            }
        }
    }

    /// Gets a job.
    pub fn get(&self, id: u64) -> Option<&QueueJob> {
        self.jobs.get(&id)
    }

    /// Gets a job mutably.
    pub fn get_mut(&mut self, id: u64) -> Option<&mut QueueJob> {
        self.jobs.get_mut(&id)
    }

    /// Removes a job.
    pub fn remove(&mut self, id: u64) -> Option<QueueJob> {
        self.jobs.shift_remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: u64) -> QueueJob {
        QueueJob {
            id,
            cmd: String::from("true"),
            cwd: PathBuf::from("/tmp"),
            env: IndexMap::new(),
            state: JobStatus::Queued,
            returncode: None,
            token: CancellationToken::new(),
        }
    }

    #[test]
    fn evicts_oldest() {
        let mut table = JobTable::new(2);
        table.insert(job(1));
        table.insert(job(2));
        table.insert(job(3));
        assert_eq!(table.len(), 2);
        assert!(table.get(1).is_none());
        assert!(table.get(2).is_some());
        assert!(table.get(3).is_some());
    }

    #[test]
    fn eviction_cancels_running_jobs() {
        let mut table = JobTable::new(1);
        let mut running = job(1);
        running.state = JobStatus::Running;
        let token = running.token.clone();
        table.insert(running);
        table.insert(job(2));
        assert!(token.is_cancelled());
    }

    #[test]
    fn remove() {
        let mut table = JobTable::new(10);
        table.insert(job(1));
        assert_eq!(table.remove(1).map(|j| j.id), Some(1));
        assert!(table.remove(1).is_none());
        assert!(table.is_empty());
    }
}
