use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, Mutex};

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::{debug, info};

use super::error::{Result, StoreError};
use super::keys;
use crate::job::{Aggregation, Job};

/// Fjall-backed persistent storage for jobs, aggregations, and queues.
///
/// All operations are single-key; no multi-key transactions are relied
/// upon. Queue pops are read-then-remove, so queue mutation is serialized
/// behind a mutex; everything else goes straight to fjall, which is safe
/// for concurrent callers.
#[derive(Clone)]
pub struct Store {
    keyspace: Keyspace,
    jobs: PartitionHandle,
    aggregations: PartitionHandle,
    queues: PartitionHandle,
    metadata: PartitionHandle,
    queue_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening store at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;

        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;
        let aggregations =
            keyspace.open_partition("aggregations", PartitionCreateOptions::default())?;
        let queues = keyspace.open_partition("queues", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            jobs,
            aggregations,
            queues,
            metadata,
            queue_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Create or overwrite a job record.
    pub fn save_job(&self, job: &Job) -> Result<()> {
        let key = keys::job_key(&job.id);
        let value = serde_json::to_vec(job)?;
        self.jobs.insert(key, value)?;
        debug!(job_id = %job.id, "Saved job");
        Ok(())
    }

    /// Read a job record by id.
    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        match self.jobs.get(keys::job_key(id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn job_exists(&self, id: &str) -> Result<bool> {
        Ok(self.jobs.contains_key(keys::job_key(id))?)
    }

    /// Write aggregation metadata.
    pub fn save_aggregation(&self, aggr: &Aggregation) -> Result<()> {
        let key = keys::aggr_key(&aggr.id);
        let value = serde_json::to_vec(aggr)?;
        self.aggregations.insert(key, value)?;
        debug!(aggr_id = %aggr.id, limit = aggr.limit, "Saved aggregation");
        Ok(())
    }

    pub fn get_aggregation(&self, id: &str) -> Result<Option<Aggregation>> {
        match self.aggregations.get(keys::aggr_key(id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Delete aggregation metadata only. The aggregation's pending-download
    /// queue is left intact: already queued jobs must never be lost to a
    /// reconfiguration.
    pub fn remove_aggregation(&self, id: &str) -> Result<()> {
        self.aggregations.remove(keys::aggr_key(id))?;
        Ok(())
    }

    /// Append a job id to an aggregation's pending-download queue.
    pub fn enqueue_pending(&self, aggr_id: &str, job_id: &str) -> Result<()> {
        self.enqueue(&keys::pending_queue_prefix(aggr_id), job_id)
    }

    /// Remove and return the head of an aggregation's pending-download
    /// queue. `Ok(None)` means the queue is empty.
    pub fn pop_pending(&self, aggr_id: &str) -> Result<Option<String>> {
        self.pop(&keys::pending_queue_prefix(aggr_id))
    }

    /// Append a job id to the global pending-callback queue.
    pub fn enqueue_callback(&self, job_id: &str) -> Result<()> {
        self.enqueue(keys::CALLBACK_QUEUE_PREFIX, job_id)
    }

    /// Remove and return the head of the global pending-callback queue.
    pub fn pop_callback(&self) -> Result<Option<String>> {
        self.pop(keys::CALLBACK_QUEUE_PREFIX)
    }

    /// Aggregation ids that currently have at least one queued download.
    ///
    /// This is the discovery scan the processor runs at startup and on its
    /// rescan interval. Queues are transient and small relative to the job
    /// partition, so a full prefix walk is fine here.
    pub fn pending_aggregations(&self) -> Result<Vec<String>> {
        let mut ids = std::collections::BTreeSet::new();
        for item in self.queues.prefix(keys::PENDING_QUEUE_PREFIX) {
            let (key, _) = item?;
            if let Some(aggr_id) = keys::decode_pending_queue_key(&key) {
                ids.insert(aggr_id);
            }
        }
        Ok(ids.into_iter().collect())
    }

    /// Paged enumeration of job ids, for maintenance tooling.
    ///
    /// Pass the cursor returned by the previous page to continue; `None`
    /// starts from the beginning. A `None` next-cursor means the
    /// enumeration is exhausted.
    pub fn scan_jobs(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<(Option<String>, Vec<String>)> {
        let mut ids = Vec::new();
        let mut push = |key: &[u8]| -> Result<()> {
            let id = keys::decode_job_key(key)
                .ok_or_else(|| StoreError::CorruptRecord(String::from_utf8_lossy(key).into()))?;
            ids.push(id);
            Ok(())
        };

        match cursor {
            Some(cursor) => {
                let start = Bound::Excluded(keys::job_key(cursor));
                for item in self.jobs.range((start, Bound::<Vec<u8>>::Unbounded)).take(limit) {
                    let (key, _) = item?;
                    push(&key)?;
                }
            }
            None => {
                for item in self.jobs.iter().take(limit) {
                    let (key, _) = item?;
                    push(&key)?;
                }
            }
        }

        let next_cursor = if ids.len() == limit {
            ids.last().cloned()
        } else {
            None
        };
        Ok((next_cursor, ids))
    }

    /// Flush all pending writes to disk.
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    /// Health check: verify the keyspace is reachable.
    pub fn health_check(&self) -> Result<()> {
        let _ = self.metadata.get(b"health")?;
        Ok(())
    }

    fn enqueue(&self, queue_prefix: &str, value: &str) -> Result<()> {
        let _guard = self.queue_lock.lock().expect("queue lock poisoned");

        let tail_key = keys::queue_tail_key(queue_prefix);
        let tail = self
            .metadata
            .get(&tail_key)?
            .map(|bytes| u64::from_be_bytes(bytes.as_ref().try_into().unwrap_or([0u8; 8])))
            .unwrap_or(0);

        self.queues
            .insert(keys::queue_entry_key(queue_prefix, tail), value.as_bytes())?;
        self.metadata.insert(tail_key, (tail + 1).to_be_bytes())?;

        debug!(queue = queue_prefix, seq = tail, value, "Enqueued");
        Ok(())
    }

    fn pop(&self, queue_prefix: &str) -> Result<Option<String>> {
        let _guard = self.queue_lock.lock().expect("queue lock poisoned");

        let head = match self.queues.prefix(queue_prefix).next() {
            Some(item) => item?,
            None => return Ok(None),
        };

        let (key, value) = head;
        self.queues.remove(&*key)?;

        let job_id = String::from_utf8(value.to_vec())
            .map_err(|_| StoreError::CorruptRecord(String::from_utf8_lossy(&key).into()))?;
        debug!(queue = queue_prefix, %job_id, "Popped");
        Ok(Some(job_id))
    }
}
