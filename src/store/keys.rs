//! Key layout and encoding for the fjall partitions.
//!
//! Partition structure:
//! - `jobs`: job:{job_id} -> Job (JSON)
//! - `aggregations`: aggr:{aggr_id} -> Aggregation (JSON)
//! - `queues`: dl:{aggr_id}:{seq:020} -> job_id, cb:{seq:020} -> job_id
//! - `metadata`: tail:{queue_prefix} -> u64 (big-endian tail counter)
//!
//! Job records are namespaced under `job:` so they can never collide with
//! aggregation or queue keys. Queue entries sort by their zero-padded
//! sequence number, which makes the first key in a prefix the queue head.

pub const JOB_KEY_PREFIX: &str = "job:";
pub const AGGR_KEY_PREFIX: &str = "aggr:";
pub const PENDING_QUEUE_PREFIX: &str = "dl:";
pub const CALLBACK_QUEUE_PREFIX: &str = "cb:";

const SEQ_WIDTH: usize = 20;

/// Encode a job key: job:{job_id}
pub fn job_key(job_id: &str) -> Vec<u8> {
    format!("{JOB_KEY_PREFIX}{job_id}").into_bytes()
}

/// Decode a job key: job:{job_id} -> job_id
pub fn decode_job_key(key: &[u8]) -> Option<String> {
    let key_str = std::str::from_utf8(key).ok()?;
    key_str.strip_prefix(JOB_KEY_PREFIX).map(String::from)
}

/// Encode an aggregation key: aggr:{aggr_id}
pub fn aggr_key(aggr_id: &str) -> Vec<u8> {
    format!("{AGGR_KEY_PREFIX}{aggr_id}").into_bytes()
}

/// Prefix under which one aggregation's pending-download entries sort:
/// dl:{aggr_id}:
pub fn pending_queue_prefix(aggr_id: &str) -> String {
    format!("{PENDING_QUEUE_PREFIX}{aggr_id}:")
}

/// Encode a queue entry key: {queue_prefix}{seq:020}
pub fn queue_entry_key(queue_prefix: &str, seq: u64) -> Vec<u8> {
    format!("{queue_prefix}{seq:020}").into_bytes()
}

/// Encode the metadata key carrying a queue's tail counter.
pub fn queue_tail_key(queue_prefix: &str) -> Vec<u8> {
    format!("tail:{queue_prefix}").into_bytes()
}

/// Decode the aggregation id out of a pending-queue entry key.
///
/// Aggregation ids may themselves contain `:`, so the id is everything
/// between the `dl:` prefix and the trailing `:{seq:020}`.
pub fn decode_pending_queue_key(key: &[u8]) -> Option<String> {
    let key_str = std::str::from_utf8(key).ok()?;
    let rest = key_str.strip_prefix(PENDING_QUEUE_PREFIX)?;
    let cut = rest.len().checked_sub(SEQ_WIDTH + 1)?;
    let (aggr_id, tail) = rest.split_at(cut);
    if aggr_id.is_empty() || !tail.starts_with(':') {
        return None;
    }
    if !tail[1..].bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(aggr_id.to_string())
}
