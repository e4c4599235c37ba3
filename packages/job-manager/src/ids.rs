//! Job id generation and KVS path encoding.
//!
//! Ids are 64-bit values laid out as timestamp(40) | shard(14) | sequence(10).
//! The timestamp is milliseconds since the generator epoch, so ids produced
//! by one generator are monotonically nondecreasing across submissions.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

const TIMESTAMP_BITS: u32 = 40;
const SHARD_BITS: u32 = 14;
const SEQUENCE_BITS: u32 = 10;

const SHARD_MAX: u64 = (1 << SHARD_BITS) - 1;
const SEQUENCE_MAX: u64 = (1 << SEQUENCE_BITS) - 1;
const TIMESTAMP_MAX: u64 = (1 << TIMESTAMP_BITS) - 1;

/// Opaque 64-bit job identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// KVS directory for this job: `job.<xxxx>.<xxxx>.<xxxx>.<xxxx>`.
    ///
    /// The id is split into four 16-bit shards, most significant first,
    /// each rendered as four lowercase hex digits. The resulting path has
    /// exactly four dot-separated segments under the `job.` root, which is
    /// the depth the restart traversal matches.
    pub fn kvs_dir(&self) -> String {
        let id = self.0;
        format!(
            "job.{:04x}.{:04x}.{:04x}.{:04x}",
            (id >> 48) & 0xffff,
            (id >> 32) & 0xffff,
            (id >> 16) & 0xffff,
            id & 0xffff,
        )
    }

    /// KVS key for a document inside this job's directory.
    pub fn kvs_key(&self, name: &str) -> String {
        format!("{}.{}", self.kvs_dir(), name)
    }

    /// Reverse of [`JobId::kvs_dir`]. Returns None unless the path is a
    /// `job.` prefix followed by exactly four 16-bit hex segments.
    pub fn from_kvs_dir(path: &str) -> Option<JobId> {
        let rest = path.strip_prefix("job.")?;
        let mut id: u64 = 0;
        let mut nseg = 0;
        for seg in rest.split('.') {
            if seg.is_empty() || seg.len() > 4 || nseg == 4 {
                return None;
            }
            let part = u64::from_str_radix(seg, 16).ok()?;
            id = (id << 16) | part;
            nseg += 1;
        }
        if nseg != 4 {
            return None;
        }
        Some(JobId(id))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        JobId(id)
    }
}

/// Generator for instance-unique, nondecreasing job ids.
///
/// One generator exists per instance. Uniqueness holds within the instance:
/// ids generated in the same millisecond increment the sequence field, and
/// the sequence overflow waits out the millisecond by bumping the timestamp.
#[derive(Debug)]
pub struct IdGenerator {
    epoch_ms: u64,
    shard: u64,
    last_ts: u64,
    sequence: u64,
}

impl IdGenerator {
    pub fn new(shard: u16) -> Self {
        Self {
            epoch_ms: Utc::now().timestamp_millis() as u64,
            shard: u64::from(shard) & SHARD_MAX,
            last_ts: 0,
            sequence: 0,
        }
    }

    /// Restore a generator so it never re-issues an id at or below `max_id`.
    pub fn restore(shard: u16, max_id: JobId) -> Self {
        let mut generator = Self::new(shard);
        let ts = (max_id.0 >> (SHARD_BITS + SEQUENCE_BITS)) & TIMESTAMP_MAX;
        generator.last_ts = ts;
        generator.sequence = max_id.0 & SEQUENCE_MAX;
        generator
    }

    fn now_ts(&self) -> u64 {
        let now = Utc::now().timestamp_millis() as u64;
        now.saturating_sub(self.epoch_ms) & TIMESTAMP_MAX
    }

    pub fn next(&mut self) -> JobId {
        let mut ts = self.now_ts();
        if ts < self.last_ts {
            ts = self.last_ts;
        }
        if ts == self.last_ts {
            self.sequence += 1;
            if self.sequence > SEQUENCE_MAX {
                // Sequence exhausted within one tick; advance the timestamp.
                ts += 1;
                self.sequence = 0;
            }
        } else {
            self.sequence = 0;
        }
        self.last_ts = ts;
        JobId((ts << (SHARD_BITS + SEQUENCE_BITS)) | (self.shard << SEQUENCE_BITS) | self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonically_nondecreasing() {
        let mut generator = IdGenerator::new(1);
        let mut prev = JobId(0);
        for _ in 0..5000 {
            let id = generator.next();
            assert!(id > prev);
            prev = id;
        }
    }

    #[test]
    fn kvs_dir_has_four_hex_segments() {
        let id = JobId(0x0123_4567_89ab_cdef);
        assert_eq!(id.kvs_dir(), "job.0123.4567.89ab.cdef");
    }

    #[test]
    fn kvs_dir_roundtrips() {
        for raw in [0u64, 1, 0xffff, 0x1_0000, u64::MAX, 0xdead_beef_0000_0001] {
            let id = JobId(raw);
            assert_eq!(JobId::from_kvs_dir(&id.kvs_dir()), Some(id));
        }
    }

    #[test]
    fn kvs_dir_rejects_wrong_depth() {
        assert_eq!(JobId::from_kvs_dir("job.0123.4567.89ab"), None);
        assert_eq!(JobId::from_kvs_dir("job.0123.4567.89ab.cdef.0000"), None);
        assert_eq!(JobId::from_kvs_dir("checkpoint.job-manager"), None);
        assert_eq!(JobId::from_kvs_dir("job..4567.89ab.cdef"), None);
    }

    #[test]
    fn kvs_key_appends_document_name() {
        let id = JobId(0);
        assert_eq!(id.kvs_key("eventlog"), "job.0000.0000.0000.0000.eventlog");
    }

    #[test]
    fn restored_generator_does_not_reissue() {
        let mut generator = IdGenerator::new(0);
        let mut last = JobId(0);
        for _ in 0..100 {
            last = generator.next();
        }
        let mut restored = IdGenerator::restore(0, last);
        assert!(restored.next() > last);
    }
}
