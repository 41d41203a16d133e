//! Pending-operation accounting that gates reactive reconciliation
//!
//! When the controller issues a create or delete it records the pending
//! operation here, before the RPC leaves, so that the earliest possible
//! cache observation races safely with the recording. A job is reconciled
//! again only once every bucket is satisfied — or expired, which unblocks
//! the controller after a lost watch event. Expiry is not a timeout on the
//! operation itself; it only re-enables diffing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use trainops_common::crd::ReplicaType;

/// Buckets expire after this long, re-enabling reconciliation even if the
/// matching watch observation never arrived.
pub const EXPECTATION_TTL: Duration = Duration::from_secs(5 * 60);

/// The kind of controllee an expectation bucket tracks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A pod slot occupant
    Pod,
    /// The per-slot headless service
    Service,
}

#[derive(Debug)]
struct Bucket {
    pending_adds: i64,
    pending_dels: i64,
    recorded_at: Instant,
}

impl Bucket {
    fn satisfied(&self) -> bool {
        self.pending_adds <= 0 && self.pending_dels <= 0
    }

    fn expired(&self, ttl: Duration) -> bool {
        self.recorded_at.elapsed() > ttl
    }
}

type BucketKey = (String, ReplicaType, ResourceKind);

/// Registry of pending creates/deletes per (job, replica type, kind).
///
/// Shared across workers; all methods take `&self` and are safe under
/// concurrent use on distinct keys.
pub struct Expectations {
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
    ttl: Duration,
}

impl Default for Expectations {
    fn default() -> Self {
        Self::new()
    }
}

impl Expectations {
    /// Registry with the standard expiry
    pub fn new() -> Self {
        Self::with_ttl(EXPECTATION_TTL)
    }

    /// Registry with a custom expiry (tests)
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record `count` pending creations for a bucket
    pub fn expect_creations(&self, job_key: &str, rtype: ReplicaType, kind: ResourceKind, count: i64) {
        self.record(job_key, rtype, kind, count, 0);
    }

    /// Record `count` pending deletions for a bucket
    pub fn expect_deletions(&self, job_key: &str, rtype: ReplicaType, kind: ResourceKind, count: i64) {
        self.record(job_key, rtype, kind, 0, count);
    }

    fn record(&self, job_key: &str, rtype: ReplicaType, kind: ResourceKind, adds: i64, dels: i64) {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry((job_key.to_string(), rtype, kind))
            .or_insert(Bucket {
                pending_adds: 0,
                pending_dels: 0,
                recorded_at: Instant::now(),
            });
        bucket.pending_adds += adds;
        bucket.pending_dels += dels;
        bucket.recorded_at = Instant::now();
    }

    /// A matching creation was observed through the cache
    pub fn creation_observed(&self, job_key: &str, rtype: ReplicaType, kind: ResourceKind) {
        self.observe(job_key, rtype, kind, true);
    }

    /// A matching deletion was observed through the cache
    pub fn deletion_observed(&self, job_key: &str, rtype: ReplicaType, kind: ResourceKind) {
        self.observe(job_key, rtype, kind, false);
    }

    fn observe(&self, job_key: &str, rtype: ReplicaType, kind: ResourceKind, is_add: bool) {
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(bucket) = buckets.get_mut(&(job_key.to_string(), rtype, kind)) {
            let counter = if is_add {
                &mut bucket.pending_adds
            } else {
                &mut bucket.pending_dels
            };
            *counter = (*counter - 1).max(0);
        }
    }

    /// True iff every bucket of the job is satisfied or expired.
    ///
    /// A job with no buckets at all is trivially satisfied.
    pub fn satisfied(&self, job_key: &str) -> bool {
        let buckets = self.buckets.lock().unwrap();
        buckets
            .iter()
            .filter(|((key, _, _), _)| key == job_key)
            .all(|(_, bucket)| bucket.satisfied() || bucket.expired(self.ttl))
    }

    /// Pending add count for one bucket (tests and diagnostics)
    pub fn pending_adds(&self, job_key: &str, rtype: ReplicaType, kind: ResourceKind) -> i64 {
        let buckets = self.buckets.lock().unwrap();
        buckets
            .get(&(job_key.to_string(), rtype, kind))
            .map(|b| b.pending_adds)
            .unwrap_or(0)
    }

    /// Pending delete count for one bucket (tests and diagnostics)
    pub fn pending_dels(&self, job_key: &str, rtype: ReplicaType, kind: ResourceKind) -> i64 {
        let buckets = self.buckets.lock().unwrap();
        buckets
            .get(&(job_key.to_string(), rtype, kind))
            .map(|b| b.pending_dels)
            .unwrap_or(0)
    }

    /// Drop all buckets of a job on terminal cleanup or deletion
    pub fn forget(&self, job_key: &str) {
        let mut buckets = self.buckets.lock().unwrap();
        buckets.retain(|(key, _, _), _| key != job_key);
    }
}
