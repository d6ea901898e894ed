//! Durable outbound queue.
//!
//! Frames that could not be published live here until a drain succeeds
//! or retention policy sheds them. Keys are the big-endian insertion
//! sequence, so sled's ordered iteration is exactly FIFO. Values are
//! JSON-serialized [`QueueEntry`] records.
//!
//! Durability contract: `append` and the delete operations flush before
//! returning, so an acknowledged call survives power loss. A reader
//! never observes an entry that was not fully appended.

use super::StorageError;
use crate::config::defaults::{QUEUE_CRITICAL_ROWS, QUEUE_MAX_ROWS, QUEUE_TTL, QUEUE_WARNING_ROWS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One buffered frame awaiting publication.
///
/// `frame_id` and `payload` never change once the entry exists; only
/// `retry_count` is bumped by the drain orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Persistent insertion order; the FIFO key.
    pub seq: u64,
    /// The frame's `messageId` — stable across every retry.
    pub frame_id: Uuid,
    pub topic: String,
    /// The exact UTF-8 JSON bytes to put on the wire.
    pub payload: String,
    pub qos: u8,
    pub retry_count: u32,
    /// Wall clock at enqueue (ms epoch); drives the TTL.
    pub enqueued_at: u64,
}

/// What a maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Entries older than the TTL.
    pub expired: u64,
    /// Oldest-first evictions to get back under the row cap.
    pub evicted: u64,
}

/// Queue fill level relative to the warning/critical thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueFill {
    Normal,
    Warning,
    Critical,
}

pub struct OutboundQueue {
    tree: sled::Tree,
    next_seq: AtomicU64,
}

impl OutboundQueue {
    /// Open the queue tree, resuming the sequence counter after the
    /// highest persisted entry.
    pub fn open(db: &sled::Db) -> Result<Self, StorageError> {
        let tree = db.open_tree("outbound")?;

        let next_seq = match tree.last()? {
            Some((key, _)) => decode_seq(&key) + 1,
            None => 0,
        };

        Ok(Self {
            tree,
            next_seq: AtomicU64::new(next_seq),
        })
    }

    /// Append a frame. Durable before this returns.
    pub fn append(
        &self,
        frame_id: Uuid,
        topic: &str,
        payload: String,
        qos: u8,
    ) -> Result<u64, StorageError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = QueueEntry {
            seq,
            frame_id,
            topic: topic.to_string(),
            payload,
            qos,
            retry_count: 0,
            enqueued_at: now_ms(),
        };

        self.tree.insert(seq.to_be_bytes(), serde_json::to_vec(&entry)?)?;
        self.tree.flush()?;

        debug!(seq, frame_id = %frame_id, "Frame enqueued");
        Ok(seq)
    }

    /// The `n` oldest entries, in FIFO order. Entries that fail to
    /// deserialize are removed and skipped.
    pub fn oldest(&self, n: usize) -> Result<Vec<QueueEntry>, StorageError> {
        let mut entries = Vec::with_capacity(n);

        for item in self.tree.iter() {
            if entries.len() >= n {
                break;
            }
            let (key, value) = item?;
            match serde_json::from_slice::<QueueEntry>(&value) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    error!(seq = decode_seq(&key), error = %e, "Corrupted queue entry, removing");
                    self.tree.remove(key)?;
                }
            }
        }

        Ok(entries)
    }

    /// Remove the given entries in one committed batch. Durable before
    /// this returns.
    pub fn delete_by_ids(&self, seqs: &[u64]) -> Result<(), StorageError> {
        if seqs.is_empty() {
            return Ok(());
        }

        let mut batch = sled::Batch::default();
        for seq in seqs {
            batch.remove(&seq.to_be_bytes()[..]);
        }
        self.tree.apply_batch(batch)?;
        self.tree.flush()?;

        debug!(deleted = seqs.len(), "Queue entries deleted");
        Ok(())
    }

    /// Bump the retry counter of one entry. A missing entry (already
    /// deleted by a concurrent maintenance pass) is not an error.
    pub fn increment_retry(&self, seq: u64) -> Result<(), StorageError> {
        let key = seq.to_be_bytes();
        let Some(value) = self.tree.get(key)? else {
            return Ok(());
        };

        let mut entry: QueueEntry = serde_json::from_slice(&value)?;
        entry.retry_count += 1;
        self.tree.insert(key, serde_json::to_vec(&entry)?)?;
        Ok(())
    }

    /// Shed entries whose retry count exceeds `max_retries`. Returns
    /// how many were dropped.
    pub fn delete_failed(&self, max_retries: u32) -> Result<u64, StorageError> {
        let mut batch = sled::Batch::default();
        let mut dropped: u64 = 0;

        for item in self.tree.iter() {
            let (key, value) = item?;
            if let Ok(entry) = serde_json::from_slice::<QueueEntry>(&value) {
                if entry.retry_count > max_retries {
                    batch.remove(key);
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            self.tree.apply_batch(batch)?;
            self.tree.flush()?;
            warn!(dropped, max_retries, "Shed permanently-failing queue entries");
        }

        Ok(dropped)
    }

    /// Enforce retention: TTL first, then the hard row cap (oldest
    /// evicted first). Idempotent — a second pass right after the first
    /// removes nothing.
    pub fn apply_maintenance(&self) -> Result<MaintenanceReport, StorageError> {
        self.apply_maintenance_with(QUEUE_TTL, QUEUE_MAX_ROWS)
    }

    /// Maintenance with explicit policy, for tests and tooling.
    pub fn apply_maintenance_with(
        &self,
        ttl: Duration,
        max_rows: u64,
    ) -> Result<MaintenanceReport, StorageError> {
        let mut report = MaintenanceReport::default();
        let cutoff = now_ms().saturating_sub(ttl.as_millis() as u64);

        // Rule 1: TTL. Sequence order is insertion order, so the scan
        // can stop at the first entry younger than the cutoff.
        let mut batch = sled::Batch::default();
        for item in self.tree.iter() {
            let (key, value) = item?;
            match serde_json::from_slice::<QueueEntry>(&value) {
                Ok(entry) if entry.enqueued_at < cutoff => {
                    batch.remove(key);
                    report.expired += 1;
                }
                Ok(_) => break,
                Err(_) => {
                    batch.remove(key);
                    report.expired += 1;
                }
            }
        }
        if report.expired > 0 {
            self.tree.apply_batch(batch)?;
        }

        // Rule 2: hard cap, oldest first.
        while self.tree.len() as u64 > max_rows {
            if self.tree.pop_min()?.is_none() {
                break;
            }
            report.evicted += 1;
        }

        if report.expired > 0 || report.evicted > 0 {
            self.tree.flush()?;
            info!(
                expired = report.expired,
                evicted = report.evicted,
                remaining = self.tree.len(),
                "Queue maintenance applied"
            );
        }

        Ok(report)
    }

    pub fn count(&self) -> u64 {
        self.tree.len() as u64
    }

    /// Enqueue time of the oldest entry (ms epoch), if any.
    pub fn oldest_timestamp(&self) -> Result<Option<u64>, StorageError> {
        match self.tree.first()? {
            Some((_, value)) => {
                let entry: QueueEntry = serde_json::from_slice(&value)?;
                Ok(Some(entry.enqueued_at))
            }
            None => Ok(None),
        }
    }

    /// Where the current count sits relative to the warning and
    /// critical thresholds.
    pub fn fill_level(&self) -> QueueFill {
        let count = self.count();
        if count >= QUEUE_CRITICAL_ROWS {
            QueueFill::Critical
        } else if count >= QUEUE_WARNING_ROWS {
            QueueFill::Warning
        } else {
            QueueFill::Normal
        }
    }

    /// Back-date an entry's enqueue time. Test/tooling support for
    /// exercising retention.
    pub fn backdate(&self, seq: u64, enqueued_at: u64) -> Result<(), StorageError> {
        let key = seq.to_be_bytes();
        if let Some(value) = self.tree.get(key)? {
            let mut entry: QueueEntry = serde_json::from_slice(&value)?;
            entry.enqueued_at = enqueued_at;
            self.tree.insert(key, serde_json::to_vec(&entry)?)?;
        }
        Ok(())
    }
}

fn decode_seq(key: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    if key.len() == 8 {
        bytes.copy_from_slice(key);
    }
    u64::from_be_bytes(bytes)
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
