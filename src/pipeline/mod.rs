//! The telemetry pipeline: mint → publish-or-enqueue → drain.
//!
//! - [`minter::FrameMinter`] fuses the sensor snapshots into a frame
//! - [`aggregator::Aggregator`] drives minting at a fixed 1 Hz
//! - [`drain::DrainOrchestrator`] flushes the outbound queue
//! - [`events::EventPublisher`] emits discrete events (login, status,
//!   queue thresholds, heartbeat)

pub mod aggregator;
pub mod drain;
pub mod events;
pub mod minter;

pub use aggregator::Aggregator;
pub use drain::{DrainOrchestrator, DrainOutcome, DrainReport};
pub use events::EventPublisher;
pub use minter::{FrameMinter, MintError, MintedFrame, OperatorRegistry};

use std::sync::atomic::{AtomicU64, Ordering};

/// Live pipeline counters, readable at any time for observability.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Ticks fired by the aggregator.
    pub ticks: AtomicU64,
    /// Frames acknowledged by the broker from the live path.
    pub published: AtomicU64,
    /// Frames routed to the outbound queue.
    pub enqueued: AtomicU64,
    /// Ticks skipped because no GPS fix was available.
    pub no_fix_skips: AtomicU64,
    /// Wall clock of the most recent mint (ms epoch).
    pub last_mint_ms: AtomicU64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            no_fix_skips: self.no_fix_skips.load(Ordering::Relaxed),
            last_mint_ms: self.last_mint_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub published: u64,
    pub enqueued: u64,
    pub no_fix_skips: u64,
    pub last_mint_ms: u64,
}
