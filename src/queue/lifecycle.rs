//! The C4 lifecycle worker: scans memory pressure on the priority streams
//! and, on a high-water-mark breach, trims harder than the steady-state
//! policy would.
//!
//! This is a library primitive, not a spawned task: like
//! [crate::queue::ActivityQueue::promote_due_retries], the embedding
//! application is expected to call [scan_once] on a timer (a `tokio::spawn`
//! loop with a `tokio::time::interval`, typically a minute or so) alongside
//! its other queue maintenance.

use crate::{
    error::Error,
    model::Store,
    observability::{CheckpointStatus, ObservabilityStore},
    queue::{ActivityQueue, Priority},
    suspense::SuspenseBuffer,
};
use chrono::{Duration as ChronoDuration, Utc};
use tracing::warn;

/// Configuration for the lifecycle worker, per spec.md §4.C4's "Lifecycle &
/// memory" section.
#[derive(Clone, Copy, Debug)]
pub struct LifecycleConfig {
    /// Fraction of [crate::config::FederationConfig]'s `stream_length_cap`
    /// at which aggressive trimming kicks in. Default 0.75.
    pub high_water_mark: f64,
    /// How long a DLQ entry sits in the hot table before being archived to
    /// cold storage. Default 7 days.
    pub dlq_cold_after: ChronoDuration,
    /// Aggressive TTL applied to completed-message/dedup metadata once the
    /// high-water mark is breached, tighter than the steady-state
    /// `completed_message_ttl`. Default 1 hour.
    pub aggressive_ttl: ChronoDuration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            high_water_mark: 0.75,
            dlq_cold_after: ChronoDuration::days(7),
            aggressive_ttl: ChronoDuration::hours(1),
        }
    }
}

/// What one [scan_once] pass did, for callers that want to log or export it
/// as a metric themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct LifecycleReport {
    /// Streams found over the high-water mark this pass.
    pub streams_under_pressure: u32,
    /// Seen-activity dedup rows trimmed (only when under pressure).
    pub dedup_rows_trimmed: u64,
    /// DLQ rows archived to cold storage.
    pub dlq_rows_archived: u64,
    /// Expired suspense-buffer entries dropped.
    pub suspense_entries_expired: u64,
    /// Checkpoint rows dropped past their status-specific retention window.
    pub checkpoints_purged: u64,
}

/// One pass of the lifecycle worker: check each stream's length against
/// `stream_length_cap`; if any stream is at or above `high_water_mark`,
/// aggressively trim completed-message metadata. DLQ archival to cold
/// storage and suspense-buffer expiry run every pass regardless of memory
/// pressure, since both are time-based retention policies rather than
/// size-based ones.
pub async fn scan_once(
    queue: &ActivityQueue,
    store: &Store,
    suspense: &SuspenseBuffer,
    stream_length_cap: u64,
    config: &LifecycleConfig,
) -> Result<LifecycleReport, Error> {
    let mut report = LifecycleReport::default();

    for priority in [Priority::Urgent, Priority::Normal, Priority::Bulk] {
        let stats = queue.stats(priority).await?;
        let pressure = if stream_length_cap == 0 {
            0.0
        } else {
            stats.length as f64 / stream_length_cap as f64
        };
        if pressure >= config.high_water_mark {
            report.streams_under_pressure += 1;
            warn!(
                priority = ?priority,
                length = stats.length,
                cap = stream_length_cap,
                pressure,
                "queue stream crossed high-water mark; trimming aggressively"
            );
        }
    }

    if report.streams_under_pressure > 0 {
        let cutoff = (Utc::now() - config.aggressive_ttl).naive_utc();
        report.dedup_rows_trimmed = store.trim_seen_activities(cutoff).await?;
    }

    let dlq_cutoff = (Utc::now() - config.dlq_cold_after).naive_utc();
    report.dlq_rows_archived = store.archive_dlq_older_than(dlq_cutoff).await?;
    report.suspense_entries_expired = suspense.expire().await?;

    for status in [
        CheckpointStatus::Ok,
        CheckpointStatus::Ignored,
        CheckpointStatus::Error,
        CheckpointStatus::Warning,
    ] {
        let cutoff = (Utc::now() - ObservabilityStore::retention_for(status)).naive_utc();
        report.checkpoints_purged += store.purge_checkpoints_older_than(cutoff, status.as_str()).await?;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_high_water_mark_matches_spec() {
        let config = LifecycleConfig::default();
        assert_eq!(config.high_water_mark, 0.75);
        assert_eq!(config.dlq_cold_after, ChronoDuration::days(7));
    }
}
