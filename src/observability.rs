//! The C9 Observability Store: append-only checkpoint records for per-request
//! post-mortem debugging, plus the optional raw-body capture spec.md §4.C9
//! describes. Only active when the embedding application enables the debug
//! flag; emitting a checkpoint also raises a `tracing::debug!` event so
//! operators tailing logs see it without a database query.

use crate::{model::Store, schema::checkpoint_record};
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Outcome recorded at a single pipeline checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStatus {
    /// The stage completed normally.
    Ok,
    /// The stage failed, terminating request processing.
    Error,
    /// The stage completed, but flagged something for attention.
    Warning,
    /// The stage was skipped deliberately (e.g. a duplicate).
    Ignored,
}

impl CheckpointStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            CheckpointStatus::Ok => "ok",
            CheckpointStatus::Error => "error",
            CheckpointStatus::Warning => "warning",
            CheckpointStatus::Ignored => "ignored",
        }
    }
}

/// The named stages of the C5 Inbox Pipeline, in the order they run.
pub const CHECKPOINT_INITIAL_RECEIPT: &str = "initial_receipt";
/// JSON Safety parse completed.
pub const CHECKPOINT_JSON_PARSE: &str = "json_parse";
/// Envelope fields (`id`, `type`, `actor`, `object`) extracted.
pub const CHECKPOINT_REQUEST_INFO_EXTRACTED: &str = "request_info_extracted";
/// Duplicate-activity-id check ran.
pub const CHECKPOINT_DUPLICATE_CHECK: &str = "duplicate_check";
/// Actor resolved via the Actor Resolver.
pub const CHECKPOINT_ACTOR_LOOKUP: &str = "actor_lookup";
/// HTTP/LD signature (or allowlist) verification ran.
pub const CHECKPOINT_SIGNATURE_VERIFY: &str = "signature_verify";
/// Per-verb schema and policy validation ran.
pub const CHECKPOINT_FIELD_VALIDATION: &str = "field_validation";
/// Activity handed to the queue for async dispatch.
pub const CHECKPOINT_MAIN_PROCESSING_DISPATCH: &str = "main_processing_dispatch";

/// One request's timeline entry.
#[derive(Clone, Debug)]
pub struct CheckpointRecord {
    /// Request this checkpoint belongs to.
    pub request_id: Uuid,
    /// When the checkpoint was recorded.
    pub timestamp: NaiveDateTime,
    /// One of the `CHECKPOINT_*` stage names.
    pub checkpoint_name: String,
    /// Outcome of the stage.
    pub status: CheckpointStatus,
    /// The activity's `id`, once known.
    pub activity_id: Option<String>,
    /// Free-text details, e.g. an error message.
    pub details: Option<String>,
}

/// Query surface over the checkpoint log (spec.md §4.C9: "incomplete
/// requests", "by-activity-id", "timeline for request ID", "failed within
/// last N minutes"), backed by the same postgres pool as [crate::model::Store].
#[derive(Clone)]
pub struct ObservabilityStore {
    store: Store,
    enabled: bool,
}

impl ObservabilityStore {
    /// Wrap a [Store]. `enabled` mirrors [crate::config::FederationConfig]'s
    /// debug flag; when false, [ObservabilityStore::checkpoint] is a no-op
    /// beyond the `tracing::debug!` event.
    pub fn new(store: Store, enabled: bool) -> Self {
        ObservabilityStore { store, enabled }
    }

    /// Record a checkpoint. Always emits a `tracing::debug!` event; persists
    /// the row only if the store is enabled.
    pub async fn checkpoint(
        &self,
        request_id: Uuid,
        name: &str,
        status: CheckpointStatus,
        activity_id: Option<&str>,
        details: Option<&str>,
    ) -> Result<(), crate::error::Error> {
        debug!(
            %request_id,
            checkpoint = name,
            status = status.as_str(),
            activity_id,
            "inbox checkpoint"
        );
        if !self.enabled {
            return Ok(());
        }
        let pool = self.store.pool_for_observability();
        let name = name.to_string();
        let activity_id = activity_id.map(str::to_string);
        let details = details.map(str::to_string);
        let id = Uuid::new_v4();
        let timestamp = Utc::now().naive_utc();
        crate::model::run_blocking(pool, move |conn| {
            diesel::insert_into(checkpoint_record::table)
                .values((
                    checkpoint_record::id.eq(id),
                    checkpoint_record::request_id.eq(request_id),
                    checkpoint_record::timestamp.eq(timestamp),
                    checkpoint_record::checkpoint_name.eq(name),
                    checkpoint_record::status.eq(status.as_str().to_string()),
                    checkpoint_record::activity_id.eq(activity_id),
                    checkpoint_record::details.eq(details),
                ))
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Retention window, per spec.md §4.C9: requests that completed
    /// successfully are kept for 24h, incomplete/failed ones for 7d. Called
    /// by the same lifecycle worker that trims the activity queue (C4).
    pub fn retention_for(status: CheckpointStatus) -> chrono::Duration {
        match status {
            CheckpointStatus::Ok | CheckpointStatus::Ignored => chrono::Duration::hours(24),
            CheckpointStatus::Error | CheckpointStatus::Warning => chrono::Duration::days(7),
        }
    }

    /// "timeline for request ID": every checkpoint recorded for `request_id`,
    /// in the order they happened.
    pub async fn timeline(&self, request_id: Uuid) -> Result<Vec<CheckpointRecord>, crate::error::Error> {
        let pool = self.store.pool_for_observability();
        crate::model::run_blocking(pool, move |conn| {
            checkpoint_record::table
                .filter(checkpoint_record::request_id.eq(request_id))
                .order(checkpoint_record::timestamp.asc())
                .load::<CheckpointRow>(conn)
        })
        .await
        .map(|rows| rows.into_iter().map(CheckpointRow::into_record).collect())
    }

    /// "by-activity-id": every checkpoint recorded across any request that
    /// touched `activity_id`.
    pub async fn by_activity_id(&self, activity_id: &str) -> Result<Vec<CheckpointRecord>, crate::error::Error> {
        let pool = self.store.pool_for_observability();
        let activity_id = activity_id.to_string();
        crate::model::run_blocking(pool, move |conn| {
            checkpoint_record::table
                .filter(checkpoint_record::activity_id.eq(activity_id))
                .order(checkpoint_record::timestamp.asc())
                .load::<CheckpointRow>(conn)
        })
        .await
        .map(|rows| rows.into_iter().map(CheckpointRow::into_record).collect())
    }

    /// "incomplete requests": requests whose most recent checkpoint is
    /// neither the final pipeline stage nor an explicit failure — i.e. they
    /// stopped partway through, which usually means a crashed worker rather
    /// than a deliberate rejection.
    pub async fn incomplete_requests(&self) -> Result<Vec<Uuid>, crate::error::Error> {
        let pool = self.store.pool_for_observability();
        crate::model::run_blocking(pool, move |conn| {
            checkpoint_record::table
                .filter(checkpoint_record::checkpoint_name.ne(CHECKPOINT_MAIN_PROCESSING_DISPATCH))
                .filter(checkpoint_record::status.ne(CheckpointStatus::Error.as_str()))
                .select(checkpoint_record::request_id)
                .distinct()
                .load::<Uuid>(conn)
        })
        .await
    }

    /// "failed within last N minutes": every checkpoint that recorded an
    /// error in that window, most recent first.
    pub async fn failed_within(&self, minutes: i64) -> Result<Vec<CheckpointRecord>, crate::error::Error> {
        let pool = self.store.pool_for_observability();
        let since = Utc::now().naive_utc() - chrono::Duration::minutes(minutes);
        crate::model::run_blocking(pool, move |conn| {
            checkpoint_record::table
                .filter(checkpoint_record::status.eq(CheckpointStatus::Error.as_str()))
                .filter(checkpoint_record::timestamp.gt(since))
                .order(checkpoint_record::timestamp.desc())
                .load::<CheckpointRow>(conn)
        })
        .await
        .map(|rows| rows.into_iter().map(CheckpointRow::into_record).collect())
    }
}

#[derive(Queryable)]
struct CheckpointRow {
    #[allow(dead_code)]
    id: Uuid,
    request_id: Uuid,
    timestamp: NaiveDateTime,
    checkpoint_name: String,
    status: String,
    activity_id: Option<String>,
    details: Option<String>,
}

impl CheckpointRow {
    fn into_record(self) -> CheckpointRecord {
        let status = match self.status.as_str() {
            "error" => CheckpointStatus::Error,
            "warning" => CheckpointStatus::Warning,
            "ignored" => CheckpointStatus::Ignored,
            _ => CheckpointStatus::Ok,
        };
        CheckpointRecord {
            request_id: self.request_id,
            timestamp: self.timestamp,
            checkpoint_name: self.checkpoint_name,
            status,
            activity_id: self.activity_id,
            details: self.details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_matches_spec_defaults() {
        assert_eq!(
            ObservabilityStore::retention_for(CheckpointStatus::Ok),
            chrono::Duration::hours(24)
        );
        assert_eq!(
            ObservabilityStore::retention_for(CheckpointStatus::Error),
            chrono::Duration::days(7)
        );
    }
}
