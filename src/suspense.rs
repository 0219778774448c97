//! The suspense buffer: a bounded, restart-surviving holding area for
//! activities whose causal prerequisite hasn't arrived yet (an `Undo Y`
//! before `Y`, a `Like` on an unseen post, a `Comment` on an unseen parent).
//!
//! Persistent across restarts per spec.md §9's resolution of that open
//! question, backed by the same postgres pool as [crate::model::Store], with
//! a size cap so recovery after an outage stays bounded.

use crate::{error::Error, model::{run_blocking, DbPool}, schema::suspense_entry};
use chrono::{Duration, Utc};
use diesel::prelude::*;
use serde_json::Value;
use url::Url;
use uuid::Uuid;

/// What kind of thing is waiting on `awaited_uri` to show up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspenseKind {
    /// A `Create Comment` whose parent hasn't been seen.
    CommentReply,
    /// A `Like`/`Dislike` on an unknown target.
    Vote,
    /// An `Undo` that arrived before the activity it undoes.
    Undo,
    /// An `Update` for an object never seen locally.
    Update,
}

impl SuspenseKind {
    fn as_str(self) -> &'static str {
        match self {
            SuspenseKind::CommentReply => "comment_reply",
            SuspenseKind::Vote => "vote",
            SuspenseKind::Undo => "undo",
            SuspenseKind::Update => "update",
        }
    }
}

/// One suspended activity, keyed by the URI it's waiting on.
#[derive(Clone, Debug)]
pub struct SuspenseEntry {
    /// Row id.
    pub id: Uuid,
    /// URI whose arrival should trigger redispatch.
    pub awaited_uri: Url,
    /// What's waiting.
    pub kind: SuspenseKind,
    /// The full activity envelope, replayed verbatim on redispatch.
    pub payload: Value,
}

/// Default TTL for suspense entries: spec.md §4.C6's `suspense_ttl` default.
pub const DEFAULT_SUSPENSE_TTL: Duration = Duration::hours(2);

/// Default cap on total suspended entries, bounding restart recovery time.
pub const DEFAULT_SUSPENSE_CAPACITY: i64 = 100_000;

/// The suspense buffer itself.
#[derive(Clone)]
pub struct SuspenseBuffer {
    pool: DbPool,
    ttl: Duration,
    capacity: i64,
}

impl SuspenseBuffer {
    /// Construct a buffer backed by `pool`, with the given TTL and size cap.
    pub fn new(pool: DbPool, ttl: Duration, capacity: i64) -> Self {
        SuspenseBuffer { pool, ttl, capacity }
    }

    /// Suspend `payload` pending the arrival of `awaited_uri`. If the buffer
    /// is at capacity, the oldest entry is dropped to make room (age-first
    /// trimming, matching the activity queue's own lifecycle policy).
    pub async fn suspend(
        &self,
        awaited_uri: &Url,
        kind: SuspenseKind,
        payload: Value,
    ) -> Result<(), Error> {
        let pool = self.pool.clone();
        let awaited = awaited_uri.to_string();
        let kind_s = kind.as_str().to_string();
        let now = Utc::now().naive_utc();
        let expires_at = now + self.ttl;
        let capacity = self.capacity;
        run_blocking(&pool, move |conn| {
            let count: i64 = suspense_entry::table.count().get_result(conn)?;
            if count >= capacity {
                let oldest: Option<Uuid> = suspense_entry::table
                    .order(suspense_entry::created_at.asc())
                    .select(suspense_entry::id)
                    .first(conn)
                    .optional()?;
                if let Some(oldest) = oldest {
                    diesel::delete(suspense_entry::table.filter(suspense_entry::id.eq(oldest)))
                        .execute(conn)?;
                }
            }
            diesel::insert_into(suspense_entry::table)
                .values((
                    suspense_entry::id.eq(Uuid::new_v4()),
                    suspense_entry::awaited_uri.eq(awaited),
                    suspense_entry::kind.eq(kind_s),
                    suspense_entry::payload.eq(payload),
                    suspense_entry::created_at.eq(now),
                    suspense_entry::expires_at.eq(expires_at),
                ))
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Pop every non-expired entry awaiting `uri`, for redispatch by the
    /// caller (typically right after that URI's `Create`/fetch completes).
    pub async fn take_awaiting(&self, uri: &Url) -> Result<Vec<SuspenseEntry>, Error> {
        let pool = self.pool.clone();
        let uri_s = uri.to_string();
        let now = Utc::now().naive_utc();
        run_blocking(&pool, move |conn| {
            let rows: Vec<(Uuid, String, String, Value)> = suspense_entry::table
                .filter(suspense_entry::awaited_uri.eq(&uri_s))
                .filter(suspense_entry::expires_at.gt(now))
                .select((
                    suspense_entry::id,
                    suspense_entry::awaited_uri,
                    suspense_entry::kind,
                    suspense_entry::payload,
                ))
                .load(conn)?;
            diesel::delete(suspense_entry::table.filter(suspense_entry::awaited_uri.eq(&uri_s)))
                .execute(conn)?;
            Ok(rows
                .into_iter()
                .map(|(id, awaited_uri, kind, payload)| SuspenseEntry {
                    id,
                    awaited_uri: awaited_uri.parse().expect("stored suspense uri is valid"),
                    kind: match kind.as_str() {
                        "vote" => SuspenseKind::Vote,
                        "undo" => SuspenseKind::Undo,
                        "update" => SuspenseKind::Update,
                        _ => SuspenseKind::CommentReply,
                    },
                    payload,
                })
                .collect())
        })
        .await
    }

    /// Delete all entries past their TTL. Called by the same lifecycle
    /// worker that trims the activity queue (spec.md §4.C4).
    pub async fn expire(&self) -> Result<u64, Error> {
        let pool = self.pool.clone();
        let now = Utc::now().naive_utc();
        run_blocking(&pool, move |conn| {
            diesel::delete(suspense_entry::table.filter(suspense_entry::expires_at.le(now)))
                .execute(conn)
                .map(|n| n as u64)
        })
        .await
    }
}
