//! The C4 Activity Queue: three priority streams (`urgent`, `normal`,
//! `bulk`), each consumed through a single named consumer group so in-flight
//! claims survive worker restarts, with a retry table and a DLQ per stream.
//!
//! Redis Streams map directly onto the vocabulary spec.md uses for this
//! component (streams, consumer groups, a pending-entries list, claim
//! timeouts, `XTRIM`-style lifecycle management), so this is built on `fred`
//! rather than introducing an in-process structure that would need to
//! reinvent all of that. DLQ entries are archived to the same postgres pool
//! [crate::model::Store] uses, per spec.md §6's `dlq_message` table.

use crate::{error::Error, model::{run_blocking, DbPool}, schema::dlq_message};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use fred::{interfaces::StreamsInterface, prelude::*};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{instrument, warn};
use url::Url;
use uuid::Uuid;

/// The three priority streams from spec.md §4.C4.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// `Delete`, `Block`, `Flag`; `Accept`/`Reject` of a pending follow.
    Urgent,
    /// `Create`, `Update`, `Follow`, `Undo`, `Announce`, `Add`, `Remove`.
    Normal,
    /// `Like`, `Dislike`, batched announces.
    Bulk,
}

impl Priority {
    /// Maps an ActivityPub verb to its queue priority, per spec.md §4.C4's
    /// placement policy.
    pub fn for_verb(verb: &str) -> Priority {
        match verb {
            "Delete" | "Block" | "Flag" => Priority::Urgent,
            "Accept" | "Reject" => Priority::Urgent,
            "Create" | "Update" | "Follow" | "Undo" | "Announce" | "Add" | "Remove" => {
                Priority::Normal
            }
            "Like" | "Dislike" => Priority::Bulk,
            _ => Priority::Normal,
        }
    }

    fn stream_key(self) -> &'static str {
        match self {
            Priority::Urgent => "federation:stream:urgent",
            Priority::Normal => "federation:stream:normal",
            Priority::Bulk => "federation:stream:bulk",
        }
    }

    fn dlq_key(self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::Normal => "normal",
            Priority::Bulk => "bulk",
        }
    }
}

/// `(max_attempts, base_backoff, multiplier)` per verb class, from spec.md
/// §4.C4's retry policy table.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Maximum delivery attempts before a message moves to the DLQ.
    pub max_attempts: u32,
    /// Backoff applied after the first failed attempt.
    pub base_backoff: Duration,
    /// Multiplier applied to the backoff after each subsequent failure.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// The four verb-class policies named in spec.md §4.C4.
    pub fn for_verb(verb: &str) -> RetryPolicy {
        match verb {
            "Create" | "Update" => RetryPolicy { max_attempts: 10, base_backoff: Duration::from_secs(30), multiplier: 2.0 },
            "Delete" => RetryPolicy { max_attempts: 8, base_backoff: Duration::from_secs(60), multiplier: 1.5 },
            "Follow" | "Accept" | "Reject" => RetryPolicy { max_attempts: 8, base_backoff: Duration::from_secs(30), multiplier: 2.0 },
            "Like" | "Dislike" | "Undo" => RetryPolicy { max_attempts: 5, base_backoff: Duration::from_secs(60), multiplier: 1.5 },
            _ => RetryPolicy { max_attempts: 8, base_backoff: Duration::from_secs(30), multiplier: 2.0 },
        }
    }

    /// Backoff before attempt number `attempt` (1-based), with uniform
    /// jitter in `[0.5, 1.5]` to avoid thundering herds.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = self.base_backoff.as_secs_f64() * exp;
        let jitter = rand::thread_rng().gen_range(0.5..=1.5);
        Duration::from_secs_f64(base * jitter)
    }
}

/// A message flowing through the queue: the payload plus its delivery
/// bookkeeping, per spec.md §3's "Queued Message" entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Unique message id; also the idempotency key used for enqueue dedup.
    pub msg_id: Uuid,
    /// Which stream this message belongs/belonged to.
    pub priority: Priority,
    /// The activity envelope (inbound) or signed outbound request descriptor.
    pub payload: Value,
    /// Destination inbox, for egress messages only.
    pub destination: Option<Url>,
    /// Number of delivery/processing attempts so far.
    pub attempt: u32,
    /// When the message was first enqueued.
    pub first_seen: DateTime<Utc>,
    /// Most recent error, if any attempt has failed.
    pub last_error: Option<String>,
}

/// Outcome reported by a worker after attempting a message.
#[derive(Clone, Debug)]
pub enum DeliveryOutcome {
    /// Acknowledge as done.
    Ack,
    /// Retry later, recording `error`.
    Retry {
        /// What went wrong.
        error: String,
    },
    /// Move straight to the DLQ, recording `error`.
    Deadletter {
        /// What went wrong.
        error: String,
    },
}

/// `stats(stream)` from spec.md §4.C4.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueStats {
    /// Total entries still in the stream (including acked-but-not-trimmed).
    pub length: u64,
    /// Entries currently claimed but not yet acked (PEL size).
    pub pending: u64,
    /// Distinct consumers known to the group.
    pub consumers: u64,
    /// Age of the oldest unacked entry, if any.
    pub oldest_age: Option<Duration>,
}

const CONSUMER_GROUP: &str = "federation-workers";

/// The priority activity queue itself. Cheap to clone; wraps a shared
/// [fred::clients::RedisClient].
#[derive(Clone)]
pub struct ActivityQueue {
    redis: RedisClient,
    db: DbPool,
    claim_timeout: Duration,
    stream_length_cap: u64,
    completed_message_ttl: ChronoDuration,
}

impl ActivityQueue {
    /// Construct a queue against an already-connected redis client, creating
    /// the consumer group on each stream if it doesn't exist yet.
    #[instrument(skip(redis, db))]
    pub async fn new(
        redis: RedisClient,
        db: DbPool,
        claim_timeout: Duration,
        stream_length_cap: u64,
        completed_message_ttl: ChronoDuration,
    ) -> Result<Self, Error> {
        for priority in [Priority::Urgent, Priority::Normal, Priority::Bulk] {
            let created: Result<(), RedisError> = redis
                .xgroup_create(priority.stream_key(), CONSUMER_GROUP, "$", true)
                .await;
            if let Err(e) = created {
                if !e.to_string().contains("BUSYGROUP") {
                    warn!(stream = priority.stream_key(), error = %e, "failed creating consumer group");
                }
            }
        }
        Ok(ActivityQueue { redis, db, claim_timeout, stream_length_cap, completed_message_ttl })
    }

    /// `enqueue(priority, payload) -> msgId`: at-most-once dedup across a
    /// configurable window via idempotency key = activity id, implemented as
    /// the redis stream entry id carrying the activity id so a duplicate
    /// `XADD` with `NOMKSTREAM` + an explicit dedup `SET NX` guard is cheap
    /// to check before writing.
    #[instrument(skip(self, payload))]
    pub async fn enqueue(
        &self,
        priority: Priority,
        idempotency_key: &str,
        payload: Value,
        destination: Option<Url>,
    ) -> Result<Uuid, Error> {
        let dedup_key = format!("federation:dedup:{idempotency_key}");
        let reserved: bool = self
            .redis
            .set(
                &dedup_key,
                "1",
                Some(Expiration::EX(self.completed_message_ttl.num_seconds())),
                Some(SetOptions::NX),
                false,
            )
            .await
            .map_err(Error::from)?;
        let msg_id = Uuid::new_v4();
        if !reserved {
            return Ok(msg_id);
        }

        let message = QueuedMessage {
            msg_id,
            priority,
            payload,
            destination,
            attempt: 0,
            first_seen: Utc::now(),
            last_error: None,
        };
        let encoded = serde_json::to_string(&message)?;
        let _id: String = self
            .redis
            .xadd(priority.stream_key(), false, None, "*", (("message", encoded),))
            .await
            .map_err(Error::from)?;
        self.trim(priority).await?;
        Ok(msg_id)
    }

    /// `consume(group, consumer) -> Message?`: blocks up to `read_timeout`,
    /// claiming one message into `consumer`'s PEL.
    #[instrument(skip(self))]
    pub async fn consume(
        &self,
        priority: Priority,
        consumer: &str,
        read_timeout: Duration,
    ) -> Result<Option<(String, QueuedMessage)>, Error> {
        let reply: Option<Vec<(String, Vec<(String, Vec<(String, String)>)>)>> = self
            .redis
            .xreadgroup_map(
                CONSUMER_GROUP,
                consumer,
                Some(1),
                Some(read_timeout.as_millis() as u64),
                false,
                priority.stream_key(),
                ">",
            )
            .await
            .map_err(Error::from)?;

        let Some(streams) = reply else { return Ok(None) };
        for (_stream, entries) in streams {
            if let Some((entry_id, fields)) = entries.into_iter().next() {
                if let Some((_, encoded)) = fields.into_iter().find(|(k, _)| k == "message") {
                    let message: QueuedMessage = serde_json::from_str(&encoded)?;
                    return Ok(Some((entry_id, message)));
                }
            }
        }
        Ok(None)
    }

    /// Reclaim entries that have sat unacked in the PEL past `claim_timeout`,
    /// handing them to `consumer`. Reclaim increments the attempt counter
    /// without affecting the retry schedule, per spec.md §4.C4.
    #[instrument(skip(self))]
    pub async fn reclaim_stale(
        &self,
        priority: Priority,
        consumer: &str,
    ) -> Result<Vec<(String, QueuedMessage)>, Error> {
        let (_cursor, claimed): (String, Vec<(String, Vec<(String, String)>)>) = self
            .redis
            .xautoclaim(
                priority.stream_key(),
                CONSUMER_GROUP,
                consumer,
                self.claim_timeout.as_millis() as u64,
                "0",
                Some(50),
                false,
            )
            .await
            .map_err(Error::from)?;

        let mut out = Vec::new();
        for (entry_id, fields) in claimed {
            if let Some((_, encoded)) = fields.into_iter().find(|(k, _)| k == "message") {
                let mut message: QueuedMessage = serde_json::from_str(&encoded)?;
                message.attempt += 1;
                out.push((entry_id, message));
            }
        }
        Ok(out)
    }

    /// `ack(group, msgId)`: acknowledge successful processing, removing the
    /// entry from the PEL.
    #[instrument(skip(self))]
    pub async fn ack(&self, priority: Priority, entry_id: &str) -> Result<(), Error> {
        let _: i64 = self
            .redis
            .xack(priority.stream_key(), CONSUMER_GROUP, entry_id)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    /// `retry(group, msgId, error)`: schedule a due-for-retry re-delivery per
    /// the verb's [RetryPolicy], acking the original PEL entry since the
    /// retry is tracked separately rather than left pending.
    #[instrument(skip(self))]
    pub async fn retry(
        &self,
        priority: Priority,
        entry_id: &str,
        mut message: QueuedMessage,
        verb: &str,
        error: String,
    ) -> Result<(), Error> {
        self.ack(priority, entry_id).await?;
        let policy = RetryPolicy::for_verb(verb);
        message.attempt += 1;
        message.last_error = Some(error.clone());

        if message.attempt >= policy.max_attempts {
            return self.deadletter(priority, message, error).await;
        }

        let delay = policy.backoff_for_attempt(message.attempt);
        let retry_key = format!("federation:retry:{}", priority.dlq_key());
        let due_at = (Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default()).timestamp();
        let encoded = serde_json::to_string(&message)?;
        let _: i64 = self
            .redis
            .zadd(retry_key, None, None, false, false, (due_at as f64, encoded))
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    /// Scheduler half of the retry table: promote every due entry back onto
    /// its source stream. Intended to run on a timer per priority.
    #[instrument(skip(self))]
    pub async fn promote_due_retries(&self, priority: Priority) -> Result<u64, Error> {
        let retry_key = format!("federation:retry:{}", priority.dlq_key());
        let now = Utc::now().timestamp() as f64;
        let due: Vec<String> = self
            .redis
            .zrangebyscore(&retry_key, 0.0, now, false, None)
            .await
            .map_err(Error::from)?;

        let mut promoted = 0u64;
        for encoded in &due {
            let _: i64 = self
                .redis
                .xadd(priority.stream_key(), false, None, "*", (("message", encoded.clone()),))
                .await
                .map_err(Error::from)?;
            promoted += 1;
        }
        if !due.is_empty() {
            let _: i64 = self
                .redis
                .zrembyscore(&retry_key, 0.0, now)
                .await
                .map_err(Error::from)?;
        }
        Ok(promoted)
    }

    /// `deadletter(group, msgId, error)`: archive the envelope permanently.
    #[instrument(skip(self, message))]
    pub async fn deadletter(
        &self,
        priority: Priority,
        message: QueuedMessage,
        error: String,
    ) -> Result<(), Error> {
        let destination = message.destination.clone().map(|d| d.to_string());
        let payload = message.payload.clone();
        let source_stream = priority.dlq_key().to_string();
        let attempts = message.attempt as i32;
        run_blocking(&self.db, move |conn| {
            diesel::insert_into(dlq_message::table)
                .values((
                    dlq_message::msg_id.eq(message.msg_id),
                    dlq_message::source_stream.eq(source_stream),
                    dlq_message::priority.eq(match priority {
                        Priority::Urgent => "urgent",
                        Priority::Normal => "normal",
                        Priority::Bulk => "bulk",
                    }),
                    dlq_message::payload.eq(payload),
                    dlq_message::destination.eq(destination),
                    dlq_message::attempts.eq(attempts),
                    dlq_message::last_error.eq(error),
                    dlq_message::archived_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Apply this message's [DeliveryOutcome], dispatching to
    /// ack/retry/deadletter as appropriate.
    pub async fn resolve(
        &self,
        priority: Priority,
        entry_id: &str,
        message: QueuedMessage,
        verb: &str,
        outcome: DeliveryOutcome,
    ) -> Result<(), Error> {
        match outcome {
            DeliveryOutcome::Ack => self.ack(priority, entry_id).await,
            DeliveryOutcome::Retry { error } => {
                self.retry(priority, entry_id, message, verb, error).await
            }
            DeliveryOutcome::Deadletter { error } => {
                self.ack(priority, entry_id).await?;
                self.deadletter(priority, message, error).await
            }
        }
    }

    /// Age-first, size-second trim to the configured soft length cap.
    async fn trim(&self, priority: Priority) -> Result<(), Error> {
        let _: i64 = self
            .redis
            .xtrim(priority.stream_key(), XCapKind::MaxLen(XCap::Approx(self.stream_length_cap)))
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    /// `stats(stream)` from spec.md §4.C4.
    pub async fn stats(&self, priority: Priority) -> Result<QueueStats, Error> {
        let length: u64 = self.redis.xlen(priority.stream_key()).await.map_err(Error::from)?;
        let pending: (u64, Option<String>, Option<String>, Vec<(String, i64)>) = self
            .redis
            .xpending(priority.stream_key(), CONSUMER_GROUP)
            .await
            .map_err(Error::from)?;
        let (pending_count, _min, _max, consumers) = pending;
        Ok(QueueStats {
            length,
            pending: pending_count,
            consumers: consumers.len() as u64,
            oldest_age: None,
        })
    }
}
