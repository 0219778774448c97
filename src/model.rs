//! Domain entities from spec.md §3, plus the diesel-backed store that reads
//! and writes them.
//!
//! Local actors, local content, and local subscriptions are the authoritative
//! replica; remote actors/content/subscriptions are cached projections kept
//! eventually-consistent by [crate::handlers]. Nothing outside a handler (or
//! an explicit admin override) should write to these tables.

use crate::{error::Error, schema::*};
use chrono::{NaiveDateTime, Utc};
use diesel::{
    r2d2::{ConnectionManager, Pool, PooledConnection},
    prelude::*,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use url::Url;
use uuid::Uuid;

/// A pooled, blocking postgres connection. Diesel has no async story of its
/// own; every call into [DbPool] is expected to run inside
/// `tokio::task::spawn_blocking`, the same pattern `http_signatures.rs`
/// already uses to keep RSA key generation off the async runtime.
pub type DbPool = Pool<ConnectionManager<PgConnection>>;
pub(crate) type DbConn = PooledConnection<ConnectionManager<PgConnection>>;

/// Builds a connection pool for `database_url`.
pub fn build_pool(database_url: &str) -> Result<DbPool, Error> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder().build(manager).map_err(Error::other)
}

/// Run a blocking diesel closure against `pool` on the blocking thread pool.
/// Exposed beyond [Store] so sibling persistence concerns (checkpoints,
/// queue archival) can share the same pool without duplicating the
/// `spawn_blocking` dance.
pub(crate) async fn run_blocking<F, T>(pool: &DbPool, f: F) -> Result<T, Error>
where
    F: FnOnce(&mut DbConn) -> Result<T, diesel::result::Error> + Send + 'static,
    T: Send + 'static,
{
    with_conn(pool, f).await
}

async fn with_conn<F, T>(pool: &DbPool, f: F) -> Result<T, Error>
where
    F: FnOnce(&mut DbConn) -> Result<T, diesel::result::Error> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(Error::other)?;
        f(&mut conn).map_err(Error::from)
    })
    .await
    .map_err(Error::other)?
}

/// `Actor.kind` from spec.md §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorKind {
    /// A single user
    Person,
    /// A community (Group actor)
    Group,
    /// A service account, e.g. a bot
    Service,
    /// An application actor, e.g. the instance itself
    Application,
}

impl FromStr for ActorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Person" => ActorKind::Person,
            "Group" => ActorKind::Group,
            "Service" => ActorKind::Service,
            "Application" => ActorKind::Application,
            other => return Err(Error::SchemaInvalid {
                path: "type".to_string(),
                reason: format!("unknown actor kind {other}"),
            }),
        })
    }
}

impl ActorKind {
    /// The wire string for this kind, as used in `type`.
    pub fn as_str(self) -> &'static str {
        match self {
            ActorKind::Person => "Person",
            ActorKind::Group => "Group",
            ActorKind::Service => "Service",
            ActorKind::Application => "Application",
        }
    }
}

/// An Actor, per spec.md §3. Owned by its home instance; locally cached
/// remote actors are weak references kept alive by whatever references them.
#[derive(Clone, Debug)]
pub struct ActorRecord {
    /// Canonical URI, also the primary key.
    pub uri: Url,
    /// Person / Group / Service / Application.
    pub kind: ActorKind,
    /// Host component of `uri`.
    pub domain: String,
    /// Handle used in `name@domain` resolution.
    pub preferred_handle: String,
    /// Display name, if set.
    pub display_name: Option<String>,
    /// Free-text profile summary.
    pub summary: Option<String>,
    /// PEM-encoded public key, used to verify HTTP signatures from this actor.
    pub public_key_pem: String,
    /// PEM-encoded private key; only present for actors local to this instance.
    pub private_key_pem: Option<String>,
    /// Inbox URI.
    pub inbox: Url,
    /// Shared inbox URI, if the actor's instance advertises one.
    pub shared_inbox: Option<Url>,
    /// Whether this actor opts into search indexing.
    pub indexable: bool,
    /// Whether follow requests require explicit `Accept`.
    pub manually_approves_followers: bool,
    /// True if this instance is the authoritative home of the actor.
    pub local: bool,
    /// Set by `Delete Actor` (self-delete); a tombstoned actor stays resolvable.
    pub deleted: bool,
    /// Last time the actor document was (re)fetched.
    pub last_refreshed_at: Option<NaiveDateTime>,
    /// When the cached copy should be considered stale and a refresh attempted.
    pub stale_after: Option<NaiveDateTime>,
}

/// A Community (Group actor), per spec.md §3.
#[derive(Clone, Debug)]
pub struct CommunityRecord {
    /// The community's actor URI.
    pub actor_uri: Url,
    /// True if this instance owns the community's canonical state.
    pub local: bool,
    /// Followers collection URI.
    pub followers_uri: Url,
    /// Featured (stickied posts) collection URI, if any.
    pub featured_uri: Option<Url>,
    /// Moderator actor URIs, as cached from the community's moderator collection.
    pub moderators: Vec<Url>,
}

impl CommunityRecord {
    /// Whether `actor` has moderation authority over this community, per the
    /// moderation gates in spec.md §4.C6.
    pub fn is_moderator(&self, actor: &Url) -> bool {
        &self.actor_uri == actor || self.moderators.iter().any(|m| m == actor)
    }
}

/// `Content Object.kind` from spec.md §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentKind {
    /// A top-level post in a community.
    Post,
    /// A reply, either to a post or to another comment.
    Comment,
}

/// A Content Object (Post or Comment), per spec.md §3.
#[derive(Clone, Debug)]
pub struct ContentObjectRecord {
    /// Canonical URI.
    pub uri: Url,
    /// Post or Comment.
    pub kind: ContentKind,
    /// Weak reference to the authoring actor.
    pub author_uri: Url,
    /// Owning community, for a Post.
    pub community_uri: Option<Url>,
    /// Root post, for a Comment.
    pub parent_post_uri: Option<Url>,
    /// Immediate parent comment, for a nested reply.
    pub parent_comment_uri: Option<Url>,
    /// Rendered body.
    pub body: String,
    /// Content warnings attached to the object.
    pub content_warnings: Vec<String>,
    /// BCP-47 language tag, if given.
    pub language: Option<String>,
    /// Original publish time.
    pub published: NaiveDateTime,
    /// Last-writer-wins update time, if ever edited.
    pub updated: Option<NaiveDateTime>,
    /// Soft-delete flag; the row survives so replies keep referential integrity.
    pub deleted: bool,
    /// Net vote score.
    pub score: i32,
    /// True if this instance is the authoritative home of the object.
    pub local: bool,
}

/// `Vote.Direction` from spec.md §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteDirection {
    /// `Like`
    Up,
    /// `Dislike`
    Down,
}

impl VoteDirection {
    /// Signed contribution to a target's score.
    pub fn delta(self) -> i32 {
        match self {
            VoteDirection::Up => 1,
            VoteDirection::Down => -1,
        }
    }
}

/// A Vote, per spec.md §3. At most one per (actor, target); replacing a vote
/// is modelled upstream as `Undo Like` + `Dislike`, not as an in-place flip.
#[derive(Clone, Debug)]
pub struct VoteRecord {
    /// Voting actor.
    pub actor_uri: Url,
    /// Voted-on object.
    pub target_uri: Url,
    /// +1 or -1.
    pub direction: VoteDirection,
    /// When the vote was recorded.
    pub created_at: NaiveDateTime,
}

/// `Subscription.State` from spec.md §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    /// `Follow` received, awaiting `Accept`/`Reject`.
    Pending,
    /// Follow accepted; follower is in the target's followers collection.
    Accepted,
    /// Follow rejected.
    Rejected,
}

/// A Subscription (follow relationship), per spec.md §3.
#[derive(Clone, Debug)]
pub struct SubscriptionRecord {
    /// The actor doing the following.
    pub follower_uri: Url,
    /// The actor or community being followed.
    pub target_uri: Url,
    /// Pending / Accepted / Rejected.
    pub state: SubscriptionState,
    /// When the `Follow` was received.
    pub requested_at: NaiveDateTime,
    /// When `Accept` was received, if ever.
    pub accepted_at: Option<NaiveDateTime>,
}

/// A federated peer, per spec.md §3: created on first contact, its
/// circuit-breaker state persisted durably so it survives a restart rather
/// than silently resetting to `Closed`.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    /// The peer's domain, e.g. `mastodon.social`.
    pub domain: String,
    /// Software name reported by NodeInfo, if ever fetched.
    pub software: Option<String>,
    /// Software version reported by NodeInfo, if ever fetched.
    pub version: Option<String>,
    /// Shared inbox URI, if advertised.
    pub shared_inbox: Option<Url>,
    /// Circuit-breaker state name (`"Closed"`, `"Open"`, `"HalfOpen"`, `"Dead"`);
    /// owned and interpreted by [crate::health::HealthStore].
    pub health_state: String,
    /// When the breaker last tripped open, if currently open/half-open.
    pub opened_at: Option<NaiveDateTime>,
    /// Last successful delivery to this peer.
    pub last_success: Option<NaiveDateTime>,
    /// Last failed delivery to this peer.
    pub last_failure: Option<NaiveDateTime>,
    /// Current run of consecutive failures.
    pub consecutive_failures: i32,
}

/// Repository over the domain tables. Cheap to clone; wraps a [DbPool].
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
}

impl Store {
    /// Wrap an existing pool.
    pub fn new(pool: DbPool) -> Self {
        Store { pool }
    }

    /// Access the underlying pool, for sibling stores ([crate::observability],
    /// queue archival) that persist to the same database.
    pub fn pool_for_observability(&self) -> &DbPool {
        &self.pool
    }

    /// Look up an actor by URI, local or cached-remote.
    pub async fn find_actor(&self, uri: &Url) -> Result<Option<ActorRecord>, Error> {
        let uri_s = uri.to_string();
        with_conn(&self.pool, move |conn| {
            actors::table
                .filter(actors::uri.eq(&uri_s))
                .first::<ActorRow>(conn)
                .optional()
        })
        .await
        .map(|r| r.map(Into::into))
    }

    /// Insert or update a cached/local actor (upsert on `uri`).
    pub async fn upsert_actor(&self, actor: ActorRecord) -> Result<(), Error> {
        let row: ActorRow = actor.into();
        with_conn(&self.pool, move |conn| {
            diesel::insert_into(actors::table)
                .values(&row)
                .on_conflict(actors::uri)
                .do_update()
                .set(&row)
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Mark an actor tombstoned; referencing content is left in place.
    pub async fn tombstone_actor(&self, uri: &Url) -> Result<(), Error> {
        let uri_s = uri.to_string();
        with_conn(&self.pool, move |conn| {
            diesel::update(actors::table.filter(actors::uri.eq(uri_s)))
                .set(actors::deleted.eq(true))
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Look up a content object (Post or Comment) by URI.
    pub async fn find_content(&self, uri: &Url) -> Result<Option<ContentObjectRecord>, Error> {
        let uri_s = uri.to_string();
        with_conn(&self.pool, move |conn| {
            content_objects::table
                .filter(content_objects::uri.eq(&uri_s))
                .first::<ContentObjectRow>(conn)
                .optional()
        })
        .await
        .map(|r| r.map(Into::into))
    }

    /// Upsert a content object. Used for both `Create` and `Update`, since
    /// ActivityPub does not distinguish the two on the wire.
    pub async fn upsert_content(&self, content: ContentObjectRecord) -> Result<(), Error> {
        let row: ContentObjectRow = content.into();
        with_conn(&self.pool, move |conn| {
            diesel::insert_into(content_objects::table)
                .values(&row)
                .on_conflict(content_objects::uri)
                .do_update()
                .set(&row)
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Soft-delete a content object; replies and score are preserved.
    pub async fn tombstone_content(&self, uri: &Url) -> Result<(), Error> {
        let uri_s = uri.to_string();
        with_conn(&self.pool, move |conn| {
            diesel::update(content_objects::table.filter(content_objects::uri.eq(uri_s)))
                .set(content_objects::deleted.eq(true))
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Adjust a content object's score by `delta`.
    pub async fn adjust_score(&self, target: &Url, delta: i32) -> Result<(), Error> {
        let uri_s = target.to_string();
        with_conn(&self.pool, move |conn| {
            diesel::update(content_objects::table.filter(content_objects::uri.eq(uri_s)))
                .set(content_objects::score.eq(content_objects::score + delta))
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Look up a community by its actor URI.
    pub async fn find_community(&self, uri: &Url) -> Result<Option<CommunityRecord>, Error> {
        let uri_s = uri.to_string();
        with_conn(&self.pool, move |conn| {
            communities::table
                .filter(communities::actor_uri.eq(&uri_s))
                .first::<CommunityRow>(conn)
                .optional()
        })
        .await
        .map(|r| r.map(Into::into))
    }

    /// Look up a peer's persisted circuit-breaker state by domain.
    pub async fn find_peer(&self, domain: &str) -> Result<Option<PeerRecord>, Error> {
        let domain = domain.to_string();
        with_conn(&self.pool, move |conn| {
            peer::table
                .filter(peer::domain.eq(&domain))
                .first::<PeerRow>(conn)
                .optional()
        })
        .await
        .map(|r| r.map(Into::into))
    }

    /// Insert or update a peer's full persisted record (upsert on `domain`).
    /// Overwrites every column; prefer [Store::upsert_peer_health] for
    /// circuit-breaker-only updates so an unrelated write doesn't clobber
    /// `software`/`version`/`shared_inbox` populated elsewhere (e.g. from a
    /// NodeInfo fetch).
    pub async fn upsert_peer(&self, record: PeerRecord) -> Result<(), Error> {
        let row: PeerRow = record.into();
        with_conn(&self.pool, move |conn| {
            diesel::insert_into(peer::table)
                .values(&row)
                .on_conflict(peer::domain)
                .do_update()
                .set(&row)
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Insert or update only a peer's circuit-breaker columns, leaving
    /// `software`/`version`/`shared_inbox` untouched on conflict.
    pub async fn upsert_peer_health(
        &self,
        domain: &str,
        health_state: &str,
        opened_at: Option<NaiveDateTime>,
        last_success: Option<NaiveDateTime>,
        last_failure: Option<NaiveDateTime>,
        consecutive_failures: i32,
    ) -> Result<(), Error> {
        let domain = domain.to_string();
        let health_state = health_state.to_string();
        with_conn(&self.pool, move |conn| {
            diesel::insert_into(peer::table)
                .values((
                    peer::domain.eq(&domain),
                    peer::health_state.eq(&health_state),
                    peer::opened_at.eq(opened_at),
                    peer::last_success.eq(last_success),
                    peer::last_failure.eq(last_failure),
                    peer::consecutive_failures.eq(consecutive_failures),
                ))
                .on_conflict(peer::domain)
                .do_update()
                .set((
                    peer::health_state.eq(&health_state),
                    peer::opened_at.eq(opened_at),
                    peer::last_success.eq(last_success),
                    peer::last_failure.eq(last_failure),
                    peer::consecutive_failures.eq(consecutive_failures),
                ))
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Upsert a vote (at most one per `(actor, target)`).
    pub async fn upsert_vote(&self, vote: VoteRecord) -> Result<(), Error> {
        let row: VoteRow = vote.into();
        with_conn(&self.pool, move |conn| {
            diesel::insert_into(votes::table)
                .values(&row)
                .on_conflict((votes::actor_uri, votes::target_uri))
                .do_update()
                .set(&row)
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Delete a vote (the effect of `Undo Like`/`Undo Dislike`); returns the
    /// direction that was removed, if any, so the caller can reverse the score.
    pub async fn delete_vote(
        &self,
        actor: &Url,
        target: &Url,
    ) -> Result<Option<VoteDirection>, Error> {
        let actor_s = actor.to_string();
        let target_s = target.to_string();
        with_conn(&self.pool, move |conn| {
            let existing = votes::table
                .filter(votes::actor_uri.eq(&actor_s))
                .filter(votes::target_uri.eq(&target_s))
                .first::<VoteRow>(conn)
                .optional()?;
            if existing.is_some() {
                diesel::delete(
                    votes::table
                        .filter(votes::actor_uri.eq(&actor_s))
                        .filter(votes::target_uri.eq(&target_s)),
                )
                .execute(conn)?;
            }
            Ok(existing.map(|r| VoteRecord::from(r).direction))
        })
        .await
    }

    /// Upsert a subscription, per `Follow`/`Accept`/`Reject`.
    pub async fn upsert_subscription(&self, sub: SubscriptionRecord) -> Result<(), Error> {
        let row: SubscriptionRow = sub.into();
        with_conn(&self.pool, move |conn| {
            diesel::insert_into(subscriptions::table)
                .values(&row)
                .on_conflict((subscriptions::follower_uri, subscriptions::target_uri))
                .do_update()
                .set(&row)
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Remove a subscription, per `Undo Follow`.
    pub async fn delete_subscription(&self, follower: &Url, target: &Url) -> Result<(), Error> {
        let follower_s = follower.to_string();
        let target_s = target.to_string();
        with_conn(&self.pool, move |conn| {
            diesel::delete(
                subscriptions::table
                    .filter(subscriptions::follower_uri.eq(follower_s))
                    .filter(subscriptions::target_uri.eq(target_s)),
            )
            .execute(conn)
            .map(|_| ())
        })
        .await
    }

    /// Find a pending or accepted subscription between `follower` and `target`.
    pub async fn find_subscription(
        &self,
        follower: &Url,
        target: &Url,
    ) -> Result<Option<SubscriptionRecord>, Error> {
        let follower_s = follower.to_string();
        let target_s = target.to_string();
        with_conn(&self.pool, move |conn| {
            subscriptions::table
                .filter(subscriptions::follower_uri.eq(&follower_s))
                .filter(subscriptions::target_uri.eq(&target_s))
                .first::<SubscriptionRow>(conn)
                .optional()
        })
        .await
        .map(|r| r.map(Into::into))
    }

    /// Append an entry to the append-only activity log, for activities of
    /// lasting interest (follow requests, reports, moderation actions).
    pub async fn log_activity(
        &self,
        id: &Url,
        verb: &str,
        actor: &Url,
        result: &str,
        raw: serde_json::Value,
    ) -> Result<(), Error> {
        let id_s = id.to_string();
        let verb = verb.to_string();
        let actor_s = actor.to_string();
        let result = result.to_string();
        with_conn(&self.pool, move |conn| {
            diesel::insert_into(activity_log::table)
                .values((
                    activity_log::id.eq(id_s),
                    activity_log::received_at.eq(Utc::now().naive_utc()),
                    activity_log::verb.eq(verb),
                    activity_log::actor_uri.eq(actor_s),
                    activity_log::result.eq(result),
                    activity_log::saved_json.eq(raw),
                ))
                .on_conflict(activity_log::id)
                .do_nothing()
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Whether `id` is in the restart-surviving "recently seen" set, per the
    /// C5 inbox pipeline's duplicate check.
    pub async fn is_duplicate_activity(&self, id: &Url) -> Result<bool, Error> {
        let id_s = id.to_string();
        with_conn(&self.pool, move |conn| {
            seen_activity::table
                .filter(seen_activity::id.eq(&id_s))
                .count()
                .get_result::<i64>(conn)
        })
        .await
        .map(|count| count > 0)
    }

    /// Record `id` as seen, so a redelivery hits [Store::is_duplicate_activity].
    pub async fn record_seen_activity(&self, id: &Url) -> Result<(), Error> {
        let id_s = id.to_string();
        let now = Utc::now().naive_utc();
        with_conn(&self.pool, move |conn| {
            diesel::insert_into(seen_activity::table)
                .values((seen_activity::id.eq(id_s), seen_activity::seen_at.eq(now)))
                .on_conflict(seen_activity::id)
                .do_nothing()
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Drop seen-activity rows older than `older_than`, bounding the dedup
    /// set's size. Called by the same lifecycle worker that trims the queue.
    pub async fn trim_seen_activities(&self, older_than: NaiveDateTime) -> Result<u64, Error> {
        with_conn(&self.pool, move |conn| {
            diesel::delete(seen_activity::table.filter(seen_activity::seen_at.lt(older_than)))
                .execute(conn)
                .map(|n| n as u64)
        })
        .await
    }

    /// Resolve the inboxes of `target`'s accepted followers, collapsing to
    /// each follower's shared inbox where advertised, for the C7 fanout.
    pub async fn follower_inboxes(&self, target: &Url) -> Result<Vec<Url>, Error> {
        let target_s = target.to_string();
        let rows: Vec<(String, Option<String>)> = with_conn(&self.pool, move |conn| {
            subscriptions::table
                .inner_join(actors::table.on(actors::uri.eq(subscriptions::follower_uri)))
                .filter(subscriptions::target_uri.eq(&target_s))
                .filter(subscriptions::state.eq("Accepted"))
                .select((actors::inbox, actors::shared_inbox))
                .load(conn)
        })
        .await?;

        let mut seen = std::collections::HashSet::new();
        let mut inboxes = Vec::new();
        for (inbox, shared_inbox) in rows {
            let chosen = shared_inbox.unwrap_or(inbox);
            if let Ok(url) = chosen.parse::<Url>() {
                if seen.insert(url.clone()) {
                    inboxes.push(url);
                }
            }
        }
        Ok(inboxes)
    }

    /// Record a block by `blocker` against `blocked`, per `Block`.
    pub async fn upsert_block(&self, blocker: &Url, blocked: &Url) -> Result<(), Error> {
        let blocker_s = blocker.to_string();
        let blocked_s = blocked.to_string();
        let now = Utc::now().naive_utc();
        with_conn(&self.pool, move |conn| {
            diesel::insert_into(blocks::table)
                .values((
                    blocks::blocker_uri.eq(blocker_s),
                    blocks::blocked_uri.eq(blocked_s),
                    blocks::created_at.eq(now),
                ))
                .on_conflict((blocks::blocker_uri, blocks::blocked_uri))
                .do_nothing()
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Whether `blocker` has blocked `blocked`, consulted before fanning out
    /// deliveries sourced from `blocked` into content `blocker` follows.
    pub async fn is_blocked(&self, blocker: &Url, blocked: &Url) -> Result<bool, Error> {
        let blocker_s = blocker.to_string();
        let blocked_s = blocked.to_string();
        with_conn(&self.pool, move |conn| {
            blocks::table
                .filter(blocks::blocker_uri.eq(&blocker_s))
                .filter(blocks::blocked_uri.eq(&blocked_s))
                .count()
                .get_result::<i64>(conn)
        })
        .await
        .map(|count| count > 0)
    }

    /// Add `content` to `community`'s featured collection, per `Add`.
    pub async fn add_featured(&self, community: &Url, content: &Url) -> Result<(), Error> {
        let community_s = community.to_string();
        let content_s = content.to_string();
        let now = Utc::now().naive_utc();
        with_conn(&self.pool, move |conn| {
            diesel::insert_into(featured_items::table)
                .values((
                    featured_items::community_uri.eq(community_s),
                    featured_items::content_uri.eq(content_s),
                    featured_items::added_at.eq(now),
                ))
                .on_conflict((featured_items::community_uri, featured_items::content_uri))
                .do_nothing()
                .execute(conn)
                .map(|_| ())
        })
        .await
    }

    /// Remove `content` from `community`'s featured collection, per `Remove`.
    pub async fn remove_featured(&self, community: &Url, content: &Url) -> Result<(), Error> {
        let community_s = community.to_string();
        let content_s = content.to_string();
        with_conn(&self.pool, move |conn| {
            diesel::delete(
                featured_items::table
                    .filter(featured_items::community_uri.eq(community_s))
                    .filter(featured_items::content_uri.eq(content_s)),
            )
            .execute(conn)
            .map(|_| ())
        })
        .await
    }

    /// Move DLQ entries older than `older_than` out of the hot table, per
    /// spec.md §4.C4's "archives DLQ older than 7d to cold storage". This
    /// crate has no blob-storage dependency of its own, so "cold storage" is
    /// the structured log line emitted for each row before it is deleted;
    /// an operator's log pipeline is expected to retain it from there.
    /// Called by the same lifecycle worker that trims the queue streams.
    pub async fn archive_dlq_older_than(&self, older_than: NaiveDateTime) -> Result<u64, Error> {
        let rows: Vec<DlqRow> = with_conn(&self.pool, move |conn| {
            dlq_message::table
                .filter(dlq_message::archived_at.lt(older_than))
                .load::<DlqRow>(conn)
        })
        .await?;
        for row in &rows {
            tracing::info!(
                msg_id = %row.msg_id,
                source_stream = %row.source_stream,
                destination = ?row.destination,
                attempts = row.attempts,
                last_error = %row.last_error,
                "archiving DLQ entry to cold storage"
            );
        }
        with_conn(&self.pool, move |conn| {
            diesel::delete(dlq_message::table.filter(dlq_message::archived_at.lt(older_than)))
                .execute(conn)
                .map(|n| n as u64)
        })
        .await
    }

    /// Drop checkpoint rows past their retention window, per
    /// [crate::observability::ObservabilityStore::retention_for].
    pub async fn purge_checkpoints_older_than(&self, older_than: NaiveDateTime, status: &str) -> Result<u64, Error> {
        let status = status.to_string();
        with_conn(&self.pool, move |conn| {
            diesel::delete(
                checkpoint_record::table
                    .filter(checkpoint_record::status.eq(status))
                    .filter(checkpoint_record::timestamp.lt(older_than)),
            )
            .execute(conn)
            .map(|n| n as u64)
        })
        .await
    }
}

#[derive(Queryable)]
struct DlqRow {
    msg_id: Uuid,
    source_stream: String,
    #[allow(dead_code)]
    priority: String,
    #[allow(dead_code)]
    payload: serde_json::Value,
    destination: Option<String>,
    attempts: i32,
    last_error: String,
    #[allow(dead_code)]
    archived_at: NaiveDateTime,
}

// --- diesel row <-> domain record plumbing ---
// Diesel's derive macros need concrete, `Queryable`-friendly row types; the
// domain records above use richer types (`Url`, enums) for ergonomics at call
// sites, so each table gets a thin `*Row` twin with the conversions below.

#[derive(Queryable, Insertable, AsChangeset)]
#[diesel(table_name = actors)]
struct ActorRow {
    uri: String,
    kind: String,
    domain: String,
    preferred_handle: String,
    display_name: Option<String>,
    summary: Option<String>,
    public_key_pem: String,
    private_key_pem: Option<String>,
    inbox: String,
    shared_inbox: Option<String>,
    indexable: bool,
    manually_approves_followers: bool,
    local: bool,
    deleted: bool,
    last_refreshed_at: Option<NaiveDateTime>,
    stale_after: Option<NaiveDateTime>,
}

impl From<ActorRecord> for ActorRow {
    fn from(a: ActorRecord) -> Self {
        ActorRow {
            uri: a.uri.to_string(),
            kind: a.kind.as_str().to_string(),
            domain: a.domain,
            preferred_handle: a.preferred_handle,
            display_name: a.display_name,
            summary: a.summary,
            public_key_pem: a.public_key_pem,
            private_key_pem: a.private_key_pem,
            inbox: a.inbox.to_string(),
            shared_inbox: a.shared_inbox.map(|u| u.to_string()),
            indexable: a.indexable,
            manually_approves_followers: a.manually_approves_followers,
            local: a.local,
            deleted: a.deleted,
            last_refreshed_at: a.last_refreshed_at,
            stale_after: a.stale_after,
        }
    }
}

impl From<ActorRow> for ActorRecord {
    fn from(r: ActorRow) -> Self {
        ActorRecord {
            uri: r.uri.parse().expect("stored actor uri is valid"),
            kind: r.kind.parse().expect("stored actor kind is valid"),
            domain: r.domain,
            preferred_handle: r.preferred_handle,
            display_name: r.display_name,
            summary: r.summary,
            public_key_pem: r.public_key_pem,
            private_key_pem: r.private_key_pem,
            inbox: r.inbox.parse().expect("stored inbox uri is valid"),
            shared_inbox: r.shared_inbox.map(|u| u.parse().expect("stored shared inbox uri is valid")),
            indexable: r.indexable,
            manually_approves_followers: r.manually_approves_followers,
            local: r.local,
            deleted: r.deleted,
            last_refreshed_at: r.last_refreshed_at,
            stale_after: r.stale_after,
        }
    }
}

#[derive(Queryable, Insertable, AsChangeset)]
#[diesel(table_name = communities)]
struct CommunityRow {
    actor_uri: String,
    local: bool,
    followers_uri: String,
    featured_uri: Option<String>,
    moderators: serde_json::Value,
}

impl From<CommunityRow> for CommunityRecord {
    fn from(r: CommunityRow) -> Self {
        let moderators: Vec<String> = serde_json::from_value(r.moderators).unwrap_or_default();
        CommunityRecord {
            actor_uri: r.actor_uri.parse().expect("stored community uri is valid"),
            local: r.local,
            followers_uri: r.followers_uri.parse().expect("stored followers uri is valid"),
            featured_uri: r.featured_uri.map(|u| u.parse().expect("stored featured uri is valid")),
            moderators: moderators
                .into_iter()
                .filter_map(|m| m.parse().ok())
                .collect(),
        }
    }
}

#[derive(Queryable, Insertable, AsChangeset)]
#[diesel(table_name = peer)]
struct PeerRow {
    domain: String,
    software: Option<String>,
    version: Option<String>,
    shared_inbox: Option<String>,
    health_state: String,
    opened_at: Option<NaiveDateTime>,
    last_success: Option<NaiveDateTime>,
    last_failure: Option<NaiveDateTime>,
    consecutive_failures: i32,
}

impl From<PeerRow> for PeerRecord {
    fn from(r: PeerRow) -> Self {
        PeerRecord {
            domain: r.domain,
            software: r.software,
            version: r.version,
            shared_inbox: r.shared_inbox.and_then(|s| s.parse().ok()),
            health_state: r.health_state,
            opened_at: r.opened_at,
            last_success: r.last_success,
            last_failure: r.last_failure,
            consecutive_failures: r.consecutive_failures,
        }
    }
}

impl From<PeerRecord> for PeerRow {
    fn from(p: PeerRecord) -> Self {
        PeerRow {
            domain: p.domain,
            software: p.software,
            version: p.version,
            shared_inbox: p.shared_inbox.map(|u| u.to_string()),
            health_state: p.health_state,
            opened_at: p.opened_at,
            last_success: p.last_success,
            last_failure: p.last_failure,
            consecutive_failures: p.consecutive_failures,
        }
    }
}

#[derive(Queryable, Insertable, AsChangeset)]
#[diesel(table_name = content_objects)]
struct ContentObjectRow {
    uri: String,
    kind: String,
    author_uri: String,
    community_uri: Option<String>,
    parent_post_uri: Option<String>,
    parent_comment_uri: Option<String>,
    body: String,
    content_warnings: serde_json::Value,
    language: Option<String>,
    published: NaiveDateTime,
    updated: Option<NaiveDateTime>,
    deleted: bool,
    score: i32,
    local: bool,
}

impl From<ContentObjectRecord> for ContentObjectRow {
    fn from(c: ContentObjectRecord) -> Self {
        ContentObjectRow {
            uri: c.uri.to_string(),
            kind: match c.kind {
                ContentKind::Post => "Post".to_string(),
                ContentKind::Comment => "Comment".to_string(),
            },
            author_uri: c.author_uri.to_string(),
            community_uri: c.community_uri.map(|u| u.to_string()),
            parent_post_uri: c.parent_post_uri.map(|u| u.to_string()),
            parent_comment_uri: c.parent_comment_uri.map(|u| u.to_string()),
            body: c.body,
            content_warnings: serde_json::to_value(c.content_warnings).unwrap_or_default(),
            language: c.language,
            published: c.published,
            updated: c.updated,
            deleted: c.deleted,
            score: c.score,
            local: c.local,
        }
    }
}

impl From<ContentObjectRow> for ContentObjectRecord {
    fn from(r: ContentObjectRow) -> Self {
        ContentObjectRecord {
            uri: r.uri.parse().expect("stored content uri is valid"),
            kind: if r.kind == "Post" { ContentKind::Post } else { ContentKind::Comment },
            author_uri: r.author_uri.parse().expect("stored author uri is valid"),
            community_uri: r.community_uri.map(|u| u.parse().expect("stored community uri is valid")),
            parent_post_uri: r.parent_post_uri.map(|u| u.parse().expect("stored parent post uri is valid")),
            parent_comment_uri: r.parent_comment_uri.map(|u| u.parse().expect("stored parent comment uri is valid")),
            body: r.body,
            content_warnings: serde_json::from_value(r.content_warnings).unwrap_or_default(),
            language: r.language,
            published: r.published,
            updated: r.updated,
            deleted: r.deleted,
            score: r.score,
            local: r.local,
        }
    }
}

#[derive(Queryable, Insertable, AsChangeset)]
#[diesel(table_name = votes)]
struct VoteRow {
    actor_uri: String,
    target_uri: String,
    direction: i32,
    created_at: NaiveDateTime,
}

impl From<VoteRecord> for VoteRow {
    fn from(v: VoteRecord) -> Self {
        VoteRow {
            actor_uri: v.actor_uri.to_string(),
            target_uri: v.target_uri.to_string(),
            direction: v.direction.delta(),
            created_at: v.created_at,
        }
    }
}

impl From<VoteRow> for VoteRecord {
    fn from(r: VoteRow) -> Self {
        VoteRecord {
            actor_uri: r.actor_uri.parse().expect("stored voter uri is valid"),
            target_uri: r.target_uri.parse().expect("stored vote target uri is valid"),
            direction: if r.direction >= 0 { VoteDirection::Up } else { VoteDirection::Down },
            created_at: r.created_at,
        }
    }
}

#[derive(Queryable, Insertable, AsChangeset)]
#[diesel(table_name = subscriptions)]
struct SubscriptionRow {
    follower_uri: String,
    target_uri: String,
    state: String,
    requested_at: NaiveDateTime,
    accepted_at: Option<NaiveDateTime>,
}

impl From<SubscriptionRecord> for SubscriptionRow {
    fn from(s: SubscriptionRecord) -> Self {
        SubscriptionRow {
            follower_uri: s.follower_uri.to_string(),
            target_uri: s.target_uri.to_string(),
            state: match s.state {
                SubscriptionState::Pending => "Pending".to_string(),
                SubscriptionState::Accepted => "Accepted".to_string(),
                SubscriptionState::Rejected => "Rejected".to_string(),
            },
            requested_at: s.requested_at,
            accepted_at: s.accepted_at,
        }
    }
}

impl From<SubscriptionRow> for SubscriptionRecord {
    fn from(r: SubscriptionRow) -> Self {
        SubscriptionRecord {
            follower_uri: r.follower_uri.parse().expect("stored follower uri is valid"),
            target_uri: r.target_uri.parse().expect("stored subscription target uri is valid"),
            state: match r.state.as_str() {
                "Accepted" => SubscriptionState::Accepted,
                "Rejected" => SubscriptionState::Rejected,
                _ => SubscriptionState::Pending,
            },
            requested_at: r.requested_at,
            accepted_at: r.accepted_at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn actor_kind_round_trips() {
        for k in [ActorKind::Person, ActorKind::Group, ActorKind::Service, ActorKind::Application] {
            assert_eq!(k.as_str().parse::<ActorKind>().unwrap(), k);
        }
    }

    #[test]
    fn vote_direction_delta() {
        assert_eq!(VoteDirection::Up.delta(), 1);
        assert_eq!(VoteDirection::Down.delta(), -1);
    }

    #[test]
    fn community_moderator_check() {
        let owner: Url = "https://example.com/c/news".parse().unwrap();
        let mod_: Url = "https://example.com/u/alice".parse().unwrap();
        let stranger: Url = "https://example.com/u/mallory".parse().unwrap();
        let community = CommunityRecord {
            actor_uri: owner.clone(),
            local: true,
            followers_uri: "https://example.com/c/news/followers".parse().unwrap(),
            featured_uri: None,
            moderators: vec![mod_.clone()],
        };
        assert!(community.is_moderator(&owner));
        assert!(community.is_moderator(&mod_));
        assert!(!community.is_moderator(&stranger));
    }
}
