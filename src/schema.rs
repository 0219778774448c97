//! Diesel table definitions for the state this crate persists.
//!
//! These map directly onto the tables named in spec.md §6 ("Persisted state"):
//! `activity_log`, `queued_message` (+ `dlq_message`), `peer`, `actor_cache`,
//! `checkpoint_record`, plus the domain tables backing §3 (`actors`,
//! `content_objects`, `communities`, `votes`, `subscriptions`) and the
//! restart-surviving suspense buffer.

diesel::table! {
    actors (uri) {
        uri -> Text,
        kind -> Text,
        domain -> Text,
        preferred_handle -> Text,
        display_name -> Nullable<Text>,
        summary -> Nullable<Text>,
        public_key_pem -> Text,
        private_key_pem -> Nullable<Text>,
        inbox -> Text,
        shared_inbox -> Nullable<Text>,
        indexable -> Bool,
        manually_approves_followers -> Bool,
        local -> Bool,
        deleted -> Bool,
        last_refreshed_at -> Nullable<Timestamp>,
        stale_after -> Nullable<Timestamp>,
    }
}

diesel::table! {
    communities (actor_uri) {
        actor_uri -> Text,
        local -> Bool,
        followers_uri -> Text,
        featured_uri -> Nullable<Text>,
        moderators -> Jsonb,
    }
}

diesel::table! {
    content_objects (uri) {
        uri -> Text,
        kind -> Text,
        author_uri -> Text,
        community_uri -> Nullable<Text>,
        parent_post_uri -> Nullable<Text>,
        parent_comment_uri -> Nullable<Text>,
        body -> Text,
        content_warnings -> Jsonb,
        language -> Nullable<Text>,
        published -> Timestamp,
        updated -> Nullable<Timestamp>,
        deleted -> Bool,
        score -> Integer,
        local -> Bool,
    }
}

diesel::table! {
    votes (actor_uri, target_uri) {
        actor_uri -> Text,
        target_uri -> Text,
        direction -> Integer,
        created_at -> Timestamp,
    }
}

diesel::table! {
    subscriptions (follower_uri, target_uri) {
        follower_uri -> Text,
        target_uri -> Text,
        state -> Text,
        requested_at -> Timestamp,
        accepted_at -> Nullable<Timestamp>,
    }
}

diesel::table! {
    activity_log (id) {
        id -> Text,
        received_at -> Timestamp,
        verb -> Text,
        actor_uri -> Text,
        result -> Text,
        saved_json -> Jsonb,
    }
}

diesel::table! {
    queued_message (msg_id) {
        msg_id -> Uuid,
        priority -> Text,
        payload -> Jsonb,
        destination -> Nullable<Text>,
        attempts -> Integer,
        first_seen -> Timestamp,
        eligible_at -> Timestamp,
        last_error -> Nullable<Text>,
    }
}

diesel::table! {
    dlq_message (msg_id) {
        msg_id -> Uuid,
        source_stream -> Text,
        priority -> Text,
        payload -> Jsonb,
        destination -> Nullable<Text>,
        attempts -> Integer,
        last_error -> Text,
        archived_at -> Timestamp,
    }
}

diesel::table! {
    peer (domain) {
        domain -> Text,
        software -> Nullable<Text>,
        version -> Nullable<Text>,
        shared_inbox -> Nullable<Text>,
        health_state -> Text,
        opened_at -> Nullable<Timestamp>,
        last_success -> Nullable<Timestamp>,
        last_failure -> Nullable<Timestamp>,
        consecutive_failures -> Integer,
    }
}

diesel::table! {
    checkpoint_record (id) {
        id -> Uuid,
        request_id -> Uuid,
        timestamp -> Timestamp,
        checkpoint_name -> Text,
        status -> Text,
        activity_id -> Nullable<Text>,
        details -> Nullable<Text>,
    }
}

diesel::table! {
    seen_activity (id) {
        id -> Text,
        seen_at -> Timestamp,
    }
}

diesel::table! {
    suspense_entry (id) {
        id -> Uuid,
        awaited_uri -> Text,
        kind -> Text,
        payload -> Jsonb,
        created_at -> Timestamp,
        expires_at -> Timestamp,
    }
}

diesel::table! {
    blocks (blocker_uri, blocked_uri) {
        blocker_uri -> Text,
        blocked_uri -> Text,
        created_at -> Timestamp,
    }
}

diesel::table! {
    featured_items (community_uri, content_uri) {
        community_uri -> Text,
        content_uri -> Text,
        added_at -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    actors,
    communities,
    content_objects,
    votes,
    subscriptions,
    activity_log,
    queued_message,
    dlq_message,
    peer,
    checkpoint_record,
    suspense_entry,
    seen_activity,
    blocks,
    featured_items,
);
