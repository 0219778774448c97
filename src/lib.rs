#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

/// Configuration for this library
pub mod config;
/// Error messages returned by this library.
pub mod error;
/// Fetching of remote objects, actors and WebFinger resolution
pub mod fetch;
/// Handler dispatch: verb-specific processing of inbound activities
pub mod handlers;
/// HTTP Signatures (draft-cavage) over inbound/outbound requests
pub mod http_signatures;
/// The C5 inbox pipeline: parse, dedup, verify, validate and enqueue an
/// inbound activity, framework-agnostic
pub mod inbox;
/// LD-Signature fallback verification
pub mod ld_signatures;
/// JSON Safety Layer: bounded parsing and per-verb schema validation
pub mod json_safety;
/// Domain entities persisted by this crate
pub mod model;
/// Signs and delivers outgoing activities to follower inboxes
pub mod outbox;
/// Data structures which help to define federated messages
pub mod protocol;
/// Priority activity queue: streams, consumer groups, retry, DLQ
pub mod queue;
/// Diesel table definitions for persisted state
pub mod schema;
/// Bounded holding area for activities awaiting a causal prerequisite
pub mod suspense;
/// Traits which need to be implemented for federated data types
pub mod traits;

pub(crate) mod reqwest_shim;
/// SSRF protections applied to every outbound fetch
pub mod ssrf;

#[cfg(feature = "actix-web")]
/// Actix-web glue code
pub mod actix_web;
#[cfg(feature = "axum")]
/// Axum routing and glue code
pub mod axum;

/// Per-peer health tracking and circuit breaking
pub mod health;
/// Checkpoint persistence and query surface for debugging
pub mod observability;

pub use activitystreams_kinds as kinds;

/// Mime type for Activitypub, used for `Accept` and `Content-Type` HTTP headers
pub static FEDERATION_CONTENT_TYPE: &str = "application/activity+json";
