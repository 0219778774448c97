//! Error messages returned by this library

use url::Url;

/// What a caller should do in response to an [`Error`], per the propagation
/// policy of the inbox pipeline and the activity queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Acknowledge the message as done; retrying will not help.
    Ack,
    /// Retry later according to the queue's backoff schedule.
    Retry,
    /// Move the message straight to the dead-letter queue.
    Deadletter,
    /// Halt the worker; expects to be restarted by a supervisor.
    Halt,
}

/// Error messages returned by this library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Object was not found in local database
    #[error("Object was not found in local database")]
    NotFound,
    /// Object exists but has been tombstoned (HTTP 410)
    #[error("Object {0} has been deleted")]
    Tombstoned(Url),
    /// Request limit was reached during fetch
    #[error("Request limit was reached during fetch")]
    RequestLimit,
    /// Response body limit was reached during fetch
    #[error("Response body limit was reached during fetch")]
    ResponseBodyLimit,
    /// Object to be fetched was deleted
    #[error("Object to be fetched was deleted")]
    ObjectDeleted,
    /// url verification error
    #[error("URL failed verification: {0}")]
    UrlVerificationError(&'static str),
    /// Outbound fetch target resolved to a private/loopback/link-local address
    /// or a non-whitelisted port; refused before connecting.
    #[error("Url {0} is not allowed for server to server requests")]
    FetchSsrfRefused(Url),
    /// Incoming activity has invalid digest for body
    #[error("Incoming activity has invalid digest for body")]
    ActivityBodyDigestInvalid,
    /// Incoming activity has invalid signature
    #[error("Incoming activity has invalid signature")]
    ActivitySignatureInvalid,
    /// Request carried no signature, document had no LD-Signature, and the
    /// (actor, verb) pair is not on the unsigned allowlist.
    #[error("Request is unsigned and not covered by the allowlist")]
    MissingSignature,
    /// `Date`/`(created)` fell outside the configured clock skew tolerance.
    #[error("Signature timestamp outside allowed clock skew")]
    ClockSkew,
    /// Actor key could not be fetched to verify a signature.
    #[error("Signing actor's key is unavailable")]
    KeyUnavailable,
    /// Failed to resolve actor via webfinger
    #[error("Failed to resolve actor via webfinger")]
    WebfingerResolveFailed,
    /// JSON body exceeded a configured size/depth/key-count/string-length bound.
    #[error("{0}")]
    LimitExceeded(&'static str),
    /// Body was valid JSON but failed per-verb schema validation.
    #[error("Activity failed schema validation at {path}: {reason}")]
    SchemaInvalid {
        /// JSON-pointer-like path to the offending field
        path: String,
        /// human readable reason
        reason: String,
    },
    /// Activity host does not match actor host, or actor lacks authority for
    /// the action it attempted (moderation gate failure).
    #[error("Policy denied: {0}")]
    PolicyDenied(&'static str),
    /// serde_json parse/serialize failure
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// invalid utf8 body
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
    /// url parse failure
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),
    /// queue-level failure talking to the stream backend
    #[error("Activity queue error for {0}")]
    ActivityQueueError(Url),
    /// message exhausted its retry budget and was moved to the DLQ
    #[error("Message exhausted retry budget: {0}")]
    PoisonMessage(String),
    /// database error
    #[error(transparent)]
    Database(#[from] diesel::result::Error),
    /// database pool error
    #[error(transparent)]
    DatabasePool(#[from] diesel::r2d2::PoolError),
    /// redis/stream backend error
    #[error(transparent)]
    Redis(#[from] fred::error::RedisError),
    /// other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn other<T>(error: T) -> Self
    where
        T: Into<anyhow::Error>,
    {
        Error::Other(error.into())
    }

    /// What the inbox pipeline / queue consumer should do in response to this
    /// error, per the propagation policy (spec.md §7).
    pub fn disposition(&self) -> ErrorDisposition {
        use Error::{
            ActivityBodyDigestInvalid,
            ActivityQueueError,
            ActivitySignatureInvalid,
            ClockSkew,
            Database,
            DatabasePool,
            FetchSsrfRefused,
            KeyUnavailable,
            LimitExceeded,
            MissingSignature,
            ObjectDeleted,
            PoisonMessage,
            PolicyDenied,
            Redis,
            SchemaInvalid,
            Tombstoned,
        };
        match self {
            LimitExceeded(_) | SchemaInvalid { .. } => ErrorDisposition::Ack,
            MissingSignature
            | ActivitySignatureInvalid
            | ActivityBodyDigestInvalid
            | ClockSkew
            | KeyUnavailable => ErrorDisposition::Ack,
            PolicyDenied(_) => ErrorDisposition::Ack,
            Tombstoned(_) | ObjectDeleted => ErrorDisposition::Ack,
            FetchSsrfRefused(_) => ErrorDisposition::Ack,
            PoisonMessage(_) => ErrorDisposition::Deadletter,
            Database(_) | DatabasePool(_) | Redis(_) | ActivityQueueError(_) => {
                ErrorDisposition::Halt
            }
            _ => ErrorDisposition::Retry,
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}
