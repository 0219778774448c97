//! Configuration for this library, with various federation settings
//!
//! Use [FederationConfig::builder](crate::config::FederationConfig::builder) to initialize it.
//! Building establishes the postgres pool and the redis connection backing
//! [crate::model::Store], [crate::queue::ActivityQueue], [crate::health::HealthStore],
//! [crate::suspense::SuspenseBuffer] and [crate::observability::ObservabilityStore], so
//! `build()` is async.
//!
//! ```no_run
//! # use fediverse_federation_core::config::FederationConfig;
//! # async fn run() -> Result<(), anyhow::Error> {
//! let settings = FederationConfig::builder()
//!     .domain("example.com")
//!     .app_data(())
//!     .database_url("postgres://localhost/federation")
//!     .http_fetch_limit(50)
//!     .worker_count(16)
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    error::Error,
    health::{BreakerConfig, HealthStore},
    json_safety::{JsonLimits, SchemaRegistry},
    model::{build_pool, DbPool, Store},
    observability::ObservabilityStore,
    outbox::Outbox,
    protocol::verification::verify_domains_match,
    queue::ActivityQueue,
    suspense::{SuspenseBuffer, DEFAULT_SUSPENSE_CAPACITY, DEFAULT_SUSPENSE_TTL},
    traits::ActivityHandler,
};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use fred::prelude::*;
use reqwest_middleware::ClientWithMiddleware;
use serde::de::DeserializeOwned;
use std::{
    collections::HashSet,
    ops::Deref,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use url::Url;

/// Configuration for this library, with various federation related settings
#[derive(Builder, Clone)]
#[builder(build_fn(private, name = "partial_build"))]
pub struct FederationConfig<T: Clone> {
    /// The domain where this federated instance is running
    #[builder(setter(into))]
    pub(crate) domain: String,
    /// Data which the application requires in handlers, such as database connection
    /// or configuration.
    pub(crate) app_data: T,
    /// Postgres connection string backing [crate::model::Store] and every other
    /// component that persists durable state (queue DLQ, suspense buffer,
    /// checkpoints).
    #[builder(setter(into))]
    pub(crate) database_url: String,
    /// Redis connection string backing the priority activity queue
    /// ([crate::queue::ActivityQueue]).
    #[builder(setter(into), default = "\"redis://127.0.0.1:6379\".to_string()")]
    pub(crate) redis_url: String,
    /// Maximum number of outgoing HTTP requests per incoming HTTP request. See
    /// [crate::fetch::object_id::ObjectId] for more details.
    #[builder(default = "20")]
    pub(crate) http_fetch_limit: u32,
    #[builder(default = "reqwest::Client::default().into()")]
    /// HTTP client used for all outgoing requests. Middleware can be used to add functionality
    /// like log tracing or retry of failed requests.
    pub(crate) client: ClientWithMiddleware,
    /// Number of worker threads for sending outgoing activities
    #[builder(default = "64")]
    pub(crate) worker_count: u64,
    /// Run library in debug mode. This allows usage of http and localhost urls. It also enables
    /// [crate::observability::ObservabilityStore] persistence. Do not use for production.
    #[builder(default = "false")]
    pub(crate) debug: bool,
    /// Timeout for all HTTP requests. HTTP signatures are valid for 10s, so it makes sense to
    /// use the same as timeout when sending
    #[builder(default = "Duration::from_secs(10)")]
    pub(crate) request_timeout: Duration,
    /// Function used to verify that urls are valid, See [UrlVerifier] for details.
    #[builder(default = "Box::new(DefaultUrlVerifier())")]
    pub(crate) url_verifier: Box<dyn UrlVerifier + Sync>,
    /// Enable to sign HTTP signatures according to draft 10, which does not include (created) and
    /// (expires) fields. This is required for compatibility with some software like Pleroma.
    /// <https://datatracker.ietf.org/doc/html/draft-cavage-http-signatures-10>
    /// <https://git.pleroma.social/pleroma/pleroma/-/issues/2939>
    #[builder(default = "false")]
    pub(crate) http_signature_compat: bool,
    /// Actor id + PEM private key used to sign outgoing `GET` fetches (webfinger, actor
    /// documents, objects). `None` sends fetches unsigned, which some peers reject.
    #[builder(setter(strip_option), default)]
    pub(crate) signed_fetch_actor: Option<(Url, String)>,
    /// Bounds enforced by [crate::json_safety] before an inbound body is parsed.
    #[builder(default)]
    pub(crate) json_limits: JsonLimits,
    /// Per-verb required-field schemas, from [crate::json_safety::SchemaRegistry].
    #[builder(default = "Arc::new(SchemaRegistry::default())")]
    pub(crate) schemas: Arc<SchemaRegistry>,
    /// Acceptable clock skew for HTTP Signature / LD-Signature timestamps.
    #[builder(default = "Duration::from_secs(12 * 60 * 60)")]
    pub(crate) sig_skew: Duration,
    /// How long a claimed activity queue entry may sit unacked before another
    /// consumer may reclaim it.
    #[builder(default = "Duration::from_secs(5 * 60)")]
    pub(crate) claim_timeout: Duration,
    /// Soft length cap per priority stream, enforced by age-first trimming.
    #[builder(default = "1_000_000")]
    pub(crate) stream_length_cap: u64,
    /// How long a completed message's dedup/trace metadata is retained.
    #[builder(default = "ChronoDuration::hours(24)")]
    pub(crate) completed_message_ttl: ChronoDuration,
    /// Consecutive peer failures before the circuit breaker trips open.
    #[builder(default = "5")]
    pub(crate) failure_threshold: u32,
    /// Time an open breaker waits before probing resumes.
    #[builder(default = "Duration::from_secs(5 * 60)")]
    pub(crate) recovery_timeout: Duration,
    /// Test sends admitted while a breaker is half-open.
    #[builder(default = "3")]
    pub(crate) half_open_probes: u32,
    /// Consecutive half-open successes required to close a breaker.
    #[builder(default = "3")]
    pub(crate) success_threshold: u32,
    /// No successful contact for this long, with sustained failures, marks a peer dead.
    #[builder(default = "Duration::from_secs(24 * 60 * 60)")]
    pub(crate) dead_threshold: Duration,
    /// How long an activity waits in the suspense buffer for its causal prerequisite.
    #[builder(default = "DEFAULT_SUSPENSE_TTL")]
    pub(crate) suspense_ttl: ChronoDuration,
    /// Timeout for outbound activity delivery requests.
    #[builder(default = "Duration::from_secs(10)")]
    pub(crate) outbound_timeout: Duration,
    /// Bounded concurrency per destination domain, per spec.md §5's
    /// shared-resource policy: a slow peer must not starve sends to others.
    #[builder(default = "4")]
    pub(crate) domain_concurrency_limit: u32,
    /// Global bound on concurrent outbound deliveries across all domains.
    #[builder(default = "256")]
    pub(crate) global_concurrency_limit: u32,
    /// Domains that are refused outright, for both inbound activities and outbound fetches.
    #[builder(default)]
    pub(crate) blocked_domains: HashSet<String>,
    /// `(actor, verb)` pairs permitted to bypass signature verification entirely.
    /// Empty by default, per spec's minimal-allowlist policy.
    #[builder(default)]
    pub(crate) allowlist_unsigned: HashSet<(String, String)>,
    /// Repository over the domain model. Only optional to make the builder work; it
    /// is always present once [FederationConfigBuilder::build] returns successfully.
    #[builder(setter(skip))]
    pub(crate) store: Option<Store>,
    /// The priority activity queue. See [Self::store] for why this is `Option`.
    #[builder(setter(skip))]
    pub(crate) queue: Option<ActivityQueue>,
    /// Per-peer circuit breaker. See [Self::store] for why this is `Option`.
    #[builder(setter(skip))]
    pub(crate) health: Option<HealthStore>,
    /// Suspense buffer. See [Self::store] for why this is `Option`.
    #[builder(setter(skip))]
    pub(crate) suspense: Option<SuspenseBuffer>,
    /// Checkpoint log. See [Self::store] for why this is `Option`.
    #[builder(setter(skip))]
    pub(crate) observability: Option<ObservabilityStore>,
    /// Outgoing delivery engine. See [Self::store] for why this is `Option`.
    #[builder(setter(skip))]
    pub(crate) outbox: Option<Outbox>,
}

impl<T: Clone> FederationConfig<T> {
    /// Returns a new config builder with default values.
    pub fn builder() -> FederationConfigBuilder<T> {
        FederationConfigBuilder::default()
    }

    pub(crate) async fn verify_url_and_domain<Activity, Datatype>(
        &self,
        activity: &Activity,
    ) -> Result<(), Error>
    where
        Activity: ActivityHandler<DataType = Datatype> + DeserializeOwned + Send + 'static,
    {
        verify_domains_match(activity.id(), activity.actor())?;
        self.verify_url_valid(activity.id()).await?;
        if self.is_local_url(activity.id()) {
            return Err(Error::UrlVerificationError(
                "Activity was sent from local instance",
            ));
        }

        Ok(())
    }

    /// Create new [Data] from this. You should prefer to use a middleware if possible.
    pub fn to_request_data(&self) -> Data<T> {
        Data {
            config: self.clone(),
            request_counter: Default::default(),
        }
    }

    /// Perform some security checks on URLs as mentioned in activitypub spec, and call user-supplied
    /// [`InstanceSettings.verify_url_function`].
    ///
    /// https://www.w3.org/TR/activitypub/#security-considerations
    pub(crate) async fn verify_url_valid(&self, url: &Url) -> Result<(), Error> {
        match url.scheme() {
            "https" => {}
            "http" => {
                if !self.debug {
                    return Err(Error::UrlVerificationError(
                        "Http urls are only allowed in debug mode",
                    ));
                }
            }
            _ => return Err(Error::UrlVerificationError("Invalid url scheme")),
        };

        // Urls which use our local domain are not a security risk, no further verification needed
        if self.is_local_url(url) {
            return Ok(());
        }

        if url.domain().is_none() {
            return Err(Error::UrlVerificationError("Url must have a domain"));
        }

        if self.blocked_domains.contains(url.domain().unwrap_or_default()) {
            return Err(Error::UrlVerificationError("Domain is blocked"));
        }

        if url.domain() == Some("localhost") && !self.debug {
            return Err(Error::UrlVerificationError(
                "Localhost is only allowed in debug mode",
            ));
        }

        if !crate::ssrf::port_allowed(url, self.debug) {
            return Err(Error::UrlVerificationError(
                "Port is not in the allowed outbound range",
            ));
        }

        self.url_verifier
            .verify(url)
            .await
            .map_err(Error::UrlVerificationError)?;

        Ok(())
    }

    /// Returns true if the url refers to this instance. Handles hostnames like `localhost:8540` for
    /// local debugging.
    pub(crate) fn is_local_url(&self, url: &Url) -> bool {
        let mut domain = url.host_str().expect("id has domain").to_string();
        if let Some(port) = url.port() {
            domain = format!("{}:{}", domain, port);
        }
        domain == self.domain
    }

    /// Returns the local domain
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Whether `(actor, verb)` is on the unsigned allowlist, per spec.md §4.C1 step 3.
    pub(crate) fn is_unsigned_allowlisted(&self, actor: &str, verb: &str) -> bool {
        self.allowlist_unsigned
            .contains(&(actor.to_string(), verb.to_string()))
    }

    /// The domain-model repository. Panics if called before [FederationConfigBuilder::build]
    /// has completed; every [Data] handed to application code is built from a fully
    /// constructed config.
    pub fn store(&self) -> &Store {
        self.store.as_ref().expect("FederationConfig was not built via FederationConfigBuilder::build")
    }

    /// The priority activity queue. See [Self::store] for the panic condition.
    pub fn queue(&self) -> &ActivityQueue {
        self.queue.as_ref().expect("FederationConfig was not built via FederationConfigBuilder::build")
    }

    /// The per-peer circuit breaker. See [Self::store] for the panic condition.
    pub fn health(&self) -> &HealthStore {
        self.health.as_ref().expect("FederationConfig was not built via FederationConfigBuilder::build")
    }

    /// The suspense buffer. See [Self::store] for the panic condition.
    pub fn suspense(&self) -> &SuspenseBuffer {
        self.suspense.as_ref().expect("FederationConfig was not built via FederationConfigBuilder::build")
    }

    /// The checkpoint log. See [Self::store] for the panic condition.
    pub fn observability(&self) -> &ObservabilityStore {
        self.observability.as_ref().expect("FederationConfig was not built via FederationConfigBuilder::build")
    }

    /// The outgoing delivery engine. See [Self::store] for the panic condition.
    pub fn outbox(&self) -> &Outbox {
        self.outbox.as_ref().expect("FederationConfig was not built via FederationConfigBuilder::build")
    }
}

impl<T: Clone> FederationConfigBuilder<T> {
    /// Constructs a new config instance with the values supplied to builder.
    ///
    /// Values which are not explicitly specified use the defaults. Establishes the
    /// postgres pool and redis connection, and wires up every component
    /// ([crate::model::Store], [crate::queue::ActivityQueue], [crate::health::HealthStore],
    /// [crate::suspense::SuspenseBuffer], [crate::observability::ObservabilityStore],
    /// [crate::outbox::Outbox]) that depends on them.
    pub async fn build(&mut self) -> Result<FederationConfig<T>, Error> {
        if self.client.is_none() {
            let debug = self.debug.unwrap_or(false);
            let resolver = crate::ssrf::SsrfGuardedResolver::new(debug);
            let client = reqwest::Client::builder()
                .dns_resolver(std::sync::Arc::new(resolver))
                // spec.md §4.C7 step 2: deliveries follow 0 redirects, so a
                // compromised or misconfigured peer can't bounce a signed
                // POST somewhere the circuit breaker never sees.
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .map_err(Error::other)?;
            self.client = Some(client.into());
        }
        let mut config = self.partial_build().map_err(Error::other)?;

        let pool: DbPool = build_pool(&config.database_url)?;
        let store = Store::new(pool.clone());

        let redis_config = RedisConfig::from_url(&config.redis_url).map_err(Error::from)?;
        let redis = RedisClient::new(redis_config, None, None, None);
        let _handle = redis.connect();
        redis.wait_for_connect().await.map_err(Error::from)?;

        let queue = ActivityQueue::new(
            redis,
            pool.clone(),
            config.claim_timeout,
            config.stream_length_cap,
            config.completed_message_ttl,
        )
        .await?;

        let health = HealthStore::new(
            BreakerConfig {
                failure_threshold: config.failure_threshold,
                recovery_timeout: config.recovery_timeout,
                half_open_probes: config.half_open_probes,
                success_threshold: config.success_threshold,
                dead_threshold: config.dead_threshold,
            },
            store.clone(),
        );

        let suspense = SuspenseBuffer::new(pool.clone(), config.suspense_ttl, DEFAULT_SUSPENSE_CAPACITY);
        let observability = ObservabilityStore::new(store.clone(), config.debug);
        let outbox = Outbox::new(
            store.clone(),
            queue.clone(),
            health.clone(),
            config.client.clone(),
            config.domain.clone(),
            config.outbound_timeout,
            config.domain_concurrency_limit,
            config.global_concurrency_limit,
        );

        config.store = Some(store);
        config.queue = Some(queue);
        config.health = Some(health);
        config.suspense = Some(suspense);
        config.observability = Some(observability);
        config.outbox = Some(outbox);

        Ok(config)
    }
}

impl<T: Clone> Deref for FederationConfig<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.app_data
    }
}

/// Handler for validating URLs.
///
/// This is used for implementing domain blocklists and similar functionality. It is called
/// with the ID of newly received activities, when fetching remote data from a given URL
/// and before sending an activity to a given inbox URL. If processing for this domain/URL should
/// be aborted, return an error. In case of `Ok(())`, processing continues.
///
/// ```
/// # use async_trait::async_trait;
/// # use url::Url;
/// # use fediverse_federation_core::config::UrlVerifier;
/// # #[derive(Clone)]
/// # struct DatabaseConnection();
/// # async fn get_blocklist(_: &DatabaseConnection) -> Vec<String> {
/// #     vec![]
/// # }
/// #[derive(Clone)]
/// struct Verifier {
///     db_connection: DatabaseConnection,
/// }
///
/// #[async_trait]
/// impl UrlVerifier for Verifier {
///     async fn verify(&self, url: &Url) -> Result<(), &'static str> {
///         let blocklist = get_blocklist(&self.db_connection).await;
///         let domain = url.domain().unwrap().to_string();
///         if blocklist.contains(&domain) {
///             Err("Domain is blocked")
///         } else {
///             Ok(())
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait UrlVerifier: DynClone + Send {
    /// Should return Ok iff the given url is valid for processing.
    async fn verify(&self, url: &Url) -> Result<(), &'static str>;
}

/// Default URL verifier which does nothing.
#[derive(Clone)]
struct DefaultUrlVerifier();

#[async_trait]
impl UrlVerifier for DefaultUrlVerifier {
    async fn verify(&self, _url: &Url) -> Result<(), &'static str> {
        Ok(())
    }
}

clone_trait_object!(UrlVerifier);

/// Stores data for handling one specific HTTP request.
///
/// It gives acess to the `app_data` which was passed to [FederationConfig::builder].
///
/// Additionally it contains a counter for outgoing HTTP requests. This is necessary to
/// prevent denial of service attacks, where an attacker triggers fetching of recursive objects.
///
/// <https://www.w3.org/TR/activitypub/#security-recursive-objects>
pub struct Data<T: Clone> {
    pub(crate) config: FederationConfig<T>,
    pub(crate) request_counter: AtomicU32,
}

impl<T: Clone> Data<T> {
    /// Returns the data which was stored in [FederationConfigBuilder::app_data]
    pub fn app_data(&self) -> &T {
        &self.config.app_data
    }

    /// The domain that was configured in [FederationConfig].
    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    /// Returns a new instance of `Data` with request counter set to 0.
    pub fn reset_request_count(&self) -> Self {
        Data {
            config: self.config.clone(),
            request_counter: Default::default(),
        }
    }
    /// Total number of outgoing HTTP requests made with this data.
    pub fn request_count(&self) -> u32 {
        self.request_counter.load(Ordering::Relaxed)
    }

    /// The domain-model repository.
    pub fn store(&self) -> &Store {
        self.config.store()
    }

    /// The priority activity queue.
    pub fn queue(&self) -> &ActivityQueue {
        self.config.queue()
    }

    /// The per-peer circuit breaker.
    pub fn health(&self) -> &HealthStore {
        self.config.health()
    }

    /// The suspense buffer.
    pub fn suspense(&self) -> &SuspenseBuffer {
        self.config.suspense()
    }

    /// The checkpoint log.
    pub fn observability(&self) -> &ObservabilityStore {
        self.config.observability()
    }

    /// The outgoing delivery engine.
    pub fn outbox(&self) -> &Outbox {
        self.config.outbox()
    }
}

impl<T: Clone> Deref for Data<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.config.app_data
    }
}

/// Middleware for HTTP handlers which provides access to [Data]
#[derive(Clone)]
pub struct FederationMiddleware<T: Clone>(pub(crate) FederationConfig<T>);

impl<T: Clone> FederationMiddleware<T> {
    /// Construct a new middleware instance
    pub fn new(config: FederationConfig<T>) -> Self {
        FederationMiddleware(config)
    }
}
