//! The C7 Outbox / Fanout Engine: builds and signs egress envelopes,
//! resolves the follower set, groups by shared inbox, and enqueues one
//! delivery task per destination on [crate::queue], per spec.md §4.C7.

use crate::{
    error::Error,
    health::{Admission, HealthStore},
    http_signatures::sign_request,
    model::Store,
    queue::{ActivityQueue, DeliveryOutcome, Priority, QueuedMessage},
};
use bytes::Bytes;
use moka::future::Cache;
use openssl::pkey::PKey;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::{json, Value};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Semaphore;
use tracing::{instrument, warn};
use url::Url;
use uuid::Uuid;

/// Signs and delivers outgoing activities, consulting the circuit breaker
/// per destination before every send.
///
/// Bounds concurrency per spec.md §5's shared-resource policy: a per-domain
/// semaphore (default 4 permits) stops one slow peer from starving sends to
/// others, and a global semaphore (default 256) caps total outbound
/// concurrency regardless of how many destinations are in flight.
#[derive(Clone)]
pub struct Outbox {
    store: Store,
    queue: ActivityQueue,
    health: HealthStore,
    client: ClientWithMiddleware,
    domain: String,
    outbound_timeout: Duration,
    domain_semaphores: Cache<String, Arc<Semaphore>>,
    domain_concurrency_limit: u32,
    global_semaphore: Arc<Semaphore>,
}

impl Outbox {
    /// Assemble an outbox over an already-constructed queue and health
    /// store, the way [crate::config::FederationConfig] wires this crate's
    /// components together.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        queue: ActivityQueue,
        health: HealthStore,
        client: ClientWithMiddleware,
        domain: String,
        outbound_timeout: Duration,
        domain_concurrency_limit: u32,
        global_concurrency_limit: u32,
    ) -> Self {
        Outbox {
            store,
            queue,
            health,
            client,
            domain,
            outbound_timeout,
            domain_semaphores: Cache::new(10_000),
            domain_concurrency_limit,
            global_semaphore: Arc::new(Semaphore::new(global_concurrency_limit as usize)),
        }
    }

    async fn domain_semaphore(&self, domain: &str) -> Arc<Semaphore> {
        let limit = self.domain_concurrency_limit as usize;
        self.domain_semaphores
            .get_with(domain.to_string(), async move { Arc::new(Semaphore::new(limit)) })
            .await
    }

    /// Build an envelope for `activity_type` wrapping `object`, signed by
    /// `actor`, and enqueue one delivery task per entry in `destinations`.
    #[instrument(skip(self, object, private_key_pem))]
    pub async fn deliver(
        &self,
        activity_type: &str,
        actor: &Url,
        private_key_pem: &str,
        object: Value,
        to: &[Url],
        destinations: Vec<Url>,
    ) -> Result<Url, Error> {
        let id: Url = format!("https://{}/activities/{}", self.domain, Uuid::new_v4())
            .parse()
            .map_err(Error::from)?;
        let envelope = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": id.to_string(),
            "type": activity_type,
            "actor": actor.to_string(),
            "to": to.iter().map(Url::to_string).collect::<Vec<_>>(),
            "object": object,
        });

        let priority = Priority::for_verb(activity_type);
        for destination in dedup(destinations) {
            let payload = json!({
                "envelope": envelope,
                "actor": actor.to_string(),
                "private_key_pem": private_key_pem,
            });
            let idempotency_key = format!("{id}:{destination}");
            self.queue
                .enqueue(priority, &idempotency_key, payload, Some(destination))
                .await?;
        }
        Ok(id)
    }

    /// Fan an activity out to every accepted follower of `target`, collapsing
    /// to shared inboxes where advertised.
    pub async fn deliver_to_followers(
        &self,
        activity_type: &str,
        target: &Url,
        private_key_pem: &str,
        object: Value,
    ) -> Result<Url, Error> {
        let destinations = self.store.follower_inboxes(target).await?;
        let followers_collection: Url = format!("{target}/followers").parse().map_err(Error::from)?;
        self.deliver(activity_type, target, private_key_pem, object, &[followers_collection], destinations)
            .await
    }

    /// Execute one queued egress delivery task, reporting an outcome for the
    /// queue to ack/retry/deadletter, per spec.md §4.C7's delivery algorithm.
    #[instrument(skip(self, message))]
    pub async fn attempt_delivery(&self, message: &QueuedMessage) -> Result<DeliveryOutcome, Error> {
        let destination = message
            .destination
            .clone()
            .ok_or(Error::PolicyDenied("queued egress message has no destination"))?;
        let domain = destination.domain().unwrap_or_default().to_string();

        if let Admission::Blocked { reason, .. } = self.health.may_deliver(&domain).await {
            return Ok(DeliveryOutcome::Retry { error: reason.to_string() });
        }

        let domain_semaphore = self.domain_semaphore(&domain).await;
        let _global_permit = self
            .global_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(Error::other)?;
        let _domain_permit = domain_semaphore
            .acquire_owned()
            .await
            .map_err(Error::other)?;

        let envelope = message.payload.get("envelope").cloned().unwrap_or(Value::Null);
        let actor: Url = message
            .payload
            .get("actor")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .parse()
            .map_err(|_| Error::PolicyDenied("queued egress message has an invalid actor"))?;
        let private_key_pem = message
            .payload
            .get("private_key_pem")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let pkey = PKey::private_key_from_pem(private_key_pem.as_bytes()).map_err(Error::other)?;
        let body = serde_json::to_vec(&envelope)?;

        let request_builder = self
            .client
            .post(destination.as_str())
            .header("Content-Type", crate::FEDERATION_CONTENT_TYPE)
            .timeout(self.outbound_timeout)
            .body(body.clone());
        let signed = sign_request(request_builder, &actor, Bytes::from(body), pkey, false)
            .await
            .map_err(Error::other)?;

        let started = Instant::now();
        match self.client.execute(signed).await {
            Ok(response) if response.status().is_success() => {
                self.health.record_success(&domain, started.elapsed()).await;
                Ok(DeliveryOutcome::Ack)
            }
            Ok(response) => {
                let status = response.status();
                self.health.record_failure(&domain).await;
                let retryable = status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error();
                if retryable {
                    Ok(DeliveryOutcome::Retry { error: format!("{destination} responded {status}") })
                } else {
                    Ok(DeliveryOutcome::Deadletter { error: format!("{destination} responded {status}") })
                }
            }
            Err(e) => {
                warn!(%destination, error = %e, "outbound delivery failed");
                self.health.record_failure(&domain).await;
                Ok(DeliveryOutcome::Retry { error: e.to_string() })
            }
        }
    }
}

fn dedup(urls: Vec<Url>) -> Vec<Url> {
    let mut seen = std::collections::HashSet::new();
    urls.into_iter().filter(|u| seen.insert(u.clone())).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn dedup_collapses_shared_destinations() {
        let a: Url = "https://a.example/inbox".parse().unwrap();
        let b: Url = "https://b.example/inbox".parse().unwrap();
        let out = dedup(vec![a.clone(), b.clone(), a.clone()]);
        assert_eq!(out, vec![a, b]);
    }
}
