//! Utilities for fetching data from other servers

use crate::{config::Data, error::Error, http_signatures::sign_request, reqwest_shim::ResponseExt, FEDERATION_CONTENT_TYPE};
use bytes::Bytes;
use http::{HeaderValue, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::atomic::Ordering;
use tracing::info;
use url::Url;

/// Typed wrapper for collection IDs
pub mod collection_id;
/// Builders for the `.well-known/nodeinfo` discovery document and `nodeinfo/2.x` payload
pub mod nodeinfo;
/// Typed wrapper for Activitypub Object ID which helps with dereferencing and caching
pub mod object_id;
/// Resolves identifiers of the form `name@example.com`
pub mod webfinger;

/// The result of fetching an object over HTTP, together with the URL it was
/// finally served from (which may differ from the requested URL after a
/// redirect). Handlers must verify against `url`, not the original request
/// URL, so that a redirect cannot be used to smuggle an object under a
/// domain it did not actually come from.
#[derive(Debug)]
pub struct FetchObjectResponse<Kind> {
    /// The deserialized object
    pub object: Kind,
    /// The URL the object was actually served from
    pub url: Url,
}

/// Fetch a remote object over HTTP and convert to `Kind`.
///
/// [crate::fetch::object_id::ObjectId::dereference] wraps this function to add caching and
/// conversion to database type. Only use this function directly in exceptional cases where that
/// behaviour is undesired.
///
/// Every time an object is fetched via HTTP, the request counter on [Data] is incremented by one.
/// If the value exceeds [crate::config::FederationConfig::http_fetch_limit], the request is
/// aborted with [Error::RequestLimit]. This prevents denial of service attacks where an attacker
/// triggers infinite, recursive fetching of data.
pub async fn fetch_object_http<T: Clone, Kind: DeserializeOwned>(
    url: &Url,
    data: &Data<T>,
) -> Result<FetchObjectResponse<Kind>, Error> {
    let accept = HeaderValue::from_static(FEDERATION_CONTENT_TYPE);
    fetch_object_http_with_accept(url, data, &accept).await
}

/// Like [fetch_object_http], but allows specifying a custom `Accept` header. Used for example
/// by WebFinger, which expects `application/jrd+json` rather than the usual activity type.
pub async fn fetch_object_http_with_accept<T: Clone, Kind: DeserializeOwned>(
    url: &Url,
    data: &Data<T>,
    accept: &HeaderValue,
) -> Result<FetchObjectResponse<Kind>, Error> {
    let config = &data.config;
    // dont fetch local objects this way
    debug_assert!(url.domain() != Some(&config.domain));
    config.verify_url_valid(url).await?;
    info!("Fetching remote object {}", url.to_string());

    let counter = data.request_counter.fetch_add(1, Ordering::SeqCst);
    if counter > config.http_fetch_limit {
        return Err(Error::RequestLimit);
    }

    let req = config
        .client
        .get(url.as_str())
        .header("Accept", accept.clone())
        .timeout(config.request_timeout);

    let res = if let Some((actor_id, private_key_pem)) = config.signed_fetch_actor.as_ref() {
        let pkey = openssl::pkey::PKey::private_key_from_pem(private_key_pem.as_bytes())
            .map_err(Error::other)?;
        let req = sign_request(
            req,
            actor_id,
            Bytes::new(),
            pkey,
            data.config.http_signature_compat,
        )
        .await
        .map_err(Error::other)?;
        config.client.execute(req).await.map_err(Error::other)?
    } else {
        req.send().await.map_err(Error::other)?
    };

    if res.status() == StatusCode::GONE {
        return Err(Error::ObjectDeleted);
    }

    let served_from = res.url().clone();
    let object: Kind = res.json_limited(config.json_limits.max_size).await?;
    Ok(FetchObjectResponse {
        object,
        url: served_from,
    })
}
