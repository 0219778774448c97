//! Handles incoming activities, verifying HTTP signatures and other checks

use crate::{
    config::Data,
    error::Error,
    fetch::object_id::ObjectId,
    http_signatures::{verify_inbox_hash, verify_signature},
    inbox::{process_inbox, InboxOutcome, RawRequest},
    traits::{ActivityHandler, Actor, Object},
};
use axum::{
    body::{Body, Bytes},
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use http::{HeaderMap, Method, Uri};
use serde::de::DeserializeOwned;
use tracing::debug;

/// Runs the C5 inbox pipeline ([process_inbox]) against one raw request, for
/// the shared, per-actor, and per-community inbox routes alike; the pipeline
/// itself doesn't distinguish between them.
pub async fn receive_pipelined<T: Clone + Send + Sync + 'static>(
    activity_data: ActivityData,
    data: &Data<T>,
) -> Response {
    let raw = RawRequest {
        headers: &activity_data.headers,
        method: &activity_data.method,
        uri: &activity_data.uri,
        body: &activity_data.body,
    };

    match process_inbox(data, raw).await {
        Ok(InboxOutcome::Enqueued { .. } | InboxOutcome::Duplicate) => StatusCode::ACCEPTED.into_response(),
        Ok(InboxOutcome::Invalid(e)) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        Ok(InboxOutcome::Unauthorized(e)) => (StatusCode::UNAUTHORIZED, e.to_string()).into_response(),
        Ok(InboxOutcome::Forbidden(e)) => (StatusCode::FORBIDDEN, e.to_string()).into_response(),
        Ok(InboxOutcome::Gone(e)) => (StatusCode::GONE, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Handles incoming activities, verifying HTTP signatures and other checks
pub async fn receive_activity<Activity, ActorT, Datatype>(
    activity_data: ActivityData,
    data: &Data<Datatype>,
) -> Result<(), <Activity as ActivityHandler>::Error>
where
    Activity: ActivityHandler<DataType = Datatype> + DeserializeOwned + Send + 'static,
    ActorT: Object<DataType = Datatype> + Actor + Send + 'static,
    for<'de2> <ActorT as Object>::Kind: serde::Deserialize<'de2>,
    <Activity as ActivityHandler>::Error: From<anyhow::Error>
        + From<Error>
        + From<<ActorT as Object>::Error>
        + From<serde_json::Error>,
    <ActorT as Object>::Error: From<Error> + From<anyhow::Error>,
    Datatype: Clone,
{
    verify_inbox_hash(activity_data.headers.get("Digest"), &activity_data.body)?;

    let activity: Activity = serde_json::from_slice(&activity_data.body)?;
    data.config.verify_url_and_domain(&activity).await?;
    let actor = ObjectId::<ActorT>::from(activity.actor().clone())
        .dereference(data)
        .await?;

    verify_signature(
        &activity_data.headers,
        &activity_data.method,
        &activity_data.uri,
        actor.public_key_pem(),
    )?;

    debug!("Receiving activity {}", activity.id().to_string());
    activity.verify(data).await?;
    activity.receive(data).await?;
    Ok(())
}

/// Contains all data that is necessary to receive an activity from an HTTP request
#[derive(Debug)]
pub struct ActivityData {
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    body: Vec<u8>,
}

impl<S> FromRequest<S> for ActivityData
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request<Body>, _state: &S) -> Result<Self, Self::Rejection> {
        let (parts, body) = req.into_parts();

        // this wont work if the body is a long running stream
        let bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()).into_response())?;

        Ok(Self {
            headers: parts.headers,
            method: parts.method,
            uri: parts.uri,
            body: bytes.to_vec(),
        })
    }
}

// TODO: copy tests from actix-web inbox and implement for axum as well
