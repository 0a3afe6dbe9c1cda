//! Wire message ingress and SSE egress.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures_util::stream::{self, Stream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use jobhub_core::{BaseMessage, JobEvent, SourceKind};
use jobhub_router::{MessageContext, Target, TargetKind};

use crate::http::error::ApiError;
use crate::http::responses::{AcceptedResponse, MessageQuery};
use crate::hub::Hub;

type SseEventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// Accept an inbound wire message from a worker or client.
///
/// The body is parsed with the strict wire parser, so anything that is not a
/// complete envelope is rejected with 400.
pub async fn post_message(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let source_kind = match query.source.as_str() {
        "worker" => SourceKind::Worker,
        "client" => SourceKind::Client,
        other => return Err(ApiError::bad_request(format!("unknown source '{other}'"))),
    };
    if query.id.is_empty() {
        return Err(ApiError::bad_request("id must not be empty"));
    }

    hub.receive_raw(&body, MessageContext::new(source_kind, Some(query.id)))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { accepted: true })))
}

/// Open a connection for a worker, client or monitor and stream every
/// message routed to it.
pub async fn connection_stream(
    State(hub): State<Arc<Hub>>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Sse<SseEventStream>, ApiError> {
    let kind: TargetKind = kind.parse().map_err(ApiError::bad_request)?;
    let target = Target::new(kind, id);
    let receiver = hub.connections.connect(target.clone()).await;

    if kind == TargetKind::Worker {
        // A worker that connects late may already have work waiting
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = hub.dispatch_pending().await {
                warn!(error = %e, "Dispatch on worker connect failed");
            }
        });
    }

    let stream: SseEventStream = Box::pin(message_stream(receiver, target));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn message_stream(
    receiver: mpsc::Receiver<BaseMessage>,
    target: Target,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    stream::unfold((receiver, target), |(mut receiver, target)| async move {
        let message = receiver.recv().await?;
        let event = match message.to_json() {
            Ok(data) => Event::default().event(message.message_type.as_str()).data(data),
            Err(e) => {
                warn!(connection = %target, error = %e, "Failed to encode message");
                Event::default().comment("encoding error")
            }
        };
        Some((Ok(event), (receiver, target)))
    })
}

/// Stream broker lifecycle events.
pub async fn events_stream(State(hub): State<Arc<Hub>>) -> Sse<SseEventStream> {
    let receiver = hub.broker.subscribe_events();
    let stream: SseEventStream = Box::pin(event_stream(receiver));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn event_stream(
    receiver: broadcast::Receiver<JobEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    stream::unfold(receiver, |mut receiver| async move {
        match receiver.recv().await {
            Ok(event) => {
                let sse = Event::default()
                    .event(event.event_type.as_str())
                    .json_data(&event)
                    .unwrap_or_else(|_| Event::default().comment("encoding error"));
                Some((Ok(sse), receiver))
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(skipped = n, "Event stream lagged");
                Some((
                    Ok(Event::default().comment(format!("skipped {} events", n))),
                    receiver,
                ))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    })
}
