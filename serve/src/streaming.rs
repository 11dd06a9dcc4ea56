//! Streaming reply path: bounded channel between the translator pump and the
//! response body.
//!
//! The pump writes SSE frames into a 64-slot byte channel; `Body::from_stream`
//! drains it. A full channel means the client is not reading; the pump then
//! waits up to 5 s for drain before aborting (write timeout). Keepalive
//! comments go out every 10 s between the synthetic `message_start` and the
//! first real event. A mid-stream upstream error becomes one `error` event
//! plus `message_stop`; the client is never left hanging.

use crate::messages::{record_failure, record_success, RequestContext};
use crate::Services;
use anyclaude::{ChunkStream, ProxyError, StreamTranslator};
use axum::body::Body;
use axum::http::{header, StatusCode};
use bytes::Bytes;
use axum::response::Response;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use stream_event::{frame, keepalive_comment, ErrorPayload, MessageShell, StreamEvent};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Bounded frame buffer between pump and client. A slow client fills this,
/// which suspends the pump's reads from the backend (backpressure).
const EVENT_QUEUE_CAPACITY: usize = 64;

/// How long a full buffer may stall the pump before the stream is aborted.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence of `: keepalive N` comments before the first real event.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Builds the SSE response and spawns the pump task.
pub(crate) fn sse_response(
    services: Arc<Services>,
    translator: StreamTranslator,
    stream: ChunkStream,
    ctx: RequestContext,
) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(EVENT_QUEUE_CAPACITY);

    tokio::spawn(pump(services, translator, stream, ctx, tx));

    let body = Body::from_stream(
        ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>),
    );
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(body)
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

enum WriteOutcome {
    Ok,
    /// Client went away or stopped reading; abort the upstream call.
    Gone,
}

async fn write(tx: &mpsc::Sender<Bytes>, payload: String) -> WriteOutcome {
    match tokio::time::timeout(WRITE_TIMEOUT, tx.send(Bytes::from(payload))).await {
        Ok(Ok(())) => WriteOutcome::Ok,
        Ok(Err(_)) => {
            debug!("client disconnected, aborting stream");
            WriteOutcome::Gone
        }
        Err(_) => {
            warn!("client write timed out after {WRITE_TIMEOUT:?}, aborting stream");
            WriteOutcome::Gone
        }
    }
}

/// Reads the backend stream, feeds the translator, writes frames.
///
/// Dropping the pump (client gone, write timeout) drops `stream`, which
/// cancels the underlying backend request.
async fn pump(
    services: Arc<Services>,
    mut translator: StreamTranslator,
    mut stream: ChunkStream,
    ctx: RequestContext,
    tx: mpsc::Sender<Bytes>,
) {
    // The synthetic message_start goes out immediately; the translator was
    // built with skip_first_message_start so it will not emit a second one.
    let start = StreamEvent::MessageStart {
        message: MessageShell::assistant(
            translator.options().message_id.clone(),
            translator.options().model.clone(),
        ),
    };
    if matches!(write(&tx, frame(&start)).await, WriteOutcome::Gone) {
        return;
    }

    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
        KEEPALIVE_INTERVAL,
    );
    let mut keepalive_count: u64 = 0;
    let mut saw_first_event = false;

    loop {
        tokio::select! {
            chunk = stream.next() => match chunk {
                Some(Ok(chunk)) => {
                    for event in translator.feed(&chunk) {
                        saw_first_event = true;
                        if matches!(write(&tx, frame(&event)).await, WriteOutcome::Gone) {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    stream_error(&services, &ctx, &tx, &e).await;
                    return;
                }
                None => break,
            },
            _ = keepalive.tick(), if !saw_first_event => {
                keepalive_count += 1;
                if matches!(
                    write(&tx, keepalive_comment(keepalive_count)).await,
                    WriteOutcome::Gone
                ) {
                    return;
                }
            }
        }
    }

    for event in translator.finish() {
        if matches!(write(&tx, frame(&event)).await, WriteOutcome::Gone) {
            return;
        }
    }
    record_success(&services, &ctx, translator.usage());
}

/// Post-stream failure: one `error` event, one `message_stop`, clean close.
async fn stream_error(
    services: &Arc<Services>,
    ctx: &RequestContext,
    tx: &mpsc::Sender<Bytes>,
    error: &ProxyError,
) {
    warn!(error = %error, "upstream error mid-stream");
    record_failure(services, &ctx.node, error);
    let error_event = StreamEvent::Error {
        error: ErrorPayload {
            kind: error.error_type().to_string(),
            message: error.to_string(),
        },
    };
    if matches!(write(tx, frame(&error_event)).await, WriteOutcome::Gone) {
        return;
    }
    let _ = write(tx, frame(&StreamEvent::MessageStop)).await;
}
