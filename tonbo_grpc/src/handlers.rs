//! Call-shape adapters.
//!
//! Four adapters wrap a [`ServerCall`] into the object a user handler
//! receives: unary, client-streaming, server-streaming and duplex. The
//! streaming inbound path runs one deserialization at a time in a per-stream
//! pump task, so decoded messages reach user code in wire order; the bounded
//! hand-off queue withholds HTTP/2 flow-control credit while the consumer is
//! behind, which pauses the peer instead of buffering without bound.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use h2::RecvStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::call::{
    h2_error_to_status, is_peer_cancel, CallSignal, CancelReason, ServerCall,
};
use crate::codec::StreamDecoder;
use crate::grpc_debug;
use crate::metadata::Metadata;
use crate::service::{DeserializeFn, SerializeFn};
use crate::status::Status;

/// Inbound messages parked between the pump and the consumer. The HTTP/2
/// flow-control window bounds the bytes behind this.
const INBOUND_QUEUE_DEPTH: usize = 16;

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub(crate) type DispatchFn = Arc<dyn Fn(InboundCall) -> BoxFuture + Send + Sync>;

/// Everything the dispatcher hands a shape adapter for one stream.
pub struct InboundCall {
    pub(crate) call: Arc<ServerCall>,
    pub(crate) signal: CallSignal,
    pub(crate) metadata: Metadata,
    pub(crate) body: RecvStream,
    pub(crate) shutdown: watch::Receiver<bool>,
}

// ============================================================================
// User-facing call objects
// ============================================================================

/// A unary or server-streaming response value with optional trailing
/// metadata.
pub struct Reply<Res> {
    pub message: Res,
    pub trailers: Option<Metadata>,
}

impl<Res> Reply<Res> {
    pub fn new(message: Res) -> Self {
        Self {
            message,
            trailers: None,
        }
    }

    pub fn with_trailers(message: Res, trailers: Metadata) -> Self {
        Self {
            message,
            trailers: Some(trailers),
        }
    }
}

/// Call-scoped state shared by every shape: request metadata, cancellation,
/// and early response headers.
#[derive(Clone)]
pub struct CallContext {
    call: Arc<ServerCall>,
    metadata: Arc<Metadata>,
    signal: CallSignal,
}

impl CallContext {
    pub fn path(&self) -> &str {
        self.call.path()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn cancelled(&self) -> bool {
        self.call.is_cancelled()
    }

    /// A watchable handle that resolves when the call is cancelled, with the
    /// reason (`"cancelled"` or `"deadline"`).
    pub fn cancellation(&self) -> CallSignal {
        self.signal.clone()
    }

    /// Sends the response headers early, with custom metadata attached.
    /// Headers go out at most once; later calls are no-ops.
    pub async fn send_metadata(&self, metadata: &Metadata) -> Result<(), Status> {
        self.call.send_metadata(Some(metadata)).await
    }
}

/// The object a unary or server-streaming handler receives.
pub struct UnaryContext<Req> {
    request: Req,
    context: CallContext,
}

impl<Req> UnaryContext<Req> {
    pub fn request(&self) -> &Req {
        &self.request
    }

    pub fn into_request(self) -> Req {
        self.request
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn metadata(&self) -> &Metadata {
        self.context.metadata()
    }

    pub fn cancelled(&self) -> bool {
        self.context.cancelled()
    }

    pub async fn send_metadata(&self, metadata: &Metadata) -> Result<(), Status> {
        self.context.send_metadata(metadata).await
    }
}

/// Ordered sequence of deserialized request messages for client-streaming
/// and duplex handlers.
pub struct RequestStream<Req> {
    rx: mpsc::Receiver<Result<Req, Status>>,
    context: CallContext,
}

impl<Req> RequestStream<Req> {
    /// The next message in wire order; `None` once the peer half-closes.
    pub async fn next(&mut self) -> Option<Result<Req, Status>> {
        self.rx.recv().await
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn metadata(&self) -> &Metadata {
        self.context.metadata()
    }

    pub fn cancelled(&self) -> bool {
        self.context.cancelled()
    }
}

/// Writable sequence of response messages for server-streaming and duplex
/// handlers.
pub struct ResponseSink<Res> {
    call: Arc<ServerCall>,
    context: CallContext,
    serialize: SerializeFn<Res>,
    trailers: Arc<parking_lot::Mutex<Option<Metadata>>>,
}

impl<Res> ResponseSink<Res> {
    /// Serializes, frames, compresses and writes one message, honoring the
    /// stream's flow-control backpressure. Writes on a cancelled call are
    /// dropped silently; check [`ResponseSink::cancelled`] to stop producing.
    pub async fn send(&self, message: &Res) -> Result<(), Status> {
        let framed = self.call.serialize_message(message, self.serialize.as_ref())?;
        self.call.write_framed(framed).await
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn cancelled(&self) -> bool {
        self.call.is_cancelled()
    }

    pub async fn send_metadata(&self, metadata: &Metadata) -> Result<(), Status> {
        self.context.send_metadata(metadata).await
    }

    /// Installs trailing metadata for the final status. The stream itself
    /// ends when the handler returns.
    pub fn end(&self, trailers: Option<Metadata>) {
        *self.trailers.lock() = trailers;
    }
}

// ============================================================================
// Shape runners
// ============================================================================

/// Runs the handler future against the call's deadline and the server's
/// forced-shutdown signal. Deadline expiry emits `DEADLINE_EXCEEDED` and
/// cancels with reason `"deadline"`; forced shutdown cancels with
/// `"cancelled"`.
async fn drive(
    call: Arc<ServerCall>,
    mut shutdown: watch::Receiver<bool>,
    work: impl Future<Output = ()>,
) {
    let deadline = call.deadline();
    let timer = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    let forced = async {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if shutdown.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = work => {}
        _ = timer => {
            call.send_error(Status::deadline_exceeded()).await;
            call.cancel(CancelReason::Deadline);
        }
        _ = forced => {
            call.cancel(CancelReason::Cancelled);
        }
    }
}

/// Accumulates the whole inbound body, deframes it, and deserializes the
/// single message a unary request carries.
async fn receive_unary_message<Req>(
    call: &Arc<ServerCall>,
    mut body: RecvStream,
    deserialize: &DeserializeFn<Req>,
) -> Result<Req, Status> {
    let mut decoder = StreamDecoder::new();
    let mut frames = Vec::new();
    let mut flow = body.flow_control().clone();

    while let Some(chunk) = body.data().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                if is_peer_cancel(&err) {
                    call.cancel(CancelReason::Cancelled);
                }
                return Err(h2_error_to_status(err));
            }
        };
        let released = chunk.len();
        for frame in decoder.write(&chunk)? {
            call.check_receive_size(frame.payload.len())?;
            frames.push(frame);
        }
        if let Some(pending) = decoder.pending_length() {
            call.check_receive_size(pending)?;
        }
        let _ = flow.release_capacity(released);
    }

    let mut frames = frames.into_iter();
    let frame = frames
        .next()
        .ok_or_else(|| Status::internal("Received no message on a unary call"))?;
    if frames.next().is_some() {
        return Err(Status::internal("Received more than one message on a unary call"));
    }

    let raw = call.read_message(&frame)?;
    deserialize(raw)
        .map_err(|e| Status::internal(format!("Error deserializing request: {}", e.details)))
}

/// Feeds the hand-off queue from the wire, strictly one message at a time.
/// A failure is delivered once and everything still buffered is discarded.
fn spawn_inbound_pump<Req: Send + 'static>(
    call: Arc<ServerCall>,
    mut body: RecvStream,
    deserialize: DeserializeFn<Req>,
    tx: mpsc::Sender<Result<Req, Status>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut decoder = StreamDecoder::new();
        let mut flow = body.flow_control().clone();

        while let Some(chunk) = body.data().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    if is_peer_cancel(&err) {
                        call.cancel(CancelReason::Cancelled);
                    } else {
                        let _ = tx.send(Err(h2_error_to_status(err))).await;
                    }
                    return;
                }
            };
            let released = chunk.len();

            let frames = match decoder.write(&chunk) {
                Ok(frames) => frames,
                Err(status) => {
                    let _ = tx.send(Err(status)).await;
                    return;
                }
            };
            for frame in frames {
                if let Err(status) = call.check_receive_size(frame.payload.len()) {
                    let _ = tx.send(Err(status)).await;
                    return;
                }
                let raw = match call.read_message(&frame) {
                    Ok(raw) => raw,
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                };
                let message = match deserialize(raw) {
                    Ok(message) => message,
                    Err(e) => {
                        let status =
                            Status::internal(format!("Error deserializing request: {}", e.details));
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                };
                if tx.send(Ok(message)).await.is_err() {
                    return;
                }
            }
            if let Some(pending) = decoder.pending_length() {
                if let Err(status) = call.check_receive_size(pending) {
                    let _ = tx.send(Err(status)).await;
                    return;
                }
            }
            // credit returns only once every message of the chunk is queued
            let _ = flow.release_capacity(released);
        }
    })
}

fn context_for(call: &Arc<ServerCall>, metadata: Metadata, signal: CallSignal) -> CallContext {
    CallContext {
        call: call.clone(),
        metadata: Arc::new(metadata),
        signal,
    }
}

async fn finish_with_reply<Res>(
    call: &Arc<ServerCall>,
    serialize: &SerializeFn<Res>,
    outcome: Result<Reply<Res>, Status>,
) {
    match outcome {
        Ok(reply) => match call.serialize_message(&reply.message, serialize.as_ref()) {
            Ok(framed) => {
                if let Err(status) = call.send_unary(framed, reply.trailers).await {
                    grpc_debug!("call {} failed to finish: {}", call.path(), status);
                    call.send_error(status).await;
                }
            }
            Err(status) => call.send_error(status).await,
        },
        Err(status) => call.send_error(status).await,
    }
}

async fn finish_streaming(
    call: &Arc<ServerCall>,
    trailers: &parking_lot::Mutex<Option<Metadata>>,
    outcome: Result<(), Status>,
) {
    match outcome {
        Ok(()) => {
            if let Some(md) = trailers.lock().take() {
                call.set_trailing_metadata(md);
            }
            if let Err(status) = call.end().await {
                grpc_debug!("call {} failed to finish: {}", call.path(), status);
            }
        }
        Err(mut status) => {
            // metadata already attached to the error wins over end(trailers)
            if status.metadata.is_none() {
                status.metadata = trailers.lock().take();
            }
            call.send_error(status).await;
        }
    }
}

// ============================================================================
// Dispatch factories
// ============================================================================

pub(crate) fn unary_dispatch<Req, Res, F, Fut>(
    deserialize: DeserializeFn<Req>,
    serialize: SerializeFn<Res>,
    handler: F,
) -> DispatchFn
where
    Req: Send + 'static,
    Res: Send + 'static,
    F: Fn(UnaryContext<Req>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply<Res>, Status>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |inbound: InboundCall| -> BoxFuture {
        let handler = handler.clone();
        let deserialize = deserialize.clone();
        let serialize = serialize.clone();
        Box::pin(async move {
            let InboundCall {
                call,
                signal,
                metadata,
                body,
                shutdown,
            } = inbound;
            let context = context_for(&call, metadata, signal);
            let work = {
                let call = call.clone();
                async move {
                    let request = match receive_unary_message(&call, body, &deserialize).await {
                        Ok(request) => request,
                        Err(status) => return call.send_error(status).await,
                    };
                    let outcome = handler(UnaryContext { request, context }).await;
                    finish_with_reply(&call, &serialize, outcome).await;
                }
            };
            drive(call, shutdown, work).await;
        })
    })
}

pub(crate) fn client_stream_dispatch<Req, Res, F, Fut>(
    deserialize: DeserializeFn<Req>,
    serialize: SerializeFn<Res>,
    handler: F,
) -> DispatchFn
where
    Req: Send + 'static,
    Res: Send + 'static,
    F: Fn(RequestStream<Req>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply<Res>, Status>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |inbound: InboundCall| -> BoxFuture {
        let handler = handler.clone();
        let deserialize = deserialize.clone();
        let serialize = serialize.clone();
        Box::pin(async move {
            let InboundCall {
                call,
                signal,
                metadata,
                body,
                shutdown,
            } = inbound;
            let context = context_for(&call, metadata, signal);
            let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
            let pump = spawn_inbound_pump(call.clone(), body, deserialize, tx);
            let work = {
                let call = call.clone();
                async move {
                    let outcome = handler(RequestStream { rx, context }).await;
                    finish_with_reply(&call, &serialize, outcome).await;
                }
            };
            drive(call, shutdown, work).await;
            pump.abort();
        })
    })
}

pub(crate) fn server_stream_dispatch<Req, Res, F, Fut>(
    deserialize: DeserializeFn<Req>,
    serialize: SerializeFn<Res>,
    handler: F,
) -> DispatchFn
where
    Req: Send + 'static,
    Res: Send + 'static,
    F: Fn(UnaryContext<Req>, ResponseSink<Res>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |inbound: InboundCall| -> BoxFuture {
        let handler = handler.clone();
        let deserialize = deserialize.clone();
        let serialize = serialize.clone();
        Box::pin(async move {
            let InboundCall {
                call,
                signal,
                metadata,
                body,
                shutdown,
            } = inbound;
            let context = context_for(&call, metadata, signal);
            let trailers = Arc::new(parking_lot::Mutex::new(None));
            let work = {
                let call = call.clone();
                let trailers = trailers.clone();
                async move {
                    let request = match receive_unary_message(&call, body, &deserialize).await {
                        Ok(request) => request,
                        Err(status) => return call.send_error(status).await,
                    };
                    let sink = ResponseSink {
                        call: call.clone(),
                        context: context.clone(),
                        serialize,
                        trailers: trailers.clone(),
                    };
                    let outcome = handler(UnaryContext { request, context }, sink).await;
                    finish_streaming(&call, &trailers, outcome).await;
                }
            };
            drive(call, shutdown, work).await;
        })
    })
}

pub(crate) fn duplex_dispatch<Req, Res, F, Fut>(
    deserialize: DeserializeFn<Req>,
    serialize: SerializeFn<Res>,
    handler: F,
) -> DispatchFn
where
    Req: Send + 'static,
    Res: Send + 'static,
    F: Fn(RequestStream<Req>, ResponseSink<Res>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |inbound: InboundCall| -> BoxFuture {
        let handler = handler.clone();
        let deserialize = deserialize.clone();
        let serialize = serialize.clone();
        Box::pin(async move {
            let InboundCall {
                call,
                signal,
                metadata,
                body,
                shutdown,
            } = inbound;
            let context = context_for(&call, metadata, signal);
            let trailers = Arc::new(parking_lot::Mutex::new(None));
            let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
            let pump = spawn_inbound_pump(call.clone(), body, deserialize, tx);
            let work = {
                let call = call.clone();
                let trailers = trailers.clone();
                async move {
                    let sink = ResponseSink {
                        call: call.clone(),
                        context: context.clone(),
                        serialize,
                        trailers: trailers.clone(),
                    };
                    let outcome = handler(RequestStream { rx, context }, sink).await;
                    finish_streaming(&call, &trailers, outcome).await;
                }
            };
            drive(call, shutdown, work).await;
            pump.abort();
        })
    })
}

/// The synthetic handler installed for registered services that carry no
/// implementation for a method.
pub(crate) fn unimplemented_dispatch(path: String) -> DispatchFn {
    Arc::new(move |inbound: InboundCall| -> BoxFuture {
        let details = format!("The server does not implement the method {}", path);
        Box::pin(async move {
            inbound.call.send_error(Status::unimplemented(details)).await;
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_carries_optional_trailers() {
        let plain = Reply::new("value");
        assert!(plain.trailers.is_none());

        let mut md = Metadata::new();
        md.set("trailer-present", "yes").unwrap();
        let with = Reply::with_trailers("value", md);
        assert!(with.trailers.is_some());
    }
}
