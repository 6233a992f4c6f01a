//! Per-stream call state.
//!
//! A [`ServerCall`] owns the send half of one HTTP/2 stream and the state
//! machine around it: response headers go out at most once, trailers exactly
//! once, nothing goes out after cancellation. Cancellation converges here
//! from three sources (peer reset, deadline, forced shutdown) into a single
//! one-shot signal that handler code can watch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use h2::server::SendResponse;
use h2::{Reason, SendStream};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Response, StatusCode};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio::time::Instant;

use crate::codec::MessageFrame;
use crate::compression::CompressionFilter;
use crate::grpc_debug;
use crate::metadata::Metadata;
use crate::options::ServerOptions;
use crate::status::{Code, Status};

/// The content type stamped on every response.
pub const GRPC_CONTENT_TYPE: &str = "application/grpc+proto";

static TIMEOUT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,8})([HMSmun])$").expect("timeout pattern is valid"));

// ============================================================================
// Cancellation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Cancelled,
    Deadline,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::Cancelled => "cancelled",
            CancelReason::Deadline => "deadline",
        }
    }
}

/// One-shot cancellation signal observed by handler code.
#[derive(Clone)]
pub struct CallSignal {
    rx: tokio::sync::watch::Receiver<Option<CancelReason>>,
}

impl CallSignal {
    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    /// Resolves when the call is cancelled. Pends forever on a call that
    /// runs to completion.
    pub async fn cancelled(&mut self) -> CancelReason {
        loop {
            if let Some(reason) = *self.rx.borrow() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// ============================================================================
// ServerCall
// ============================================================================

struct Outbound {
    respond: SendResponse<Bytes>,
    stream: Option<SendStream<Bytes>>,
}

/// State for one dispatched stream.
pub struct ServerCall {
    path: String,
    filter: Mutex<CompressionFilter>,
    status: Mutex<Status>,
    deadline: Mutex<Option<Instant>>,
    cancelled: AtomicBool,
    metadata_sent: AtomicBool,
    trailers_sent: AtomicBool,
    cancel_tx: tokio::sync::watch::Sender<Option<CancelReason>>,
    outbound: tokio::sync::Mutex<Outbound>,
    max_send: Option<usize>,
    max_receive: Option<usize>,
}

impl ServerCall {
    pub fn new(
        path: impl Into<String>,
        respond: SendResponse<Bytes>,
        options: &ServerOptions,
    ) -> (Arc<Self>, CallSignal) {
        let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(None);
        let call = Arc::new(Self {
            path: path.into(),
            filter: Mutex::new(CompressionFilter::new()),
            status: Mutex::new(Status::ok()),
            deadline: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            metadata_sent: AtomicBool::new(false),
            trailers_sent: AtomicBool::new(false),
            cancel_tx,
            outbound: tokio::sync::Mutex::new(Outbound {
                respond,
                stream: None,
            }),
            max_send: options.max_send_message_length,
            max_receive: options.max_receive_message_length,
        });
        (call, CallSignal { rx: cancel_rx })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    // ------------------------------------------------------------------------
    // Inbound side
    // ------------------------------------------------------------------------

    /// Imports the request headers: converts them to [`Metadata`], feeds the
    /// compression filter, and arms the deadline from `grpc-timeout`.
    pub fn receive_metadata(&self, headers: &HeaderMap) -> Result<Metadata, Status> {
        let mut metadata = Metadata::from_http2_headers(headers);

        if let Some(raw) = metadata.get_text("grpc-timeout") {
            let Some(timeout) = parse_timeout(raw) else {
                return Err(Status::new(Code::OutOfRange, "Invalid deadline"));
            };
            grpc_debug!("call {} deadline in {:?}", self.path, timeout);
            *self.deadline.lock() = Some(Instant::now() + timeout);
            metadata.remove("grpc-timeout");
        }

        self.filter.lock().receive_metadata(&mut metadata)?;
        Ok(metadata)
    }

    /// Enforces `max_receive_message_length` against a frame's declared size.
    pub fn check_receive_size(&self, length: usize) -> Result<(), Status> {
        match self.max_receive {
            Some(limit) if length > limit => Err(Status::resource_exhausted(format!(
                "Received message larger than max ({} vs. {})",
                length, limit
            ))),
            _ => Ok(()),
        }
    }

    /// Runs one inbound frame through the compression read path.
    pub fn read_message(&self, frame: &MessageFrame) -> Result<Bytes, Status> {
        self.filter.lock().read_message(frame)
    }

    // ------------------------------------------------------------------------
    // Outbound side
    // ------------------------------------------------------------------------

    /// Serializes one response value and runs it through the compression
    /// write path, enforcing `max_send_message_length`.
    pub fn serialize_message<Res>(
        &self,
        value: &Res,
        serialize: &(dyn Fn(&Res) -> Result<Bytes, Status> + Send + Sync),
    ) -> Result<Bytes, Status> {
        let message = serialize(value)
            .map_err(|e| Status::internal(format!("Error serializing message: {}", e.details)))?;
        if let Some(limit) = self.max_send {
            if message.len() > limit {
                return Err(Status::resource_exhausted(format!(
                    "Sent message larger than max ({} vs. {})",
                    message.len(),
                    limit
                )));
            }
        }
        self.filter.lock().write_message(&message, true)
    }

    /// Sends the response headers exactly once. Extra calls and calls on a
    /// cancelled stream are no-ops.
    pub async fn send_metadata(&self, custom: Option<&Metadata>) -> Result<(), Status> {
        if self.is_cancelled() || self.metadata_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut response = Response::new(());
        *response.status_mut() = StatusCode::OK;
        let headers = response.headers_mut();
        if let Some(custom) = custom {
            headers.extend(custom.to_http2_headers());
        }
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static(GRPC_CONTENT_TYPE),
        );
        let send_encoding = self.filter.lock().send_encoding();
        headers.insert(
            HeaderName::from_static("grpc-encoding"),
            HeaderValue::from_static(send_encoding.name()),
        );
        if let Ok(accept) = HeaderValue::from_str(&CompressionFilter::accept_encoding_value()) {
            headers.insert(HeaderName::from_static("grpc-accept-encoding"), accept);
        }

        let mut outbound = self.outbound.lock().await;
        let stream = outbound
            .respond
            .send_response(response, false)
            .map_err(h2_error_to_status)?;
        outbound.stream = Some(stream);
        Ok(())
    }

    /// Streams one framed message. Headers go out first if they have not
    /// already; a cancelled call drops the write silently.
    pub async fn write_framed(&self, framed: Bytes) -> Result<(), Status> {
        if self.is_cancelled() {
            return Ok(());
        }
        self.send_metadata(None).await?;

        let mut outbound = self.outbound.lock().await;
        let stream = outbound
            .stream
            .as_mut()
            .ok_or_else(|| Status::internal("Response stream is not open"))?;
        match send_with_flow_control(stream, framed).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if err.code == Code::Cancelled {
                    self.cancel(CancelReason::Cancelled);
                    return Ok(());
                }
                Err(err)
            }
        }
    }

    /// Installs the terminal status emitted with the trailers.
    pub fn set_status(&self, status: Status) {
        *self.status.lock() = status;
    }

    /// Attaches trailing metadata to the current status, keeping metadata
    /// that is already present.
    pub fn set_trailing_metadata(&self, metadata: Metadata) {
        let mut status = self.status.lock();
        if status.metadata.is_none() {
            status.metadata = Some(metadata);
        }
    }

    /// Finishes the stream: clears the deadline and emits the trailers for
    /// the current status, exactly once. No-op on a cancelled call.
    pub async fn end(&self) -> Result<(), Status> {
        if self.is_cancelled() || self.trailers_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.deadline.lock() = None;
        self.send_metadata(None).await?;

        let trailers = self.status.lock().to_trailers();
        let mut outbound = self.outbound.lock().await;
        let stream = outbound
            .stream
            .as_mut()
            .ok_or_else(|| Status::internal("Response stream is not open"))?;
        stream.send_trailers(trailers).map_err(h2_error_to_status)?;
        Ok(())
    }

    /// Terminates the call with `status`. The first terminal error wins;
    /// failures to emit are logged, not propagated.
    pub async fn send_error(&self, status: Status) {
        if self.is_cancelled() || self.trailers_sent.load(Ordering::SeqCst) {
            return;
        }
        self.set_status(status);
        if let Err(err) = self.send_metadata(None).await {
            grpc_debug!("call {} could not send error headers: {}", self.path, err);
            return;
        }
        if let Err(err) = self.end().await {
            grpc_debug!("call {} could not send trailers: {}", self.path, err);
        }
    }

    /// The unary happy path: OK status, optional trailing metadata, one
    /// framed message, trailers.
    pub async fn send_unary(&self, framed: Bytes, trailers: Option<Metadata>) -> Result<(), Status> {
        let mut status = Status::ok();
        status.metadata = trailers;
        self.set_status(status);
        self.send_metadata(None).await?;
        self.write_framed(framed).await?;
        self.end().await
    }

    /// Marks the call cancelled and fires the one-shot signal. Later writes,
    /// ends and metadata sends become no-ops.
    pub fn cancel(&self, reason: CancelReason) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.deadline.lock() = None;
        grpc_debug!("call {} cancelled ({})", self.path, reason.as_str());
        let _ = self.cancel_tx.send(Some(reason));
    }
}

// ============================================================================
// Transport plumbing
// ============================================================================

/// Sends one framed message, waiting for HTTP/2 flow-control capacity and
/// splitting across grants as needed. Writes are emitted in submission
/// order because the caller holds the outbound lock.
async fn send_with_flow_control(
    stream: &mut SendStream<Bytes>,
    mut data: Bytes,
) -> Result<(), Status> {
    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        let granted = std::future::poll_fn(|cx| stream.poll_capacity(cx)).await;
        match granted {
            Some(Ok(capacity)) if capacity > 0 => {
                let chunk = data.split_to(capacity.min(data.len()));
                stream.send_data(chunk, false).map_err(h2_error_to_status)?;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(h2_error_to_status(err)),
            None => return Err(Status::new(Code::Cancelled, "Stream closed while sending")),
        }
    }
    Ok(())
}

/// A trailers-only response: the terminal status travels in the headers
/// frame and the stream ends without a body.
pub(crate) fn respond_trailers_only(respond: &mut SendResponse<Bytes>, status: &Status) {
    let mut response = Response::new(());
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static(GRPC_CONTENT_TYPE),
    );
    headers.extend(status.to_trailers());
    if let Err(err) = respond.send_response(response, true) {
        grpc_debug!("could not send trailers-only response: {}", err);
    }
}

/// A bare HTTP-level rejection with no gRPC trailers.
pub(crate) fn respond_http_status(respond: &mut SendResponse<Bytes>, code: StatusCode) {
    let mut response = Response::new(());
    *response.status_mut() = code;
    if let Err(err) = respond.send_response(response, true) {
        grpc_debug!("could not send HTTP {} response: {}", code, err);
    }
}

pub(crate) fn h2_error_to_status(err: h2::Error) -> Status {
    if is_peer_cancel(&err) {
        Status::new(Code::Cancelled, "Call cancelled")
    } else {
        Status::internal(format!("HTTP/2 stream error: {}", err))
    }
}

pub(crate) fn is_peer_cancel(err: &h2::Error) -> bool {
    err.is_reset() && err.reason() == Some(Reason::CANCEL)
}

/// Parses a `grpc-timeout` header value: one to eight digits and a unit.
pub(crate) fn parse_timeout(raw: &str) -> Option<Duration> {
    let captures = TIMEOUT_PATTERN.captures(raw)?;
    let value: u64 = captures[1].parse().ok()?;
    let factor_ms = match &captures[2] {
        "H" => 3_600_000.0,
        "M" => 60_000.0,
        "S" => 1_000.0,
        "m" => 1.0,
        "u" => 0.001,
        "n" => 0.000_001,
        _ => return None,
    };
    // truncated to whole milliseconds
    Some(Duration::from_millis((value as f64 * factor_ms) as u64))
}

// ============================================================================
// Tests
// ============================================================================
