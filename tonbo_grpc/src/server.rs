//! The server: binding, stream dispatch and shutdown.
//!
//! A server owns an additive set of listeners, the live session set and the
//! handler registry. Each accepted connection becomes a [`ServerSession`]
//! task; each accepted stream is content-type checked, matched against the
//! registry and handed to the shape adapter behind the method path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use h2::server::SendResponse;
use h2::RecvStream;
use http::{Request, StatusCode};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::call::{respond_http_status, respond_trailers_only, ServerCall};
use crate::credentials::ServerCredentials;
use crate::error::ServerError;
use crate::handlers::InboundCall;
use crate::options::ServerOptions;
use crate::service::{HandlerRegistry, MethodHandler, ServiceDefinition};
use crate::session::{ServerSession, SessionControl, SessionHandle};
use crate::status::Status;
use crate::target::ListenTarget;
use crate::{grpc_debug, grpc_error, grpc_info};

/// State shared with listener and session tasks.
struct Shared {
    options: ServerOptions,
    registry: Mutex<HandlerRegistry>,
    sessions: Mutex<HashMap<u64, SessionHandle>>,
    next_session_id: AtomicU64,
    /// Broadcast flipped true by `force_shutdown`; every in-flight call
    /// watches it.
    shutdown: watch::Sender<bool>,
    /// Set once shutdown begins; sessions racing through their handshake
    /// check it so none outlives the drain.
    draining: AtomicBool,
    /// Notified each time a session leaves the set.
    drained: tokio::sync::Notify,
}

struct ListenerHandle {
    port: u16,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A gRPC server.
///
/// Lifecycle: bind one or more targets, register services, `start`, and
/// eventually `try_shutdown` (graceful) or `force_shutdown`.
pub struct Server {
    shared: Arc<Shared>,
    listeners: Mutex<Vec<ListenerHandle>>,
    started: AtomicBool,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                options,
                registry: Mutex::new(HandlerRegistry::new()),
                sessions: Mutex::new(HashMap::new()),
                next_session_id: AtomicU64::new(1),
                shutdown,
                draining: AtomicBool::new(false),
                drained: tokio::sync::Notify::new(),
            }),
            listeners: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Registers every method of `service`. Fails on a duplicate path or
    /// once the server has started; on failure nothing is registered.
    pub fn add_service(&self, service: ServiceDefinition) -> Result<(), ServerError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }
        let methods = service.into_methods();
        let mut registry = self.shared.registry.lock();
        for (path, _) in &methods {
            if registry.contains(path) {
                return Err(ServerError::DuplicateMethod(path.clone()));
            }
        }
        for (path, handler) in methods {
            registry.register(path, handler);
        }
        Ok(())
    }

    /// Registers a single handler. Returns `Ok(false)` without mutating when
    /// the path is already present.
    pub fn register(
        &self,
        path: impl Into<String>,
        handler: MethodHandler,
    ) -> Result<bool, ServerError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }
        Ok(self.shared.registry.lock().register(path, handler))
    }

    // ------------------------------------------------------------------------
    // Binding and lifecycle
    // ------------------------------------------------------------------------

    /// Binds one listen target and starts accepting connections on it.
    /// Returns the actual local port (1 for Unix sockets). Listeners are
    /// additive; bind as many targets as needed before `start`.
    pub async fn bind(
        &self,
        target: &str,
        credentials: Option<ServerCredentials>,
    ) -> Result<u16, ServerError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }
        let credentials = credentials.unwrap_or_else(ServerCredentials::insecure);
        let parsed = ListenTarget::parse(target, credentials.is_secure())?;
        let acceptor = credentials.tls_config().map(TlsAcceptor::from);
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = self.shared.clone();

        let (port, task) = match &parsed {
            ListenTarget::Tcp { .. } => {
                let listener = TcpListener::bind(parsed.socket_addr()).await?;
                let port = listener.local_addr()?.port();
                (port, tokio::spawn(accept_tcp(listener, acceptor, shared, stop_rx)))
            }
            ListenTarget::Unix(path) => {
                let listener = UnixListener::bind(path)?;
                (1, tokio::spawn(accept_unix(listener, acceptor, shared, stop_rx)))
            }
        };

        grpc_info!("server listening on {}", parsed.socket_addr());
        self.listeners.lock().push(ListenerHandle {
            port,
            stop: stop_tx,
            task,
        });
        Ok(port)
    }

    /// Marks the server started. Fails when nothing is bound or when called
    /// twice; the registry is frozen from here on.
    pub fn start(&self) -> Result<(), ServerError> {
        if self.listeners.lock().is_empty() {
            return Err(ServerError::NotBound);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }
        Ok(())
    }

    /// The ports of every bound listener, in bind order.
    pub fn ports(&self) -> Vec<u16> {
        self.listeners.lock().iter().map(|l| l.port).collect()
    }

    /// Graceful shutdown: stop the listeners, ask every live session to
    /// close, and resolve once everything has drained. Idempotent, with
    /// itself and with [`Server::force_shutdown`]; resolves immediately when
    /// nothing is open.
    pub async fn try_shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.shared.draining.store(true, Ordering::SeqCst);

        let listeners: Vec<ListenerHandle> = {
            let mut guard = self.listeners.lock();
            guard.drain(..).collect()
        };
        for listener in &listeners {
            let _ = listener.stop.send(true);
        }
        for listener in listeners {
            let _ = listener.task.await;
        }

        let controls: Vec<_> = self
            .shared
            .sessions
            .lock()
            .values()
            .map(|handle| handle.control.clone())
            .collect();
        for control in controls {
            let _ = control.send(SessionControl::Close);
        }

        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            // register before the emptiness check so no wakeup is lost
            notified.as_mut().enable();
            if self.shared.sessions.lock().is_empty() {
                break;
            }
            notified.await;
        }
        grpc_info!("server drained");
    }

    /// Forced shutdown: synchronously closes the listeners, destroys every
    /// live session (live streams are reset with CANCEL) and clears the
    /// session set. In-flight calls observe cancellation with reason
    /// `"cancelled"`.
    pub fn force_shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.shared.draining.store(true, Ordering::SeqCst);

        for listener in self.listeners.lock().drain(..) {
            let _ = listener.stop.send(true);
            listener.task.abort();
        }

        let _ = self.shared.shutdown.send(true);

        let handles: Vec<SessionHandle> = {
            let mut sessions = self.shared.sessions.lock();
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.control.send(SessionControl::Destroy);
        }
        self.shared.drained.notify_waiters();
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerOptions::default())
    }
}

// ============================================================================
// Accept loops
// ============================================================================

async fn accept_tcp(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    grpc_debug!("accepted connection from {}", peer);
                    let _ = socket.set_nodelay(true);
                    spawn_session(socket, acceptor.clone(), shared.clone());
                }
                Err(err) => grpc_error!("accept failed: {}", err),
            },
            _ = stop.changed() => break,
        }
    }
}

async fn accept_unix(
    listener: UnixListener,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, _peer)) => spawn_session(socket, acceptor.clone(), shared.clone()),
                Err(err) => grpc_error!("accept failed: {}", err),
            },
            _ = stop.changed() => break,
        }
    }
}

fn spawn_session<T>(socket: T, acceptor: Option<TlsAcceptor>, shared: Arc<Shared>)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match acceptor {
            Some(acceptor) => match acceptor.accept(socket).await {
                Ok(tls) => serve_connection(tls, shared).await,
                Err(err) => grpc_debug!("TLS handshake failed: {}", err),
            },
            None => serve_connection(socket, shared).await,
        }
    });
}

// ============================================================================
// Session plumbing
// ============================================================================

async fn serve_connection<T>(io: T, shared: Arc<Shared>)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut builder = h2::server::Builder::new();
    if let Some(max) = shared.options.max_concurrent_streams {
        builder.max_concurrent_streams(max);
    }
    if let Some(size) = shared.options.max_frame_size {
        builder.max_frame_size(size);
    }

    let conn = match builder.handshake::<_, Bytes>(io).await {
        Ok(conn) => conn,
        Err(err) => {
            grpc_debug!("HTTP/2 handshake failed: {}", err);
            return;
        }
    };

    let id = shared.next_session_id.fetch_add(1, Ordering::SeqCst);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    shared.sessions.lock().insert(
        id,
        SessionHandle {
            control: control_tx.clone(),
        },
    );
    // a shutdown may have raced past while this connection was still in
    // its handshake; make sure it drains with the rest
    if shared.draining.load(Ordering::SeqCst) {
        let command = if *shared.shutdown.borrow() {
            SessionControl::Destroy
        } else {
            SessionControl::Close
        };
        let _ = control_tx.send(command);
    }

    let session = ServerSession::new(conn, control_rx, &shared.options);
    let dispatch_shared = shared.clone();
    session
        .serve(move |request, respond| dispatch_stream(&dispatch_shared, request, respond))
        .await;

    shared.sessions.lock().remove(&id);
    shared.drained.notify_waiters();
}

/// Routes one accepted stream: content-type gate, registry lookup, metadata
/// parse, then the shape adapter.
fn dispatch_stream(shared: &Arc<Shared>, request: Request<RecvStream>, mut respond: SendResponse<Bytes>) {
    let grpc_content_type = request
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/grpc"))
        .unwrap_or(false);
    if !grpc_content_type {
        // not a gRPC request at all, reject at the HTTP layer
        respond_http_status(&mut respond, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        return;
    }

    let path = request.uri().path().to_string();
    let handler = shared.registry.lock().lookup(&path);
    let Some(handler) = handler else {
        respond_trailers_only(
            &mut respond,
            &Status::unimplemented(format!("The server does not implement the method {}", path)),
        );
        return;
    };

    let (parts, body) = request.into_parts();
    let (call, signal) = ServerCall::new(path, respond, &shared.options);
    let metadata = match call.receive_metadata(&parts.headers) {
        Ok(metadata) => metadata,
        Err(status) => {
            tokio::spawn(async move { call.send_error(status).await });
            return;
        }
    };

    let inbound = InboundCall {
        call,
        signal,
        metadata,
        body,
        shutdown: shared.shutdown.subscribe(),
    };
    tokio::spawn((handler.dispatch)(inbound));
}

#[cfg(test)]
mod test;
