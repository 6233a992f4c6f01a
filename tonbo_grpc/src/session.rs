//! HTTP/2 session ownership.
//!
//! One [`ServerSession`] task owns each served connection. Lifecycle
//! commands arrive over a channel rather than through shared pointers, so
//! the connection object never leaves its task. A keepalive pinger runs
//! beside the session; a missed pong destroys the connection.

use std::time::Duration;

use bytes::Bytes;
use h2::server::{Connection, SendResponse};
use h2::{Ping, PingPong, Reason, RecvStream};
use http::Request;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::grpc_debug;
use crate::options::ServerOptions;

/// Lifecycle commands a session accepts from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionControl {
    /// Stop accepting streams and let in-flight calls finish (GOAWAY).
    Close,
    /// Tear the connection down, resetting live streams with CANCEL.
    Destroy,
}

/// The server's handle to one live session.
pub(crate) struct SessionHandle {
    pub control: mpsc::UnboundedSender<SessionControl>,
}

pub(crate) struct ServerSession<T> {
    conn: Connection<T, Bytes>,
    control: mpsc::UnboundedReceiver<SessionControl>,
    keepalive_time: Duration,
    keepalive_timeout: Duration,
}

impl<T> ServerSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        conn: Connection<T, Bytes>,
        control: mpsc::UnboundedReceiver<SessionControl>,
        options: &ServerOptions,
    ) -> Self {
        Self {
            conn,
            control,
            keepalive_time: Duration::from_millis(options.keepalive_time_ms),
            keepalive_timeout: Duration::from_millis(options.keepalive_timeout_ms),
        }
    }

    /// Drives the connection until it closes, handing each accepted stream
    /// to `dispatch`.
    pub(crate) async fn serve<F>(mut self, mut dispatch: F)
    where
        F: FnMut(Request<RecvStream>, SendResponse<Bytes>),
    {
        let (dead_tx, mut dead_rx) = watch::channel(false);
        let pinger = self
            .conn
            .ping_pong()
            .map(|pp| spawn_keepalive(pp, self.keepalive_time, self.keepalive_timeout, dead_tx));

        let mut control_open = true;
        let mut keepalive_open = pinger.is_some();

        loop {
            tokio::select! {
                accepted = self.conn.accept() => match accepted {
                    Some(Ok((request, respond))) => dispatch(request, respond),
                    Some(Err(err)) => {
                        grpc_debug!("session error: {}", err);
                        break;
                    }
                    None => break,
                },
                control = self.control.recv(), if control_open => match control {
                    Some(SessionControl::Close) => self.conn.graceful_shutdown(),
                    Some(SessionControl::Destroy) => self.conn.abrupt_shutdown(Reason::CANCEL),
                    None => control_open = false,
                },
                changed = dead_rx.changed(), if keepalive_open => {
                    keepalive_open = false;
                    if changed.is_ok() && *dead_rx.borrow() {
                        grpc_debug!("keepalive timed out, destroying session");
                        self.conn.abrupt_shutdown(Reason::CANCEL);
                    }
                }
            }
        }

        if let Some(pinger) = pinger {
            pinger.abort();
        }
    }
}

/// Pings the peer every `time`; a pong missing for `timeout` flags the
/// session dead and the pinger stops.
fn spawn_keepalive(
    mut ping_pong: PingPong,
    time: Duration,
    timeout: Duration,
    dead: watch::Sender<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + time;
        let mut interval = tokio::time::interval_at(start, time);
        loop {
            interval.tick().await;
            match tokio::time::timeout(timeout, ping_pong.ping(Ping::opaque())).await {
                Ok(Ok(_pong)) => {}
                Ok(Err(err)) => {
                    // connection already going away
                    grpc_debug!("keepalive ping failed: {}", err);
                    return;
                }
                Err(_elapsed) => {
                    let _ = dead.send(true);
                    return;
                }
            }
        }
    })
}
