//! The relay: one upstream connection, many clients.
//!
//! Tasks:
//! - the accept loop, driven by [`Relay::serve`]
//! - one broadcast task reading upstream and fanning out to every client
//! - one upstream writer owning the server's write half (fan-in)
//! - per client, a forwarding task and a writer task
//!
//! Losing the upstream connection ends the relay. There is no reconnect:
//! the caller gets the error back and is expected to exit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::clients::{ClientId, ClientSet, OutboundQueue};
use crate::config::BncConfig;
use crate::error::{FrameError, RelayError};
use crate::framer::LineFramer;
use crate::intercept::{ClientCommandInterceptor, NicknameClaim};
use crate::keepalive::UpstreamKeepaliveFilter;
use crate::line::Line;

/// Lines waiting for the upstream writer before senders have to wait.
const UPSTREAM_QUEUE: usize = 1024;

/// Max queued lines written to a client per flush.
const CLIENT_BATCH: usize = 64;

/// How long a departing client's writer may keep flushing queued lines.
const CLIENT_DRAIN_GRACE: Duration = Duration::from_secs(2);

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Lifecycle of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Listening; upstream is dialed when the first client arrives.
    AwaitingFirstClient,
    Running,
    /// Upstream is gone and every client has been let go.
    Terminated,
}

struct Shared {
    config: BncConfig,
    clients: ClientSet,
    nick: Arc<NicknameClaim>,
    state: watch::Sender<RelayState>,
    sessions: AtomicUsize,
}

/// Counts one client session while it is alive, including aborted ones.
struct SessionGuard(Arc<Shared>);

impl SessionGuard {
    fn enter(shared: &Arc<Shared>) -> Self {
        shared.sessions.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(shared))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Pause between failed accepts. Doubles per consecutive failure.
struct AcceptBackoff {
    next: Duration,
}

impl AcceptBackoff {
    fn new() -> Self {
        Self {
            next: ACCEPT_BACKOFF_MIN,
        }
    }

    fn on_error(&mut self) -> Duration {
        let wait = self.next;
        self.next = (wait * 2).min(ACCEPT_BACKOFF_MAX);
        wait
    }

    fn reset(&mut self) {
        self.next = ACCEPT_BACKOFF_MIN;
    }
}

/// Read-only view of a running relay.
#[derive(Clone)]
pub struct RelayHandle {
    shared: Arc<Shared>,
}

impl RelayHandle {
    pub fn state(&self) -> RelayState {
        *self.shared.state.borrow()
    }

    /// Resolve once the relay has reached `state`.
    pub async fn wait_for(&self, state: RelayState) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == state).await;
    }

    /// Clients currently receiving broadcasts.
    pub fn client_count(&self) -> usize {
        self.shared.clients.len()
    }

    /// Client sessions whose tasks have not finished yet.
    ///
    /// Trails [`client_count`](Self::client_count) while a departing
    /// client's writer drains.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.load(Ordering::Relaxed)
    }

    /// Nickname claimed by the first registering client, if any.
    pub fn nickname(&self) -> Option<String> {
        self.shared.nick.nickname()
    }
}

pub struct Relay {
    shared: Arc<Shared>,
}

impl Relay {
    pub fn new(config: BncConfig) -> Self {
        let (state, _) = watch::channel(RelayState::AwaitingFirstClient);
        Self {
            shared: Arc::new(Shared {
                config,
                clients: ClientSet::new(),
                nick: Arc::new(NicknameClaim::new()),
                state,
                sessions: AtomicUsize::new(0),
            }),
        }
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Bind the configured listen address and serve until upstream is lost.
    pub async fn run(self) -> Result<(), RelayError> {
        self.shared.config.validate()?;
        let addr = self.shared.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: addr.clone(),
                source,
            })?;
        tracing::info!("Listening on {addr}");
        self.serve(listener).await
    }

    /// Serve clients from an already-bound listener.
    ///
    /// Only returns on failure: a startup error, or the loss of upstream,
    /// which always ends in [`RelayState::Terminated`].
    pub async fn serve(self, listener: TcpListener) -> Result<(), RelayError> {
        self.shared.config.validate()?;

        let (first, peer) = listener.accept().await.map_err(RelayError::Accept)?;
        tracing::info!(%peer, "First client connected");

        let upstream_addr = self.shared.config.upstream().to_string();
        let upstream = TcpStream::connect(&upstream_addr)
            .await
            .map_err(|source| RelayError::Dial {
                addr: upstream_addr.clone(),
                source,
            })?;
        let _ = upstream.set_nodelay(true);
        tracing::info!(addr = %upstream_addr, "Connected to upstream");

        let (up_read, up_write) = upstream.into_split();
        let (up_tx, up_rx) = mpsc::channel::<Line>(UPSTREAM_QUEUE);
        let mut writer = tokio::spawn(upstream_writer(up_write, up_rx));

        let mut sessions = JoinSet::new();
        self.admit(first, peer, &up_tx, &mut sessions);

        let filter = UpstreamKeepaliveFilter::new(LineFramer::new(up_read), up_tx.clone());
        let mut broadcast = tokio::spawn(broadcast_loop(filter, Arc::clone(&self.shared)));
        self.shared.state.send_replace(RelayState::Running);

        let mut backoff = AcceptBackoff::new();
        let lost = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        backoff.reset();
                        self.admit(stream, peer, &up_tx, &mut sessions);
                    }
                    Err(e) => {
                        let wait = backoff.on_error();
                        tracing::warn!(?wait, "Accept error: {e}");
                        tokio::time::sleep(wait).await;
                    }
                },
                res = &mut broadcast => {
                    break res.unwrap_or_else(|e| RelayError::UpstreamRead(FrameError::Io(
                        std::io::Error::other(e),
                    )));
                }
                res = &mut writer => {
                    break match res {
                        Ok(Err(e)) => e,
                        Ok(Ok(())) => RelayError::UpstreamClosed,
                        Err(e) => RelayError::UpstreamWrite(std::io::Error::other(e)),
                    };
                }
                Some(done) = sessions.join_next() => {
                    if let Err(e) = done {
                        tracing::warn!("Client task failed: {e}");
                    }
                }
            }
        };

        tracing::error!("Upstream lost, shutting down relay: {lost}");
        self.shared.state.send_replace(RelayState::Terminated);
        self.shared.clients.close_all();
        broadcast.abort();
        writer.abort();
        sessions.shutdown().await;
        Err(lost)
    }

    /// Register a client and start its forwarding and writer tasks.
    fn admit(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        upstream: &mpsc::Sender<Line>,
        sessions: &mut JoinSet<()>,
    ) {
        let id = ClientId::next();
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();

        let queue = Arc::new(OutboundQueue::new(self.shared.config.client_queue));
        self.shared.clients.admit(id, Arc::clone(&queue));
        tracing::info!(
            client = %id,
            %peer,
            clients = self.shared.clients.len(),
            "Client connected"
        );

        let interceptor = ClientCommandInterceptor::new(
            id,
            LineFramer::new(read),
            Arc::clone(&queue),
            Arc::clone(&self.shared.nick),
            self.shared.config.prefix.clone(),
        );
        let session = SessionGuard::enter(&self.shared);
        let upstream = upstream.clone();
        sessions.spawn(async move {
            let shared = &session.0;
            let mut writer = tokio::spawn(client_writer(id, write, queue));
            forward_client(interceptor, upstream).await;
            shared.clients.remove(id);
            // A client that stopped reading can block its writer forever
            if timeout(CLIENT_DRAIN_GRACE, &mut writer).await.is_err() {
                tracing::debug!(client = %id, "Writer still blocked, discarding queued lines");
                writer.abort();
            }
            tracing::info!(client = %id, clients = shared.clients.len(), "Client gone");
        });
    }
}

/// Upstream lines to every client, until upstream fails.
async fn broadcast_loop<R: AsyncRead + Unpin>(
    mut filter: UpstreamKeepaliveFilter<R>,
    shared: Arc<Shared>,
) -> RelayError {
    loop {
        match filter.next_line().await {
            Ok(line) => {
                tracing::debug!(target: "freeq_bnc::traffic", "{line}");
                shared.clients.broadcast(&line);
            }
            Err(e) => {
                tracing::info!(answered = filter.answered(), "Upstream keep-alives answered");
                return e;
            }
        }
    }
}

/// Client lines to upstream until QUIT, a client error, or upstream going away.
async fn forward_client<R: AsyncRead + Unpin>(
    mut interceptor: ClientCommandInterceptor<R>,
    upstream: mpsc::Sender<Line>,
) {
    let id = interceptor.id();
    loop {
        match interceptor.next_forward().await {
            Ok(Some(line)) => {
                if upstream.send(line).await.is_err() {
                    tracing::debug!(client = %id, "Upstream writer gone");
                    return;
                }
            }
            Ok(None) => return,
            Err(FrameError::Closed) => {
                tracing::info!(client = %id, "Client closed connection");
                return;
            }
            Err(e) => {
                tracing::warn!(client = %id, "Client read error: {e}");
                return;
            }
        }
    }
}

/// Drain a client's queue onto its socket.
async fn client_writer(id: ClientId, mut write: OwnedWriteHalf, queue: Arc<OutboundQueue>) {
    let mut reported = 0;
    while let Some(line) = queue.pop().await {
        if let Err(e) = write.write_all(&line.to_wire()).await {
            tracing::warn!(client = %id, "Write error: {e}");
            queue.close();
            return;
        }
        // Drain whatever else is queued before flushing
        let mut batch = 0;
        while batch < CLIENT_BATCH {
            let Some(queued) = queue.try_pop() else { break };
            if let Err(e) = write.write_all(&queued.to_wire()).await {
                tracing::warn!(client = %id, "Write error: {e}");
                queue.close();
                return;
            }
            batch += 1;
        }
        if let Err(e) = write.flush().await {
            tracing::warn!(client = %id, "Flush error: {e}");
            queue.close();
            return;
        }
        let dropped = queue.dropped();
        if dropped > reported {
            tracing::warn!(
                client = %id,
                dropped = dropped - reported,
                "Client fell behind, dropped oldest lines"
            );
            reported = dropped;
        }
    }
    let _ = write.shutdown().await;
}

/// Sole writer of the upstream socket. One write per line.
async fn upstream_writer(
    mut write: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Line>,
) -> Result<(), RelayError> {
    while let Some(line) = rx.recv().await {
        write
            .write_all(&line.to_wire())
            .await
            .map_err(RelayError::UpstreamWrite)?;
        write.flush().await.map_err(RelayError::UpstreamWrite)?;
    }
    Ok(())
}
