//! The pool actor: a single task owning every `Group`, driven by one `mpsc` channel so no
//! internal locking is needed (§4.5, §5 "Scheduling model" — "the pool's state is mutated only
//! on the origin context"). Grounded in Chromium's `ClientSocketPoolBase::RequestSocket`/
//! `CancelRequest`/`ReleaseSocket`/`CleanupIdleSockets` algorithm and the teacher's own
//! actor-plus-channel idiom (`cmap::manager::PoolManager` wrapping an `mpsc::UnboundedSender`).

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use derive_where::derive_where;
use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::address::{ConnectSpec, Destination, Scheme};
use crate::error::{Error, Result};
use crate::event;
use crate::resolver::Resolver;
use crate::stream::{ByteStream, PlaintextStream};
use crate::tls::TlsStream;

use super::conn::PooledStream;
use super::options::ConnectionPoolOptions;
use super::{LoadState, TlsConnector};

/// Messages the actor consumes. Never exposed outside `cmap`: callers only ever see
/// [`ConnectionPool`] and [`RequestSocketFuture`].
pub(super) enum PoolMessage {
    Request {
        handle_id: u64,
        group: String,
        destination: Destination,
        scheme: Scheme,
        priority: i32,
        respond: oneshot::Sender<Result<PooledStream>>,
    },
    Cancel {
        handle_id: u64,
        group: String,
    },
    Release {
        group: String,
        stream: Box<dyn ByteStream>,
    },
    ConnectorProgress {
        handle_id: u64,
        group: String,
        state: LoadState,
    },
    ConnectorDone {
        handle_id: u64,
        group: String,
        result: Result<Box<dyn ByteStream>>,
    },
    LoadState {
        handle_id: u64,
        group: String,
        respond: oneshot::Sender<LoadState>,
    },
}

struct IdleEntry {
    stream: Box<dyn ByteStream>,
    since: Instant,
}

struct PendingRequest {
    handle_id: u64,
    destination: Destination,
    scheme: Scheme,
    priority: i32,
    respond: oneshot::Sender<Result<PooledStream>>,
}

struct ConnectorEntry {
    join: JoinHandle<()>,
    state: LoadState,
    respond: oneshot::Sender<Result<PooledStream>>,
}

/// Per-destination pool state (§3 "Group"). A group is discarded once active, idle, and pending
/// are all empty (`is_empty`).
#[derive(Default)]
struct Group {
    idle: VecDeque<IdleEntry>,
    pending: Vec<PendingRequest>,
    connecting: HashMap<u64, ConnectorEntry>,
    active: u32,
    handed_out: u32,
}

impl Group {
    fn is_empty(&self) -> bool {
        self.idle.is_empty() && self.pending.is_empty() && self.connecting.is_empty() && self.active == 0
    }

    /// `active == handed_out + connecting.size()` (§4.5 "Consistency checks"), checked only in
    /// debug builds, matching the original's own assertion-based invariant checking.
    fn assert_invariants(&self) {
        debug_assert_eq!(
            self.active as usize,
            self.handed_out as usize + self.connecting.len(),
            "active must equal handed_out + in-flight connectors"
        );
    }

    /// Inserts `req` keeping the queue sorted by descending priority, with equal-priority ties
    /// broken FIFO (§4.5 "RequestSocket" step 2; not a `BinaryHeap`, which cannot express FIFO
    /// tie-breaking without an explicit sequence counter).
    fn insert_pending(&mut self, req: PendingRequest) {
        let pos = self
            .pending
            .iter()
            .position(|p| p.priority < req.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, req);
    }
}

struct Actor {
    groups: HashMap<String, Group>,
    options: ConnectionPoolOptions,
    resolver: Arc<dyn Resolver>,
    tls: Option<Arc<TlsConnector>>,
    tx: mpsc::UnboundedSender<PoolMessage>,
    reap_timer: Option<tokio::time::Interval>,
}

impl Actor {
    async fn handle(&mut self, msg: PoolMessage) {
        match msg {
            PoolMessage::Request {
                handle_id,
                group,
                destination,
                scheme,
                priority,
                respond,
            } => self.handle_request(handle_id, group, destination, scheme, priority, respond).await,
            PoolMessage::Cancel { handle_id, group } => self.handle_cancel(handle_id, &group),
            PoolMessage::Release { group, stream } => self.handle_release(group, stream).await,
            PoolMessage::ConnectorProgress { handle_id, group, state } => {
                if let Some(entry) = self
                    .groups
                    .get_mut(&group)
                    .and_then(|g| g.connecting.get_mut(&handle_id))
                {
                    entry.state = state;
                }
            }
            PoolMessage::ConnectorDone { handle_id, group, result } => {
                self.handle_connector_done(handle_id, group, result).await
            }
            PoolMessage::LoadState { handle_id, group, respond } => {
                let _ = respond.send(self.load_state(handle_id, &group));
            }
        }
    }

    async fn handle_request(
        &mut self,
        handle_id: u64,
        group_name: String,
        destination: Destination,
        scheme: Scheme,
        priority: i32,
        respond: oneshot::Sender<Result<PooledStream>>,
    ) {
        let cap = self.options.per_group_cap;
        let is_new = !self.groups.contains_key(&group_name);
        let group = self.groups.entry(group_name.clone()).or_default();
        if is_new {
            event::group_created(&group_name);
        }

        if group.active >= cap {
            group.insert_pending(PendingRequest {
                handle_id,
                destination,
                scheme,
                priority,
                respond,
            });
            return;
        }

        group.active += 1;
        self.fulfill(&group_name, handle_id, destination, scheme, respond).await;
    }

    /// Satisfies one request for a group that has already reserved an `active` slot: reuse the
    /// newest healthy idle stream if one exists, otherwise spawn a connector (§4.5 "RequestSocket"
    /// steps 4-5).
    async fn fulfill(
        &mut self,
        group_name: &str,
        handle_id: u64,
        destination: Destination,
        scheme: Scheme,
        respond: oneshot::Sender<Result<PooledStream>>,
    ) {
        while let Some(entry) = self.groups.get_mut(group_name).and_then(|g| g.idle.pop_back()) {
            if entry.stream.is_connected_and_idle().await {
                let group = self.groups.get_mut(group_name).expect("group present");
                group.handed_out += 1;
                group.assert_invariants();
                event::connection_checked_out(group_name, handle_id, true);
                let pooled = PooledStream::new(entry.stream, group_name.to_string(), true, self.tx.clone());
                let _ = respond.send(Ok(pooled));
                return;
            }
            event::connection_closed(group_name, "stale idle entry discarded on reuse attempt");
        }

        let join = spawn_connector(
            self.tx.clone(),
            handle_id,
            group_name.to_string(),
            destination,
            scheme,
            self.resolver.clone(),
            self.tls.clone(),
        );
        let group = self.groups.get_mut(group_name).expect("group present");
        group.connecting.insert(
            handle_id,
            ConnectorEntry {
                join,
                state: LoadState::ResolvingHost,
                respond,
            },
        );
        group.assert_invariants();
    }

    async fn handle_connector_done(&mut self, handle_id: u64, group_name: String, result: Result<Box<dyn ByteStream>>) {
        let Some(entry) = self
            .groups
            .get_mut(&group_name)
            .and_then(|g| g.connecting.remove(&handle_id))
        else {
            return;
        };

        match result {
            Ok(stream) => {
                let group = self.groups.get_mut(&group_name).expect("group present");
                group.handed_out += 1;
                group.assert_invariants();
                event::connection_created(&group_name, handle_id);
                event::connection_checked_out(&group_name, handle_id, false);
                let pooled = PooledStream::new(stream, group_name.clone(), false, self.tx.clone());
                let _ = entry.respond.send(Ok(pooled));
            }
            Err(err) => {
                let group = self.groups.get_mut(&group_name).expect("group present");
                group.active = group.active.saturating_sub(1);
                group.assert_invariants();
                let _ = entry.respond.send(Err(err));
                self.drain_pending(&group_name).await;
            }
        }
        self.cleanup_group_if_empty(&group_name);
    }

    /// If a request is waiting, promote it into the active slot a release/failure just freed
    /// (§4.5 "ReleaseSocket": "if the pending queue is non-empty, dequeue the highest-priority
    /// request and satisfy it").
    async fn drain_pending(&mut self, group_name: &str) {
        let Some(req) = self.groups.get_mut(group_name).and_then(|g| {
            if g.pending.is_empty() {
                None
            } else {
                Some(g.pending.remove(0))
            }
        }) else {
            return;
        };
        let group = self.groups.get_mut(group_name).expect("group present");
        group.active += 1;
        self.fulfill(group_name, req.handle_id, req.destination, req.scheme, req.respond).await;
    }

    async fn handle_release(&mut self, group_name: String, stream: Box<dyn ByteStream>) {
        let Some(group) = self.groups.get_mut(&group_name) else {
            return;
        };
        group.active = group.active.saturating_sub(1);
        group.handed_out = group.handed_out.saturating_sub(1);
        group.assert_invariants();
        event::connection_checked_in(&group_name);

        if stream.is_connected_and_idle().await {
            let group = self.groups.get_mut(&group_name).expect("group present");
            group.idle.push_back(IdleEntry {
                stream,
                since: Instant::now(),
            });
            self.arm_reap_timer();
        } else {
            event::connection_closed(&group_name, "unhealthy on release");
        }

        self.drain_pending(&group_name).await;
        self.cleanup_group_if_empty(&group_name);
    }

    fn handle_cancel(&mut self, handle_id: u64, group_name: &str) {
        let Some(group) = self.groups.get_mut(group_name) else {
            return;
        };
        if let Some(pos) = group.pending.iter().position(|p| p.handle_id == handle_id) {
            group.pending.remove(pos);
        } else if let Some(entry) = group.connecting.remove(&handle_id) {
            entry.join.abort();
            group.active = group.active.saturating_sub(1);
        }
        group.assert_invariants();
        self.cleanup_group_if_empty(group_name);
    }

    fn load_state(&self, handle_id: u64, group_name: &str) -> LoadState {
        let Some(group) = self.groups.get(group_name) else {
            return LoadState::Connected;
        };
        if let Some(entry) = group.connecting.get(&handle_id) {
            return entry.state;
        }
        if group.pending.iter().any(|p| p.handle_id == handle_id) {
            return LoadState::Idle;
        }
        LoadState::Connected
    }

    fn cleanup_group_if_empty(&mut self, group_name: &str) {
        if self.groups.get(group_name).is_some_and(Group::is_empty) {
            self.groups.remove(group_name);
            event::group_discarded(group_name);
        }
    }

    fn arm_reap_timer(&mut self) {
        if self.reap_timer.is_none() {
            let mut interval = tokio::time::interval(self.options.reap_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.reset();
            self.reap_timer = Some(interval);
        }
    }

    fn disarm_reap_timer_if_idle_empty(&mut self) {
        if self.groups.values().all(|g| g.idle.is_empty()) {
            self.reap_timer = None;
        }
    }

    /// Walks every group's idle set, discarding TTL-expired entries and probing the rest
    /// concurrently for health (§4.5 "Reap timer").
    async fn reap(&mut self) {
        let ttl = self.options.idle_ttl;
        let now = Instant::now();
        let group_names: Vec<String> = self.groups.keys().cloned().collect();

        for name in group_names {
            let Some(group) = self.groups.get_mut(&name) else {
                continue;
            };
            let entries: Vec<IdleEntry> = group.idle.drain(..).collect();
            let (fresh, stale): (Vec<_>, Vec<_>) =
                entries.into_iter().partition(|e| now.duration_since(e.since) <= ttl);
            for _ in &stale {
                event::connection_closed(&name, "idle ttl expired");
            }

            // Probe every surviving entry's health concurrently rather than one at a time (cf.
            // the teacher's own use of `futures_util::future::join_all` to await several
            // in-flight tasks together).
            let healths = join_all(fresh.iter().map(|e| e.stream.is_connected_and_idle())).await;
            let group = self.groups.get_mut(&name).expect("group present");
            for (entry, healthy) in fresh.into_iter().zip(healths) {
                if healthy {
                    group.idle.push_back(entry);
                } else {
                    event::connection_closed(&name, "peer closed or sent unexpected bytes while idle");
                }
            }
            self.cleanup_group_if_empty(&name);
        }
        self.disarm_reap_timer_if_idle_empty();
    }
}

fn spawn_connector(
    tx: mpsc::UnboundedSender<PoolMessage>,
    handle_id: u64,
    group: String,
    destination: Destination,
    scheme: Scheme,
    resolver: Arc<dyn Resolver>,
    tls: Option<Arc<TlsConnector>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = connect_stream(handle_id, &group, destination, scheme, resolver, tls, &tx).await;
        let _ = tx.send(PoolMessage::ConnectorDone { handle_id, group, result });
    })
}

/// Resolves, connects, and (for secure destinations) completes the TLS handshake — the
/// connector's job extends through producing a ready-to-use stream (§4.5 "In-flight connector").
async fn connect_stream(
    handle_id: u64,
    group: &str,
    destination: Destination,
    scheme: Scheme,
    resolver: Arc<dyn Resolver>,
    tls: Option<Arc<TlsConnector>>,
    tx: &mpsc::UnboundedSender<PoolMessage>,
) -> Result<Box<dyn ByteStream>> {
    let _ = tx.send(PoolMessage::ConnectorProgress {
        handle_id,
        group: group.to_string(),
        state: LoadState::Connecting,
    });

    match scheme {
        Scheme::Plain => {
            let mut stream = PlaintextStream::new(destination, resolver);
            stream.connect().await?;
            Ok(Box::new(stream))
        }
        Scheme::Tls => {
            let tls = tls.ok_or_else(|| {
                Error::internal("tls requested but this pool has no tls connector configured")
            })?;
            let plain = PlaintextStream::new(destination.clone(), resolver);
            let mut stream = TlsStream::new(
                plain,
                destination.host.clone(),
                tls.verifier.clone(),
                tls.config.clone(),
                tls.roots.clone(),
            )?;
            stream.handshake().await?;
            Ok(Box::new(stream))
        }
    }
}

async fn run_actor(
    mut rx: mpsc::UnboundedReceiver<PoolMessage>,
    tx: mpsc::UnboundedSender<PoolMessage>,
    options: ConnectionPoolOptions,
    resolver: Arc<dyn Resolver>,
    tls: Option<Arc<TlsConnector>>,
) {
    let mut actor = Actor {
        groups: HashMap::new(),
        options,
        resolver,
        tls,
        tx,
        reap_timer: None,
    };

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(msg) => actor.handle(msg).await,
                    None => break,
                }
            }
            _ = maybe_tick(&mut actor.reap_timer) => {
                actor.reap().await;
            }
        }
    }
}

async fn maybe_tick(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

struct CancelGuard {
    handle_id: u64,
    group: String,
    tx: mpsc::UnboundedSender<PoolMessage>,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.tx.send(PoolMessage::Cancel {
                handle_id: self.handle_id,
                group: std::mem::take(&mut self.group),
            });
        }
    }
}

/// The future returned by [`ConnectionPool::request_socket`]. A manual `Future` impl (not an
/// `async fn`) so that dropping it before it resolves sends `PoolMessage::Cancel` from the
/// embedded [`CancelGuard`]'s ordinary `Drop` impl — "handle destruction implies cancellation"
/// falls out of normal Rust drop semantics instead of needing extra bookkeeping (§4.5
/// "CancelRequest", §9 "Cycles between pool and handle").
pub struct RequestSocketFuture {
    rx: oneshot::Receiver<Result<PooledStream>>,
    guard: CancelGuard,
}

impl Future for RequestSocketFuture {
    type Output = Result<PooledStream>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                this.guard.armed = false;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                this.guard.armed = false;
                Poll::Ready(Err(Error::internal("connection pool actor is no longer running")))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl RequestSocketFuture {
    /// Reports this request's current state (§4.5 "Load-state observation"): queried through the
    /// handle itself, not by some separately obtained id, since a caller has no other way to name
    /// an outstanding request. Safe to call repeatedly while this future is still pending.
    pub async fn load_state(&self) -> LoadState {
        let (respond, rx) = oneshot::channel();
        let sent = self
            .guard
            .tx
            .send(PoolMessage::LoadState {
                handle_id: self.guard.handle_id,
                group: self.guard.group.clone(),
                respond,
            })
            .is_ok();
        if !sent {
            return LoadState::Connected;
        }
        rx.await.unwrap_or(LoadState::Connected)
    }
}

/// The pool itself: a cheap, `Clone`-able handle around the actor's channel. Creating one spawns
/// the actor task, which runs for the life of the process (§3 "Pool": "process-wide mapping");
/// there is no explicit shutdown operation, matching the original's own process-lifetime pool.
#[derive_where(Clone, Debug)]
pub struct ConnectionPool {
    #[derive_where(skip)]
    tx: mpsc::UnboundedSender<PoolMessage>,
    next_handle: Arc<AtomicU64>,
}

impl ConnectionPool {
    /// Creates a pool and spawns its actor task. `tls` is required only if callers ever request
    /// [`Scheme::Tls`](crate::Scheme::Tls) destinations from it.
    pub fn new(
        options: ConnectionPoolOptions,
        resolver: Arc<dyn Resolver>,
        tls: Option<TlsConnector>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_actor(rx, tx.clone(), options, resolver, tls.map(Arc::new)));
        Self {
            tx,
            next_handle: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Requests a stream for `spec` (§4.5 "RequestSocket"). Resolves synchronously from the
    /// group's idle set when possible; otherwise completes once a connector finishes.
    pub fn request_socket(&self, spec: ConnectSpec) -> RequestSocketFuture {
        let handle_id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let group = spec.group.clone();
        let (respond, rx) = oneshot::channel();
        let armed = self
            .tx
            .send(PoolMessage::Request {
                handle_id,
                group: spec.group,
                destination: spec.destination,
                scheme: spec.scheme,
                priority: spec.priority,
                respond,
            })
            .is_ok();

        RequestSocketFuture {
            rx,
            guard: CancelGuard {
                handle_id,
                group,
                tx: self.tx.clone(),
                armed,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::resolver::TokioResolver;

    async fn echo_listener() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((_socket, _)) => {}
                    Err(_) => break,
                }
            }
        });
        addr
    }

    fn plain_spec(group: &str, addr: std::net::SocketAddr, priority: i32) -> ConnectSpec {
        ConnectSpec::builder()
            .group(group)
            .destination(Destination::new(addr.ip().to_string(), addr.port()))
            .scheme(Scheme::Plain)
            .priority(priority)
            .build()
    }

    /// Scenario 1 of §8: a released connection is handed back out as reused rather than
    /// reconnected.
    #[tokio::test]
    async fn released_connection_is_reused() {
        let addr = echo_listener().await;
        let pool = ConnectionPool::new(ConnectionPoolOptions::default(), Arc::new(TokioResolver), None);

        let first = pool.request_socket(plain_spec("g", addr, 0)).await.unwrap();
        assert!(!first.is_reused());
        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = pool.request_socket(plain_spec("g", addr, 0)).await.unwrap();
        assert!(second.is_reused());
    }

    /// Scenario 2 of §8: once a slot frees up, the highest-priority pending request is drained
    /// first, not FIFO-by-arrival.
    #[tokio::test]
    async fn pending_requests_drain_highest_priority_first() {
        let addr = echo_listener().await;
        let pool = ConnectionPool::new(
            ConnectionPoolOptions::builder().per_group_cap(1).build(),
            Arc::new(TokioResolver),
            None,
        );

        let first = pool.request_socket(plain_spec("g", addr, 0)).await.unwrap();

        let order = Arc::new(tokio::sync::Mutex::new(Vec::<&'static str>::new()));
        // Handles are stashed here rather than dropped as soon as each task finishes, so that a
        // completed request doesn't immediately release its slot and drain the other one before
        // the assertion below runs.
        let handles: Arc<tokio::sync::Mutex<Vec<PooledStream>>> = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let order_low = order.clone();
        let handles_low = handles.clone();
        let pool_low = pool.clone();
        let low_spec = plain_spec("g", addr, 0);
        let low = tokio::spawn(async move {
            let handle = pool_low.request_socket(low_spec).await.unwrap();
            order_low.lock().await.push("low");
            handles_low.lock().await.push(handle);
        });

        let order_high = order.clone();
        let handles_high = handles.clone();
        let pool_high = pool.clone();
        let high_spec = plain_spec("g", addr, 10);
        let high = tokio::spawn(async move {
            let handle = pool_high.request_socket(high_spec).await.unwrap();
            order_high.lock().await.push("high");
            handles_high.lock().await.push(handle);
        });

        // Give both requests time to land in the pending queue before the slot frees up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*order.lock().await, vec!["high"]);

        high.await.unwrap();
        low.abort();
    }

    /// Scenario 4 of §8: dropping a still-pending request's future cancels it and frees the
    /// `active` slot it would otherwise have held forever.
    #[tokio::test]
    async fn dropping_pending_request_frees_its_slot() {
        let addr = echo_listener().await;
        let pool = ConnectionPool::new(
            ConnectionPoolOptions::builder().per_group_cap(1).build(),
            Arc::new(TokioResolver),
            None,
        );

        let first = pool.request_socket(plain_spec("g", addr, 0)).await.unwrap();
        let pending = pool.request_socket(plain_spec("g", addr, 0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(pending);
        drop(first);

        let third = tokio::time::timeout(Duration::from_secs(1), pool.request_socket(plain_spec("g", addr, 0)))
            .await
            .expect("request should not hang on a miscounted active slot")
            .unwrap();
        drop(third);
    }

    /// A request's `load_state` is queryable through its own future while still outstanding, and
    /// settles once fulfilled.
    #[tokio::test]
    async fn load_state_reports_connecting_then_settles() {
        let addr = echo_listener().await;
        let pool = ConnectionPool::new(ConnectionPoolOptions::default(), Arc::new(TokioResolver), None);

        let request = pool.request_socket(plain_spec("g", addr, 0));
        let state = request.load_state().await;
        assert!(matches!(state, LoadState::ResolvingHost | LoadState::Connecting | LoadState::Connected));

        let handle = request.await.unwrap();
        drop(handle);
    }
}
