use std::collections::{HashMap, HashSet};
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use futures::{Future, Sink, Stream};
use futures::stream::SplitSink;
use tokio_core::net::{TcpListener, TcpStream};
use tokio_core::reactor::{Handle, Interval};
use tokio_io::AsyncRead;
use tokio_io::codec::Framed;

use common::id::{ClientId, TaskKey, WorkerId};
use common::protocol::{Blob, Request, Response};
use common::wire::{MessageCodec, SendQueue};
use common::wrapped::WrappedRcRefCell;
use server::feed;
use server::graph::{sorted, Graph, Outcome};

pub type ServerTransport = Framed<TcpStream, MessageCodec<Request, Response>>;
pub type ServerSink = SplitSink<ServerTransport>;

/// The registered stream of one worker.
pub struct WorkerConn {
    pub sink: SendQueue<ServerSink>,
    pub last_heartbeat: Instant,
}

/// The scheduler: the state indexes plus the connection bookkeeping
/// around them. Owned by the reactor thread.
pub struct State {
    pub(crate) graph: Graph,

    listen_address: SocketAddr,
    handle: Handle,

    pub(crate) clients: HashMap<ClientId, SendQueue<ServerSink>>,
    workers: HashMap<WorkerId, WorkerConn>,

    /// Deletions gathered since the last tick, flushed in bulk.
    deleted_keys: HashMap<WorkerId, HashSet<TaskKey>>,
    delete_interval: Duration,
    heartbeat_window: Duration,

    stop_server: bool,
    self_ref: Option<StateRef>,
}

impl State {
    /// Apply the side effects of a committed state change.
    pub fn dispatch_outcome(&mut self, out: Outcome) {
        for (client, report) in out.reports {
            if let Some(sink) = self.clients.get(&client) {
                sink.push(&self.handle, report);
            }
        }
        for (worker, message) in out.worker_msgs {
            match self.workers.get(&worker) {
                Some(conn) => conn.sink.push(&self.handle, message),
                None => debug!("Dropping message for unknown worker {}", worker),
            }
        }
        for (worker, key) in out.deletions {
            self.deleted_keys
                .entry(worker)
                .or_insert_with(HashSet::new)
                .insert(key);
        }
        self.check_consistency();
    }

    fn check_consistency(&mut self) {
        if !::DEBUG_CHECK_CONSISTENCY.load(Ordering::Relaxed) {
            return;
        }
        if let Err(e) = self.graph.validate(false) {
            error!("Inconsistent state: {}; attempting a heal", e);
            self.graph.run_heal();
            if let Err(e) = self.graph.validate(false) {
                error!("State still inconsistent after heal: {}", e);
            }
        }
    }

    /// Flush batched deletions and sweep workers that missed their
    /// heartbeat window.
    pub fn on_tick(&mut self) {
        let deleted = mem::replace(&mut self.deleted_keys, HashMap::new());
        for (worker, keys) in deleted {
            if keys.is_empty() {
                continue;
            }
            if let Some(conn) = self.workers.get(&worker) {
                debug!("Deleting {} keys on {}", keys.len(), worker);
                conn.sink.push(
                    &self.handle,
                    Response::DeleteData {
                        keys: sorted(keys),
                        report: false,
                    },
                );
            }
        }

        let now = Instant::now();
        let stale: Vec<WorkerId> = self.workers
            .iter()
            .filter(|&(_, conn)| now.duration_since(conn.last_heartbeat) > self.heartbeat_window)
            .map(|(address, _)| *address)
            .collect();
        for address in stale {
            warn!("Worker {} missed its heartbeat window", address);
            self.remove_worker(&address);
        }

        let gone: Vec<ClientId> = self.clients
            .iter()
            .filter(|&(_, sink)| sink.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        for client in gone {
            self.remove_client(&client);
        }
    }

    /// Remove a worker after a disconnect, a missed heartbeat or an
    /// explicit request, and replan everything it was doing.
    pub fn remove_worker(&mut self, address: &WorkerId) {
        let known = self.workers.remove(address).is_some();
        if !known && !self.graph.ncores.contains_key(address) {
            return;
        }
        self.deleted_keys.remove(address);
        let out = self.graph.remove_worker(address);
        self.dispatch_outcome(out);
    }

    /// Reader-loop cleanup: only deregister when the closed stream is
    /// still the one registered, so a relaunched worker that raced the
    /// old stream's shutdown survives.
    fn remove_worker_conn(&mut self, address: &WorkerId, sink: &SendQueue<ServerSink>) {
        let current = self.workers
            .get(address)
            .map_or(false, |conn| conn.sink.same(sink));
        if current {
            self.remove_worker(address);
        } else {
            debug!("Stale stream of worker {} closed", address);
        }
    }

    /// Same guard for client streams.
    pub(crate) fn remove_client_conn(
        &mut self,
        client: &ClientId,
        sink: &SendQueue<ServerSink>,
    ) {
        let current = self.clients
            .get(client)
            .map_or(false, |registered| registered.same(sink));
        if current {
            self.remove_client(client);
        } else {
            debug!("Stale stream of client '{}' closed", client);
        }
    }

    /// Drop a client stream. Its remaining interest is released, which
    /// may garbage collect the keys it held.
    pub fn remove_client(&mut self, client: &ClientId) {
        if self.clients.remove(client).is_none() {
            return;
        }
        info!("Client '{}' disconnected", client);
        let held: Vec<TaskKey> = self.graph
            .wants_what
            .get(client)
            .map(|keys| sorted(keys.iter().cloned()))
            .unwrap_or_default();
        if !held.is_empty() {
            let out = self.graph.release_keys(client, &held);
            self.dispatch_outcome(out);
        }
        self.graph.wants_what.remove(client);
    }

    /// Whole-cluster wipe: cancel every task, tell the workers to
    /// relaunch, keep client registrations.
    pub fn restart_cluster(&mut self) {
        let out = self.graph.restart();
        self.deleted_keys.clear();
        self.dispatch_outcome(out);
        let handle = self.handle.clone();
        for sink in self.clients.values() {
            sink.push(&handle, Response::Restart {});
        }
    }

    /// Forget any deletion batched for a key that exists again.
    pub fn cancel_pending_delete(&mut self, key: &TaskKey) {
        for pending in self.deleted_keys.values_mut() {
            pending.remove(key);
        }
    }

    /// Missing data reported by a worker. Besides restoring the lost
    /// keys, a full heal culls any task that was dispatched on top of
    /// them.
    fn worker_missing_data(&mut self, keys: &[TaskKey]) -> Outcome {
        let mut out = self.graph.heal_missing_data(keys);
        out.merge(self.graph.run_heal());
        match self.graph.queue_ready() {
            Ok(more) => out.merge(more),
            Err(e) => error!("Re-queue after missing data failed: {}", e),
        }
        out
    }

    /// Data removal acknowledged by a worker; keys that lost their last
    /// replica but are still needed go through the missing-data heal.
    fn remove_keys(&mut self, worker: &WorkerId, keys: Vec<TaskKey>) -> Outcome {
        let mut lost = Vec::new();
        for key in keys {
            if let Some(held) = self.graph.has_what.get_mut(worker) {
                held.remove(&key);
            }
            let emptied = match self.graph.who_has.get_mut(&key) {
                Some(replicas) => {
                    replicas.remove(worker);
                    replicas.is_empty()
                }
                None => false,
            };
            if emptied {
                self.graph.who_has.remove(&key);
                let needed = self.graph.wanted(&key)
                    || self.graph
                        .waiting_data
                        .get(&key)
                        .map_or(false, |consumers| !consumers.is_empty());
                if needed {
                    lost.push(key);
                } else {
                    self.graph.in_play.remove(&key);
                    self.graph.finished_results.remove(&key);
                    self.graph.released.insert(key);
                }
            }
        }
        if lost.is_empty() {
            Outcome::default()
        } else {
            self.graph.heal_missing_data(&lost)
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

pub type StateRef = WrappedRcRefCell<State>;

impl StateRef {
    pub fn new(
        handle: Handle,
        listen_address: SocketAddr,
        delete_interval: Duration,
        heartbeat_window: Duration,
    ) -> Self {
        let sref = Self::wrap(State {
            graph: Graph::new(),
            listen_address: listen_address,
            handle: handle,
            clients: HashMap::new(),
            workers: HashMap::new(),
            deleted_keys: HashMap::new(),
            delete_interval: delete_interval,
            heartbeat_window: heartbeat_window,
            stop_server: false,
            self_ref: None,
        });
        sref.get_mut().self_ref = Some(sref.clone());
        sref
    }

    pub fn start(&self) {
        let listen_address = self.get().listen_address;
        let handle = self.get().handle.clone();
        let listener = TcpListener::bind(&listen_address, &handle).unwrap();
        info!("Scheduler listening on {}", listen_address);

        let state = self.clone();
        handle.spawn(
            listener
                .incoming()
                .for_each(move |(stream, address)| {
                    state.on_connection(stream, address);
                    Ok(())
                })
                .map_err(|e| panic!("Listening failed: {:?}", e)),
        );

        let interval = Interval::new(self.get().delete_interval, &handle).unwrap();
        let state = self.clone();
        handle.spawn(
            interval
                .for_each(move |_| {
                    state.get_mut().on_tick();
                    Ok(())
                })
                .map_err(|e| panic!("Tick timer failed: {:?}", e)),
        );
    }

    /// Main loop entry; returns false when the server should stop.
    pub fn turn(&self) -> bool {
        !self.get().stop_server
    }

    fn on_connection(&self, stream: TcpStream, address: SocketAddr) {
        debug!("New connection from {}", address);
        let _ = stream.set_nodelay(true);
        let transport = stream.framed(MessageCodec::new());
        self.handshake(transport, address);
    }

    /// Read one message to find out what this connection is.
    fn handshake(&self, transport: ServerTransport, address: SocketAddr) {
        let state = self.clone();
        let handle = self.get().handle.clone();
        handle.spawn(transport.into_future().then(move |result| {
            match result {
                Ok((Some(message), transport)) => {
                    state.on_first_message(message, transport, address)
                }
                Ok((None, _)) => debug!("Connection {} closed before registering", address),
                Err((e, _)) => debug!("Connection {} failed before registering: {}", address, e),
            }
            Ok(())
        }));
    }

    fn on_first_message(&self, message: Request, transport: ServerTransport, address: SocketAddr) {
        match message {
            Request::Identity {} => {
                let response = Response::IdentityResponse {
                    kind: "scheduler".to_string(),
                    id: format!("sleet-{}", ::VERSION),
                };
                let state = self.clone();
                let handle = self.get().handle.clone();
                handle.spawn(transport.send(response).then(move |result| {
                    match result {
                        Ok(transport) => state.handshake(transport, address),
                        Err(e) => debug!("Identity reply to {} failed: {}", address, e),
                    }
                    Ok(())
                }));
            }
            Request::RegisterClient { client, version } => {
                if version != ::PROTOCOL_VERSION {
                    error!("Client protocol mismatch from {}", address);
                    return;
                }
                self.register_client(client, transport, address)
            }
            Request::RegisterWorker {
                address: advertised,
                ncores,
                keys,
                version,
            } => {
                if version != ::PROTOCOL_VERSION {
                    error!("Worker protocol mismatch from {}", address);
                    return;
                }
                self.register_worker(advertised, ncores, keys, transport, address)
            }
            Request::Feed {
                function,
                setup,
                teardown,
                interval_ms,
            } => self.register_feed(function, setup, teardown, interval_ms, transport, address),
            other => warn!(
                "Connection {} sent {:?} before registering, closing",
                address, other
            ),
        }
    }

    fn register_worker(
        &self,
        advertised: WorkerId,
        ncores: u32,
        keys: Vec<TaskKey>,
        transport: ServerTransport,
        peer: SocketAddr,
    ) {
        // a worker announcing a wildcard address is identified by the
        // address its connection came from
        let worker_id = if advertised.ip().is_unspecified() {
            SocketAddr::new(peer.ip(), advertised.port())
        } else {
            advertised
        };
        let (sink, stream) = transport.split();
        let queue = SendQueue::new(sink);
        let handle = self.get().handle.clone();
        {
            let mut state = self.get_mut();
            let outcome = match state.graph.add_worker(worker_id, ncores, keys) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Worker registration from {} refused: {}", peer, e);
                    return;
                }
            };
            state.workers.insert(
                worker_id,
                WorkerConn {
                    sink: queue.clone(),
                    last_heartbeat: Instant::now(),
                },
            );
            state.dispatch_outcome(outcome);
        }

        let state = self.clone();
        let cleanup = self.clone();
        handle.spawn(
            stream
                .for_each(move |message| {
                    state.on_worker_message(&worker_id, message);
                    Ok(())
                })
                .then(move |result| {
                    if let Err(e) = result {
                        debug!("Worker {} stream failed: {}", worker_id, e);
                    }
                    cleanup.get_mut().remove_worker_conn(&worker_id, &queue);
                    Ok(())
                }),
        );
    }

    fn on_worker_message(&self, worker: &WorkerId, message: Request) {
        let mut state = self.get_mut();
        if let Some(conn) = state.workers.get_mut(worker) {
            conn.last_heartbeat = Instant::now();
        }
        let out = match message {
            Request::TaskFinished { key, nbytes } => {
                // a recomputed key must not fall to a stale batched delete
                state.cancel_pending_delete(&key);
                state.graph.mark_task_finished(worker, &key, nbytes)
            }
            Request::TaskErred {
                key,
                exception,
                traceback,
            } => state.graph.mark_task_erred(worker, &key, exception, traceback),
            Request::MissingData { keys } => state.worker_missing_data(&keys),
            Request::AddKeys { keys } => {
                let mut who_has = HashMap::new();
                for key in keys {
                    let mut replicas = HashSet::new();
                    replicas.insert(*worker);
                    who_has.insert(key, replicas);
                }
                state.graph.update_data(who_has, HashMap::new(), None)
            }
            Request::RemoveKeys { keys } => state.remove_keys(worker, keys),
            Request::Heartbeat {} => Outcome::default(),
            other => {
                warn!("Ignoring {:?} from worker {}", other, worker);
                Outcome::default()
            }
        };
        state.dispatch_outcome(out);
    }

    fn register_feed(
        &self,
        function: Blob,
        setup: Option<Blob>,
        teardown: Option<Blob>,
        interval_ms: u64,
        transport: ServerTransport,
        address: SocketAddr,
    ) {
        let (sink, stream) = transport.split();
        let queue = SendQueue::new(sink);
        self.spawn_feed(queue, function, setup, teardown, interval_ms);
        let handle = self.get().handle.clone();
        handle.spawn(stream.for_each(|_| Ok(())).then(move |_| {
            debug!("Feed connection {} closed", address);
            Ok(())
        }));
    }

    /// Periodically push a named state view over an observer stream
    /// until the stream goes away.
    pub(crate) fn spawn_feed(
        &self,
        queue: SendQueue<ServerSink>,
        function: Blob,
        setup: Option<Blob>,
        teardown: Option<Blob>,
        interval_ms: u64,
    ) {
        let name = String::from_utf8_lossy(&function).into_owned();
        if !feed::KNOWN_VIEWS.contains(&name.as_str()) {
            warn!("Unknown feed view '{}' requested", name);
            return;
        }
        if let Some(setup) = setup {
            debug!("Feed '{}' setup: {}", name, String::from_utf8_lossy(&setup));
        }
        let teardown = teardown.map(|t| String::from_utf8_lossy(&t).into_owned());
        let period = Duration::from_millis(::std::cmp::max(interval_ms, 1));
        let handle = self.get().handle.clone();
        let interval = match Interval::new(period, &handle) {
            Ok(interval) => interval,
            Err(e) => {
                error!("Cannot start feed timer: {}", e);
                return;
            }
        };
        info!("Feed '{}' subscribed every {} ms", name, interval_ms);
        let state = self.clone();
        let tick_handle = handle.clone();
        handle.spawn(
            interval
                .map_err(|_| ())
                .for_each(move |_| {
                    if queue.is_closed() {
                        return Err(());
                    }
                    match feed::render(&state.get().graph, &name) {
                        Some(payload) => {
                            queue.push(
                                &tick_handle,
                                Response::FeedUpdate {
                                    name: name.clone(),
                                    payload: payload,
                                },
                            );
                            Ok(())
                        }
                        None => Err(()),
                    }
                })
                .then(move |_| {
                    if let Some(teardown) = teardown {
                        debug!("Feed teardown: {}", teardown);
                    }
                    Ok(())
                }),
        );
    }
}
