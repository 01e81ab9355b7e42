use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{future, Future, Sink, Stream};
use futures::stream::SplitSink;
use serde_json::{self, Map, Value};
use tokio_core::net::{TcpListener, TcpStream};
use tokio_core::reactor::{Handle, Interval, Timeout};
use tokio_io::AsyncRead;
use tokio_io::codec::Framed;

use common::id::{TaskKey, WorkerId};
use common::protocol::{ArgList, Blob, DataRequest, DataResponse, Request, Response};
use common::wire::{MessageCodec, SendQueue};
use common::wrapped::WrappedRcRefCell;
use errors::{ErrorKind, Result};
use worker::executor::Registry;

pub type UpstreamTransport = Framed<TcpStream, MessageCodec<Response, Request>>;
pub type UpstreamSink = SplitSink<UpstreamTransport>;
type DataTransport = Framed<TcpStream, MessageCodec<DataRequest, DataResponse>>;

pub const HEARTBEAT_INTERVAL_MS: u64 = 1_000;
const RECONNECT_DELAY_MS: u64 = 500;

/// The worker stub: an in-memory store, a registry of named task
/// implementations, a data port serving peers, and the upstream stream
/// to the scheduler.
pub struct State {
    handle: Handle,
    server_address: SocketAddr,
    /// The advertised data port; resolved after binding.
    listen_address: SocketAddr,
    ncores: u32,
    data: HashMap<TaskKey, Blob>,
    registry: Registry,
    upstream: Option<SendQueue<UpstreamSink>>,
    self_ref: Option<StateRef>,
}

fn text_payload(message: &str) -> Blob {
    Blob::from(serde_json::to_vec(&message).unwrap_or_else(|_| b"null".to_vec()))
}

/// Replace strings naming an input key with that input's value.
fn substitute(value: &mut Value, inputs: &HashMap<TaskKey, Value>) {
    let replacement = match *value {
        Value::String(ref name) => inputs.get(name.as_str()).cloned(),
        Value::Array(ref mut items) => {
            for item in items.iter_mut() {
                substitute(item, inputs);
            }
            None
        }
        Value::Object(ref mut entries) => {
            for (_, entry) in entries.iter_mut() {
                substitute(entry, inputs);
            }
            None
        }
        _ => None,
    };
    if let Some(replacement) = replacement {
        *value = replacement;
    }
}

impl State {
    /// Push a message upstream, if the scheduler is connected.
    pub fn send(&self, message: Request) {
        match self.upstream {
            Some(ref queue) => queue.push(&self.handle, message),
            None => debug!("Upstream not connected, dropping {:?}", message),
        }
    }

    /// Serve a gather request from the local store.
    pub fn gather(&self, keys: &[TaskKey]) -> DataResponse {
        let mut data = HashMap::new();
        let mut missing = Vec::new();
        for key in keys {
            match self.data.get(key) {
                Some(payload) => {
                    data.insert(key.clone(), payload.clone());
                }
                None => missing.push(key.clone()),
            }
        }
        DataResponse::GatherData {
            data: data,
            missing: missing,
        }
    }

    /// Decode the arguments, resolve key references against the local
    /// store and run the named task.
    fn evaluate(
        &self,
        name: &str,
        args: ArgList,
        kwargs: Option<Blob>,
        who_has: &HashMap<TaskKey, Vec<WorkerId>>,
    ) -> Result<Value> {
        let mut inputs = HashMap::new();
        for dep in who_has.keys() {
            match self.data.get(dep) {
                Some(payload) => {
                    inputs.insert(dep.clone(), serde_json::from_slice(payload)?);
                }
                None => bail!(ErrorKind::Protocol(format!(
                    "input '{}' is not in the local store",
                    dep
                ))),
            }
        }
        let mut values: Vec<Value> = match args {
            ArgList::Each(parts) => {
                let mut values = Vec::with_capacity(parts.len());
                for part in &parts {
                    values.push(serde_json::from_slice(part)?);
                }
                values
            }
            ArgList::Packed(packed) => match serde_json::from_slice(&packed)? {
                Value::Array(items) => items,
                other => vec![other],
            },
        };
        for value in values.iter_mut() {
            substitute(value, &inputs);
        }
        let mut keywords: Map<String, Value> = match kwargs {
            Some(payload) => match serde_json::from_slice(&payload)? {
                Value::Object(entries) => entries,
                other => bail!(ErrorKind::Protocol(format!(
                    "keyword payload is not a mapping: {}",
                    other
                ))),
            },
            None => Map::new(),
        };
        for (_, entry) in keywords.iter_mut() {
            substitute(entry, &inputs);
        }
        self.registry.call(name, &values, &keywords)
    }
}

pub type StateRef = WrappedRcRefCell<State>;

impl StateRef {
    pub fn new(
        handle: Handle,
        server_address: SocketAddr,
        listen_address: SocketAddr,
        ncores: u32,
        registry: Registry,
    ) -> Self {
        let sref = Self::wrap(State {
            handle: handle,
            server_address: server_address,
            listen_address: listen_address,
            ncores: ncores,
            data: HashMap::new(),
            registry: registry,
            upstream: None,
            self_ref: None,
        });
        sref.get_mut().self_ref = Some(sref.clone());
        sref
    }

    /// Bind the data port, then connect and register upstream.
    pub fn start(&self) {
        let bound = self.start_data_port();
        self.get_mut().listen_address = bound;
        self.connect_to_server();
    }

    pub fn listen_address(&self) -> SocketAddr {
        self.get().listen_address
    }

    fn start_data_port(&self) -> SocketAddr {
        let handle = self.get().handle.clone();
        let listener = TcpListener::bind(&self.get().listen_address, &handle).unwrap();
        let bound = listener.local_addr().unwrap();
        info!("Worker data port on {}", bound);
        let state = self.clone();
        handle.spawn(
            listener
                .incoming()
                .for_each(move |(stream, _)| {
                    let transport = stream.framed(MessageCodec::new());
                    state.serve_data_conn(transport);
                    Ok(())
                })
                .map_err(|e| panic!("Data port failed: {:?}", e)),
        );
        bound
    }

    fn serve_data_conn(&self, transport: DataTransport) {
        let state = self.clone();
        let handle = self.get().handle.clone();
        let served = transport
            .into_future()
            .map_err(|(e, _)| e)
            .and_then(move |(message, transport)| -> Box<Future<Item = (), Error = io::Error>> {
                match message {
                    Some(DataRequest::Gather { keys }) => {
                        let response = state.get().gather(&keys);
                        let again = state.clone();
                        Box::new(transport.send(response).map(move |transport| {
                            again.serve_data_conn(transport);
                        }))
                    }
                    None => Box::new(future::ok(())),
                }
            })
            .map_err(|e| debug!("Data connection failed: {}", e));
        handle.spawn(served);
    }

    fn connect_to_server(&self) {
        let server = self.get().server_address;
        let handle = self.get().handle.clone();
        info!("Connecting to scheduler at {}", server);
        let state = self.clone();
        let retry = self.clone();
        handle.spawn(
            TcpStream::connect(&server, &handle).then(move |result| {
                match result {
                    Ok(stream) => state.on_connected(stream),
                    Err(e) => {
                        warn!("Connection to scheduler failed: {}", e);
                        retry.reconnect_later();
                    }
                }
                Ok(())
            }),
        );
    }

    fn on_connected(&self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let handle = self.get().handle.clone();
        let transport = stream.framed(MessageCodec::new());
        let register = {
            let state = self.get();
            let mut keys: Vec<TaskKey> = state.data.keys().cloned().collect();
            keys.sort();
            Request::RegisterWorker {
                address: state.listen_address,
                ncores: state.ncores,
                keys: keys,
                version: ::PROTOCOL_VERSION,
            }
        };
        let state = self.clone();
        let retry = self.clone();
        handle.spawn(transport.send(register).then(move |result| {
            match result {
                Ok(transport) => state.on_registered(transport),
                Err(e) => {
                    warn!("Registration failed: {}", e);
                    retry.reconnect_later();
                }
            }
            Ok(())
        }));
    }

    fn on_registered(&self, transport: UpstreamTransport) {
        info!("Registered with the scheduler");
        let handle = self.get().handle.clone();
        let (sink, stream) = transport.split();
        let queue = SendQueue::new(sink);
        self.get_mut().upstream = Some(queue.clone());

        // periodic liveness proof
        match Interval::new(Duration::from_millis(HEARTBEAT_INTERVAL_MS), &handle) {
            Ok(interval) => {
                let beat_handle = handle.clone();
                handle.spawn(interval.map_err(|_| ()).for_each(move |_| {
                    if queue.is_closed() {
                        return Err(());
                    }
                    queue.push(&beat_handle, Request::Heartbeat {});
                    Ok(())
                }));
            }
            Err(e) => warn!("Cannot start the heartbeat timer: {}", e),
        }

        let state = self.clone();
        let done = self.clone();
        handle.spawn(
            stream
                .for_each(move |message| state.handle_upstream_message(message))
                .then(move |result| {
                    match result {
                        Ok(()) => info!("Scheduler stream closed"),
                        Err(e) => info!("Scheduler stream ended: {}", e),
                    }
                    done.get_mut().upstream = None;
                    done.reconnect_later();
                    Ok(())
                }),
        );
    }

    fn reconnect_later(&self) {
        let handle = self.get().handle.clone();
        let state = self.clone();
        match Timeout::new(Duration::from_millis(RECONNECT_DELAY_MS), &handle) {
            Ok(timeout) => handle.spawn(timeout.then(move |_| {
                state.connect_to_server();
                Ok(())
            })),
            Err(e) => error!("Cannot arm the reconnect timer: {}", e),
        }
    }

    fn handle_upstream_message(&self, message: Response) -> io::Result<()> {
        match message {
            Response::ComputeTask {
                key,
                function,
                args,
                kwargs,
                who_has,
            } => {
                self.compute(key, function, args, kwargs, who_has);
                Ok(())
            }
            Response::DeleteData { keys, report } => {
                {
                    let mut state = self.get_mut();
                    for key in &keys {
                        state.data.remove(key);
                    }
                    debug!("Deleted {} keys", keys.len());
                    if report {
                        state.send(Request::RemoveKeys { keys: keys });
                    }
                }
                Ok(())
            }
            Response::Terminate {} => {
                // shutdown-and-relaunch: drop the store and register anew
                info!("Terminate received, relaunching with an empty store");
                self.get_mut().data.clear();
                Err(io::Error::new(io::ErrorKind::Other, "terminated"))
            }
            other => {
                debug!("Ignoring {:?} from the scheduler", other);
                Ok(())
            }
        }
    }

    /// Fetch missing inputs from their holders, then run the task and
    /// report the result.
    fn compute(
        &self,
        key: TaskKey,
        function: Blob,
        args: ArgList,
        kwargs: Option<Blob>,
        who_has: HashMap<TaskKey, Vec<WorkerId>>,
    ) {
        debug!("Computing task {}", key);
        let handle = self.get().handle.clone();
        let mut fetches = Vec::new();
        {
            let state = self.get();
            for (dep, addresses) in &who_has {
                if state.data.contains_key(dep) {
                    continue;
                }
                fetches.push(fetch_from_peers(&handle, dep.clone(), addresses.clone()));
            }
        }
        let state = self.clone();
        handle.spawn(future::join_all(fetches).then(move |result| {
            match result {
                Ok(fetched) => {
                    {
                        let mut inner = state.get_mut();
                        for (dep, payload) in fetched {
                            inner.data.insert(dep, payload);
                        }
                    }
                    state.run_task(key, function, args, kwargs, &who_has);
                }
                Err(missing) => {
                    warn!("Input {} of task {} is not available anywhere", missing, key);
                    state.get().send(Request::MissingData {
                        keys: vec![missing],
                    });
                }
            }
            Ok(())
        }));
    }

    fn run_task(
        &self,
        key: TaskKey,
        function: Blob,
        args: ArgList,
        kwargs: Option<Blob>,
        who_has: &HashMap<TaskKey, Vec<WorkerId>>,
    ) {
        let name = String::from_utf8_lossy(&function).into_owned();
        let result = self.get().evaluate(&name, args, kwargs, who_has);
        let mut state = self.get_mut();
        match result {
            Ok(value) => {
                let payload = Blob::from(
                    serde_json::to_vec(&value).unwrap_or_else(|_| b"null".to_vec()),
                );
                let nbytes = payload.len() as u64;
                debug!("Task {} finished, {} bytes", key, nbytes);
                state.data.insert(key.clone(), payload);
                state.send(Request::TaskFinished {
                    key: key,
                    nbytes: nbytes,
                });
            }
            Err(e) => {
                warn!("Task {} failed: {}", key, e);
                let exception = text_payload(&format!("{}", e));
                let traceback = text_payload(&format!("in task '{}' calling '{}'", key, name));
                state.send(Request::TaskErred {
                    key: key,
                    exception: exception,
                    traceback: traceback,
                });
            }
        }
    }
}

/// Try every holder of a key in turn; resolves to the payload or to the
/// key itself when no holder could serve it.
fn fetch_from_peers(
    handle: &Handle,
    key: TaskKey,
    addresses: Vec<WorkerId>,
) -> Box<Future<Item = (TaskKey, Blob), Error = TaskKey>> {
    let handle = handle.clone();
    Box::new(future::loop_fn((key, 0usize), move |(key, index)| -> Box<
        Future<Item = future::Loop<(TaskKey, Blob), (TaskKey, usize)>, Error = TaskKey>,
    > {
        if index >= addresses.len() {
            return Box::new(future::err(key));
        }
        let address = addresses[index];
        Box::new(fetch_once(&handle, key.clone(), address).then(move |result| {
            match result {
                Ok(payload) => Ok(future::Loop::Break((key, payload))),
                Err(e) => {
                    debug!("Fetch of {} from {} failed: {}", key, address, e);
                    Ok(future::Loop::Continue((key, index + 1)))
                }
            }
        }))
    }))
}

/// One gather exchange with one peer.
fn fetch_once(
    handle: &Handle,
    key: TaskKey,
    address: WorkerId,
) -> Box<Future<Item = Blob, Error = io::Error>> {
    let request_key = key.clone();
    Box::new(
        TcpStream::connect(&address, handle).and_then(move |stream| {
            let transport = stream.framed(MessageCodec::<DataResponse, DataRequest>::new());
            transport
                .send(DataRequest::Gather {
                    keys: vec![request_key.clone()],
                })
                .and_then(|transport| transport.into_future().map_err(|(e, _)| e))
                .and_then(move |(message, _)| match message {
                    Some(DataResponse::GatherData { mut data, .. }) => {
                        match data.remove(&request_key) {
                            Some(payload) => Ok(payload),
                            None => Err(io::Error::new(
                                io::ErrorKind::NotFound,
                                "peer does not hold the key",
                            )),
                        }
                    }
                    None => Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during gather",
                    )),
                })
        }),
    )
}
