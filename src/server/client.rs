use std::collections::HashMap;
use std::net::SocketAddr;

use futures::{Future, Stream};

use common::id::ClientId;
use common::protocol::{Request, Response, TaskSpec};
use common::wire::SendQueue;
use errors::{ErrorKind, Result};
use server::state::{ServerTransport, StateRef};

impl StateRef {
    /// Turn a fresh connection into a registered client stream: ack the
    /// registration, then feed every message through the dispatch table
    /// in arrival order.
    pub(crate) fn register_client(
        &self,
        client: ClientId,
        transport: ServerTransport,
        address: SocketAddr,
    ) {
        info!("Connection {} registered as client '{}'", address, client);
        let (sink, stream) = transport.split();
        let queue = SendQueue::new(sink);
        let handle = self.get().handle().clone();
        {
            let mut state = self.get_mut();
            if state.clients.contains_key(&client) {
                warn!("Client '{}' was already registered, replacing its stream", client);
            }
            state.clients.insert(client.clone(), queue.clone());
        }
        queue.push(&handle, Response::StreamStart {});

        let state = self.clone();
        let reader_client = client.clone();
        let cleanup = self.clone();
        handle.spawn(
            stream
                .for_each(move |message| {
                    state.on_client_message(&reader_client, message);
                    Ok(())
                })
                .then(move |result| {
                    if let Err(e) = result {
                        debug!("Client '{}' stream failed: {}", client, e);
                    }
                    cleanup.get_mut().remove_client_conn(&client, &queue);
                    Ok(())
                }),
        );
    }

    fn on_client_message(&self, client: &ClientId, message: Request) {
        if let Err(e) = self.handle_client_message(client, message) {
            // a protocol error closes the stream with a diagnostic and
            // leaves the state untouched
            error!("Client '{}': {}", client, e);
            self.get_mut().remove_client(client);
        }
    }

    fn handle_client_message(&self, client: &ClientId, message: Request) -> Result<()> {
        match message {
            Request::UpdateGraph {
                tasks,
                dependencies,
                keys,
                client: submitted_as,
                restrictions,
                loose_restrictions,
                keyorder,
            } => {
                let client_id = submitted_as.unwrap_or_else(|| client.clone());
                let mut specs = HashMap::new();
                for (key, wire) in tasks {
                    specs.insert(key, TaskSpec::from_wire(wire)?);
                }
                let mut state = self.get_mut();
                let out = state.graph.update_graph(
                    specs,
                    dependencies,
                    keys,
                    restrictions,
                    loose_restrictions,
                    keyorder,
                    Some(client_id),
                )?;
                state.dispatch_outcome(out);
            }
            Request::ClientReleasesKeys { keys, client: owner } => {
                let mut state = self.get_mut();
                let out = state.graph.release_keys(&owner, &keys);
                state.dispatch_outcome(out);
            }
            Request::MissingData { keys } => {
                let mut state = self.get_mut();
                let out = state.graph.heal_missing_data(&keys);
                state.dispatch_outcome(out);
            }
            Request::UpdateData {
                who_has,
                nbytes,
                client: owner,
            } => {
                let owner = owner.or_else(|| Some(client.clone()));
                let mut state = self.get_mut();
                let out = state.graph.update_data(who_has, nbytes, owner);
                state.dispatch_outcome(out);
            }
            Request::Restart {} => {
                self.get_mut().restart_cluster();
            }
            Request::CloseStream {} => {
                let handle = self.get().handle().clone();
                if let Some(sink) = self.get().clients.get(client).cloned() {
                    sink.push(&handle, Response::StreamClosed {});
                }
                self.get_mut().remove_client(client);
            }
            Request::Feed {
                function,
                setup,
                teardown,
                interval_ms,
            } => {
                let sink = self.get().clients.get(client).cloned();
                if let Some(sink) = sink {
                    self.spawn_feed(sink, function, setup, teardown, interval_ms);
                }
            }
            Request::Heartbeat {} => {}
            other => bail!(ErrorKind::Protocol(format!(
                "unexpected {:?} on a client stream",
                other
            ))),
        }
        Ok(())
    }
}
