use std::net::SocketAddr;

/// Worker identity: the address of its data port.
pub type WorkerId = SocketAddr;

/// Client identity, chosen by the client at registration.
pub type ClientId = String;

/// Opaque identifier of a task and its result, chosen by the client.
pub type TaskKey = String;
