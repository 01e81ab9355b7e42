extern crate byteorder;
extern crate bytes;
#[macro_use]
extern crate error_chain;
extern crate futures;
#[macro_use]
extern crate log;
extern crate serde;
extern crate serde_bytes;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate serde_json;
extern crate sha1;
extern crate tokio_core;
extern crate tokio_io;

pub mod common;
pub mod errors;
pub mod server;
pub mod worker;

use std::sync::atomic::AtomicBool;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Clients and workers must announce this version at registration.
pub const PROTOCOL_VERSION: u32 = 1;

/// When set, the full invariant check runs after every handler.
pub static DEBUG_CHECK_CONSISTENCY: AtomicBool = AtomicBool::new(false);
