//! The epoll runtime: reactor, workers, timers, connections.
//!
//! Pieces that make up the engine:
//! - `Reactor`: one-shot epoll readiness notification
//! - `TimerHeap`: indexed min-heap of idle deadlines
//! - `ThreadPool`: fixed worker pool the reactor feeds
//! - `Buffer`: byte buffer behind each connection's reads and writes
//! - `Connection` and `Server`: the protocol step and the loop around it

pub(crate) mod buffer;
mod conn;
mod pool;
mod reactor;
mod server;
mod timer;

pub(crate) use buffer::Buffer;

use std::sync::Arc;

use crate::auth::{CredentialStore, UserDirectory};
use crate::config::Config;
use server::Server;

#[cfg(not(target_os = "linux"))]
compile_error!("serve-a-page relies on Linux epoll one-shot dispatch");

/// Build the collaborators and drive the reactor loop until shutdown.
pub fn run(config: Config) -> std::io::Result<()> {
    let store: Arc<dyn CredentialStore> =
        UserDirectory::new(config.credential_slots, &config.seed_users);
    let mut server = Server::bind(&config, store)?;
    server.run()
}
