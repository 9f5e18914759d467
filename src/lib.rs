//! # Summary
//!
//! This crate implements crash-recovery state-machine replication on
//! top of Multi-Paxos. A fixed group of replicas agrees on a totally
//! ordered sequence of client requests and applies them to a
//! deterministic service, surviving crashes through stable storage and
//! lagging replicas through snapshots and catch-up.
//!
//! # Usage
//!
//! Implement the [`Service`] trait for the state machine to replicate,
//! pick a [`StableStore`] backend ([`FileStore`] for real deployments,
//! [`MemStore`] for tests), and wire the replica's [`Engine`] to a
//! transport through the [`Network`] trait. The [`dispatcher`] module
//! provides the single-threaded event loop that owns all protocol
//! state; everything else (network readers, client frontends, the
//! service adapter) talks to it through a clonable [`Handle`].
//!
//! ```no_run
//! use multipaxos::{ChannelHub, Config, Engine, FileStore, Request, RequestId, Service};
//!
//! #[derive(Default)]
//! struct Register(Vec<u8>);
//!
//! impl Service for Register {
//!     fn execute(&mut self, _id: u32, request: &Request) -> Vec<u8> {
//!         self.0 = request.payload.clone();
//!         self.0.clone()
//!     }
//!     fn make_snapshot(&mut self) -> Vec<u8> {
//!         self.0.clone()
//!     }
//!     fn update_to_snapshot(&mut self, snapshot: &[u8]) {
//!         self.0 = snapshot.to_vec();
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let config = Config::new(0, 3);
//!     let hub = ChannelHub::new();
//!     let (handle, dispatcher) = multipaxos::dispatcher::channel(config.busy_threshold());
//!     let network = hub.register(0, handle.clone());
//!     let store = Box::new(FileStore::new("replica-00.stable"));
//!     let mut engine = Engine::new(config, network, Register::default(), store);
//!     engine.start(std::time::Instant::now());
//!
//!     handle
//!         .propose(Request::new(
//!             RequestId { client_id: 1, sequence: 1 },
//!             b"value".to_vec(),
//!         ))
//!         .unwrap();
//!     dispatcher.run(engine).await;
//! }
//! ```
//!
//! # Implementation Details
//!
//! - One dispatcher task owns all protocol state; handlers run to
//!   completion and timers fire as queue events, so there is no
//!   locking anywhere in the protocol path.
//! - The leader of view `v` is `v mod N`. A ping-based oracle drives
//!   view changes; any protocol message counts as leader liveness.
//! - Client requests are batched into proposal values, bounded by the
//!   configured batch size and the proposal window.
//! - Stable storage is an fsynced append-only record file; a decision
//!   is acknowledged only after its record is durable.
//! - The service is asked for snapshots as the log grows; lagging
//!   replicas receive missing decided instances, or a whole snapshot
//!   when their gap predates the peer's log.

mod acceptor;
mod catchup;
mod learner;
mod oracle;
mod proposer;
mod retransmitter;
mod timer;

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod message;
pub mod network;
pub mod request;
pub mod service;
pub mod snapshot;
pub mod storage;

pub use crate::config::Config;
pub use crate::config::InstanceId;
pub use crate::config::ReplicaId;
pub use crate::config::View;
pub use crate::dispatcher::Event;
pub use crate::dispatcher::Handle;
pub use crate::engine::Engine;
pub use crate::error::Error;
pub use crate::message::Body;
pub use crate::message::Message;
pub use crate::network::ChannelHub;
pub use crate::network::Network;
pub use crate::request::Request;
pub use crate::request::RequestId;
pub use crate::service::Service;
pub use crate::snapshot::Snapshot;
pub use crate::storage::log::LogEntryState;
pub use crate::storage::FileStore;
pub use crate::storage::MemStore;
pub use crate::storage::StableStore;
