//! # Summary
//!
//! The seam towards the replicated service. The engine hands decided
//! requests to an implementation of `Service` in strictly ascending
//! instance order; everything else about the service (its state, its
//! clients, its reply semantics) stays on the other side of the trait.

use crate::config::InstanceId;
use crate::request::Request;

/// A deterministic service replicated by the engine.
///
/// All methods are called from the dispatcher, one at a time, so an
/// implementation needs no internal synchronization.
pub trait Service: Send + 'static {
    /// Applies one decided request and returns the reply bytes. Called
    /// exactly once per request per instance, in instance order; the
    /// reply is retained in the engine's reply cache and rides along in
    /// snapshots.
    fn execute(&mut self, instance_id: InstanceId, request: &Request) -> Vec<u8>;

    /// Produces a checkpoint of the current service state. The engine
    /// calls this once the accumulated log justifies a snapshot; an
    /// implementation that prefers to checkpoint on its own thread may
    /// return an empty vector and later push the result through
    /// `Handle::offer_snapshot`.
    fn make_snapshot(&mut self) -> Vec<u8>;

    /// Replaces the whole service state with a checkpoint, either at
    /// recovery or when catch-up installs a remote snapshot.
    fn update_to_snapshot(&mut self, snapshot: &[u8]);

    /// Notifies that every request of `instance_id` has been executed.
    fn instance_executed(&mut self, _instance_id: InstanceId) {}
}
