//! # Summary
//!
//! The narrow seam between the replication core and whatever carries
//! its messages. The engine only ever asks for a unicast or a
//! broadcast; delivery happens by posting decoded messages onto the
//! destination's dispatcher queue.
//!
//! Two in-process implementations ship with the crate: [`ChannelHub`]
//! wires replica handles together for embedders and multi-replica
//! tests, and [`Outbox`] captures traffic for deterministic,
//! manually-pumped tests.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use parking_lot::RwLock;

use crate::config::ReplicaId;
use crate::dispatcher::Handle;
use crate::message::Message;

/// Outbound half of the transport, as seen by one replica.
pub trait Network: Send + 'static {
    fn send_to(&self, destination: ReplicaId, message: &Message);

    /// Sends to every replica except the local one.
    fn send_to_all(&self, message: &Message);
}

/// Registry connecting co-located replicas through their dispatcher
/// queues. Every delivery round-trips through the wire codec, so the
/// bytes exchanged are exactly what a datagram transport would carry.
#[derive(Clone, Default)]
pub struct ChannelHub(Arc<RwLock<HashMap<ReplicaId, Handle>>>);

impl ChannelHub {
    pub fn new() -> Self {
        ChannelHub::default()
    }

    /// Registers a replica's queue and returns its sending side.
    pub fn register(&self, id: ReplicaId, handle: Handle) -> ChannelNetwork {
        self.0.write().insert(id, handle);
        ChannelNetwork {
            id,
            hub: self.clone(),
        }
    }

    /// Drops a replica from the registry; messages towards it vanish,
    /// exactly like datagrams towards a dead host.
    pub fn disconnect(&self, id: ReplicaId) {
        self.0.write().remove(&id);
    }
}

/// [`Network`] implementation bound to one replica on a [`ChannelHub`].
#[derive(Clone)]
pub struct ChannelNetwork {
    id: ReplicaId,
    hub: ChannelHub,
}

impl ChannelNetwork {
    fn transmit(&self, destination: ReplicaId, bytes: &[u8]) {
        let handles = self.hub.0.read();
        let Some(handle) = handles.get(&destination) else {
            return;
        };
        match Message::decode(bytes) {
            Ok(message) => handle.deliver(self.id, message),
            Err(error) => warn!("dropping malformed message: {}", error),
        }
    }
}

impl Network for ChannelNetwork {
    fn send_to(&self, destination: ReplicaId, message: &Message) {
        self.transmit(destination, &message.encode());
    }

    fn send_to_all(&self, message: &Message) {
        let bytes = message.encode();
        let destinations: Vec<ReplicaId> = self.hub.0.read().keys().copied().collect();
        for destination in destinations {
            if destination != self.id {
                self.transmit(destination, &bytes);
            }
        }
    }
}

/// One captured message in flight.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: ReplicaId,
    pub to: ReplicaId,
    pub message: Message,
}

/// Captures every send into a shared queue so a test can deliver, drop
/// or reorder traffic explicitly.
#[derive(Clone, Default)]
pub struct Outbox(Arc<Mutex<VecDeque<Envelope>>>);

impl Outbox {
    pub fn new() -> Self {
        Outbox::default()
    }

    /// The sending side for replica `id` in a group of `count`.
    pub fn network(&self, id: ReplicaId, count: usize) -> QueueNetwork {
        QueueNetwork {
            id,
            count,
            outbox: self.clone(),
        }
    }

    pub fn pop(&self) -> Option<Envelope> {
        self.0.lock().pop_front()
    }

    pub fn drain(&self) -> Vec<Envelope> {
        self.0.lock().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// [`Network`] implementation writing into an [`Outbox`].
#[derive(Clone)]
pub struct QueueNetwork {
    id: ReplicaId,
    count: usize,
    outbox: Outbox,
}

impl QueueNetwork {
    fn push(&self, to: ReplicaId, message: &Message) {
        // Round-trip through the codec so captured traffic is held to
        // the same wire rules as real traffic.
        let message = Message::decode(&message.encode()).expect("outbound message must encode");
        self.outbox.0.lock().push_back(Envelope {
            from: self.id,
            to,
            message,
        });
    }
}

impl Network for QueueNetwork {
    fn send_to(&self, destination: ReplicaId, message: &Message) {
        self.push(destination, message);
    }

    fn send_to_all(&self, message: &Message) {
        for destination in 0..self.count {
            if destination != self.id {
                self.push(destination, message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::message::Body;

    use super::*;

    fn alive(view: i32) -> Message {
        Message {
            view,
            sent_time: 0,
            body: Body::Alive,
        }
    }

    #[tokio::test]
    async fn hub_routes_between_registered_replicas() {
        let hub = ChannelHub::new();
        let (handle_0, mut dispatcher_0) = crate::dispatcher::channel(16);
        let (handle_1, _dispatcher_1) = crate::dispatcher::channel(16);
        hub.register(0, handle_0);
        let network_1 = hub.register(1, handle_1);

        network_1.send_to(0, &alive(4));
        match dispatcher_0.next().await {
            Some(crate::dispatcher::Event::Receive { sender, message }) => {
                assert_eq!(sender, 1);
                assert_eq!(message, alive(4));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn broadcast_skips_self_and_disconnected() {
        let hub = ChannelHub::new();
        let (handle_0, mut dispatcher_0) = crate::dispatcher::channel(16);
        let (handle_1, _dispatcher_1) = crate::dispatcher::channel(16);
        let (handle_2, _dispatcher_2) = crate::dispatcher::channel(16);
        let network_0 = hub.register(0, handle_0);
        hub.register(1, handle_1);
        hub.register(2, handle_2);
        hub.disconnect(1);

        network_0.send_to_all(&alive(0));
        network_0.send_to(0, &alive(1));

        // Only the explicit self-send arrives locally.
        match dispatcher_0.next().await {
            Some(crate::dispatcher::Event::Receive { sender, message }) => {
                assert_eq!(sender, 0);
                assert_eq!(message.view, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn outbox_captures_broadcasts_per_destination() {
        let outbox = Outbox::new();
        let network = outbox.network(1, 3);
        network.send_to_all(&alive(0));
        network.send_to(1, &alive(2));

        let envelopes = outbox.drain();
        let routes: Vec<(ReplicaId, ReplicaId)> =
            envelopes.iter().map(|envelope| (envelope.from, envelope.to)).collect();
        assert_eq!(routes, vec![(1, 0), (1, 2), (1, 1)]);
        assert!(outbox.is_empty());
    }
}
