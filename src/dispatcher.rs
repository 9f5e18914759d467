//! # Summary
//!
//! The single-threaded event loop that owns all protocol state. Other
//! threads (network readers, the service adapter, client frontends)
//! only ever enqueue events through a [`Handle`]; the loop pops them
//! one at a time and runs each handler to completion, interleaved with
//! due timers from the engine's timer queue.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::ReplicaId;
use crate::engine::Engine;
use crate::error::Error;
use crate::message::Message;
use crate::network::Network;
use crate::request::Request;
use crate::service::Service;
use crate::snapshot::Snapshot;

/// One unit of work for the dispatcher.
#[derive(Debug)]
pub enum Event {
    /// A decoded protocol message from `sender`.
    Receive { sender: ReplicaId, message: Message },

    /// A client proposal admitted by the busy check.
    Propose(Request),

    /// A snapshot the service adapter produced on its own thread.
    Snapshot(Snapshot),
}

/// Clonable producer side of the dispatcher queue.
#[derive(Clone)]
pub struct Handle {
    tx: mpsc::UnboundedSender<Event>,
    depth: Arc<AtomicUsize>,
    busy_threshold: usize,
}

impl Handle {
    /// Client-facing admission: refused with [`Error::Busy`] while the
    /// queue is over the threshold, so overload surfaces to clients
    /// instead of growing the queue without bound.
    pub fn propose(&self, request: Request) -> Result<(), Error> {
        if self.depth.load(Ordering::Relaxed) > self.busy_threshold {
            return Err(Error::Busy);
        }
        self.post(Event::Propose(request))
    }

    /// In-protocol delivery; never refused for overload.
    pub fn deliver(&self, sender: ReplicaId, message: Message) {
        // A send can only fail once the replica is shutting down, at
        // which point a lost message is indistinguishable from one
        // lost by the network.
        let _ = self.post(Event::Receive { sender, message });
    }

    /// Hands over a snapshot produced by the service adapter.
    pub fn offer_snapshot(&self, snapshot: Snapshot) -> Result<(), Error> {
        self.post(Event::Snapshot(snapshot))
    }

    fn post(&self, event: Event) -> Result<(), Error> {
        self.tx.send(event).map_err(|_| Error::Shutdown)?;
        self.depth.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Consumer side of the dispatcher queue.
pub struct Dispatcher {
    rx: mpsc::UnboundedReceiver<Event>,
    depth: Arc<AtomicUsize>,
}

/// Creates the queue shared by one replica's producers and its loop.
pub fn channel(busy_threshold: usize) -> (Handle, Dispatcher) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    let handle = Handle {
        tx,
        depth: depth.clone(),
        busy_threshold,
    };
    (handle, Dispatcher { rx, depth })
}

impl Dispatcher {
    pub(crate) async fn next(&mut self) -> Option<Event> {
        let event = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Some(event)
    }

    /// Drives `engine` until every [`Handle`] is dropped. A panic in a
    /// handler is deliberately not caught: a replica that tripped an
    /// invariant must die rather than keep mutating state.
    pub async fn run<N: Network, S: Service>(mut self, mut engine: Engine<N, S>) {
        loop {
            let now = std::time::Instant::now();
            engine.on_time(now);
            let deadline = engine.next_deadline();
            tokio::select! {
                event = self.next() => match event {
                    Some(event) => engine.handle(std::time::Instant::now(), event),
                    None => break,
                },
                _ = sleep_until(deadline) => {}
            }
        }
    }
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use crate::request::RequestId;

    use super::*;

    fn request(sequence: i32) -> Request {
        Request::new(
            RequestId {
                client_id: 1,
                sequence,
            },
            vec![0],
        )
    }

    #[tokio::test]
    async fn proposals_are_refused_over_the_threshold() {
        let (handle, mut dispatcher) = channel(2);
        handle.propose(request(1)).unwrap();
        handle.propose(request(2)).unwrap();
        handle.propose(request(3)).unwrap();
        assert!(matches!(handle.propose(request(4)), Err(Error::Busy)));

        // Protocol traffic is still admitted.
        handle.deliver(
            0,
            Message {
                view: 0,
                sent_time: 0,
                body: crate::message::Body::Alive,
            },
        );

        // Draining the queue reopens admission.
        for _ in 0..4 {
            dispatcher.next().await.unwrap();
        }
        handle.propose(request(5)).unwrap();
    }

    #[tokio::test]
    async fn events_arrive_in_post_order() {
        let (handle, mut dispatcher) = channel(10);
        handle.propose(request(1)).unwrap();
        handle
            .offer_snapshot(Snapshot {
                last_included: 0,
                view: 0,
                service_state: Vec::new(),
                reply_cache: Vec::new(),
            })
            .unwrap();

        assert!(matches!(
            dispatcher.next().await,
            Some(Event::Propose(r)) if r.id.sequence == 1,
        ));
        assert!(matches!(dispatcher.next().await, Some(Event::Snapshot(_))));
    }

    #[test]
    fn posting_after_shutdown_reports_it() {
        let (handle, dispatcher) = channel(10);
        drop(dispatcher);
        assert!(matches!(handle.propose(request(1)), Err(Error::Shutdown)));
    }
}
