//! # Summary
//!
//! Keeps unacknowledged messages flowing. Every started transmission
//! owns a slot holding the message and the set of destinations still
//! waiting to acknowledge it; the slot re-offers the message to the
//! network once per `RETRANSMIT_TIMEOUT` until every destination is
//! removed or the slot is stopped. Destinations are independent: one
//! acknowledging stops its copies only.

use std::collections::HashMap;
use std::time::Instant;

use log::trace;

use crate::config::ReplicaId;
use crate::config::ReplicaSet;
use crate::config::RETRANSMIT_TIMEOUT;
use crate::message::Message;
use crate::network::Network;
use crate::timer::TimerEvent;
use crate::timer::TimerId;
use crate::timer::TimerQueue;

/// Identifies one retransmission slot.
pub type SlotId = u64;

#[derive(Debug)]
struct Slot {
    message: Message,
    destinations: ReplicaSet,
    timer: TimerId,
}

/// All live retransmission slots of one replica.
#[derive(Debug, Default)]
pub struct Retransmitter {
    slots: HashMap<SlotId, Slot>,
    next_slot: SlotId,
}

impl Retransmitter {
    pub fn new() -> Self {
        Retransmitter::default()
    }

    /// Sends `message` to every destination now and keeps re-offering
    /// it periodically to whoever remains in the set.
    pub fn start<N: Network>(
        &mut self,
        timers: &mut TimerQueue,
        now: Instant,
        network: &N,
        message: Message,
        destinations: ReplicaSet,
    ) -> SlotId {
        let slot = self.next_slot;
        self.next_slot += 1;
        send(network, &message, &destinations);
        let timer = timers.schedule(now, RETRANSMIT_TIMEOUT, TimerEvent::Retransmit { slot });
        self.slots.insert(
            slot,
            Slot {
                message,
                destinations,
                timer,
            },
        );
        slot
    }

    /// Cancels the whole slot.
    pub fn stop(&mut self, timers: &mut TimerQueue, slot: SlotId) {
        if let Some(slot) = self.slots.remove(&slot) {
            timers.cancel(slot.timer);
        }
    }

    /// Removes one destination; the slot dies with its last one.
    pub fn stop_destination(
        &mut self,
        timers: &mut TimerQueue,
        slot: SlotId,
        destination: ReplicaId,
    ) {
        let Some(entry) = self.slots.get_mut(&slot) else {
            return;
        };
        entry.destinations.remove(destination);
        if entry.destinations.is_empty() {
            self.stop(timers, slot);
        }
    }

    pub fn stop_all(&mut self, timers: &mut TimerQueue) {
        for (_, slot) in self.slots.drain() {
            timers.cancel(slot.timer);
        }
    }

    /// One immediate extra send, leaving the periodic schedule alone.
    pub fn force<N: Network>(&mut self, network: &N, slot: SlotId) {
        if let Some(entry) = self.slots.get(&slot) {
            trace!("forcing retransmission of {}", entry.message);
            send(network, &entry.message, &entry.destinations);
        }
    }

    /// Periodic fire for `slot`. Fires for stopped slots still sitting
    /// in the timer queue are ignored here.
    pub fn on_timer<N: Network>(
        &mut self,
        timers: &mut TimerQueue,
        now: Instant,
        network: &N,
        slot: SlotId,
    ) {
        let Some(entry) = self.slots.get_mut(&slot) else {
            return;
        };
        trace!("retransmitting {} to {:?}", entry.message, entry.destinations);
        send(network, &entry.message, &entry.destinations);
        entry.timer = timers.schedule(now, RETRANSMIT_TIMEOUT, TimerEvent::Retransmit { slot });
    }

    pub fn is_active(&self, slot: SlotId) -> bool {
        self.slots.contains_key(&slot)
    }
}

fn send<N: Network>(network: &N, message: &Message, destinations: &ReplicaSet) {
    for destination in destinations.iter() {
        network.send_to(destination, message);
    }
}

#[cfg(test)]
mod tests {
    use crate::message::Body;
    use crate::network::Outbox;

    use super::*;

    fn accept(instance_id: u32) -> Message {
        Message {
            view: 0,
            sent_time: 0,
            body: Body::Accept { instance_id },
        }
    }

    fn pair() -> (Outbox, crate::network::QueueNetwork) {
        let outbox = Outbox::new();
        let network = outbox.network(0, 3);
        (outbox, network)
    }

    #[test]
    fn start_sends_immediately_to_every_destination() {
        let (outbox, network) = pair();
        let mut timers = TimerQueue::new();
        let mut retransmitter = Retransmitter::new();
        let now = Instant::now();

        retransmitter.start(
            &mut timers,
            now,
            &network,
            accept(1),
            [1, 2].into_iter().collect(),
        );
        let sent: Vec<_> = outbox.drain().into_iter().map(|envelope| envelope.to).collect();
        assert_eq!(sent, vec![1, 2]);
        assert_eq!(timers.next_deadline(), Some(now + RETRANSMIT_TIMEOUT));
    }

    #[test]
    fn every_period_reoffers_to_remaining_destinations() {
        let (outbox, network) = pair();
        let mut timers = TimerQueue::new();
        let mut retransmitter = Retransmitter::new();
        let mut now = Instant::now();

        let slot = retransmitter.start(
            &mut timers,
            now,
            &network,
            accept(1),
            [1, 2].into_iter().collect(),
        );
        outbox.drain();
        retransmitter.stop_destination(&mut timers, slot, 1);

        for _ in 0..3 {
            now += RETRANSMIT_TIMEOUT;
            match timers.pop_due(now) {
                Some(TimerEvent::Retransmit { slot }) => {
                    retransmitter.on_timer(&mut timers, now, &network, slot);
                }
                other => panic!("unexpected timer: {:?}", other),
            }
        }
        let sent: Vec<_> = outbox.drain().into_iter().map(|envelope| envelope.to).collect();
        assert_eq!(sent, vec![2, 2, 2]);
    }

    #[test]
    fn removing_the_last_destination_stops_the_slot() {
        let (outbox, network) = pair();
        let mut timers = TimerQueue::new();
        let mut retransmitter = Retransmitter::new();
        let now = Instant::now();

        let slot = retransmitter.start(
            &mut timers,
            now,
            &network,
            accept(1),
            [1].into_iter().collect(),
        );
        retransmitter.stop_destination(&mut timers, slot, 1);
        assert!(!retransmitter.is_active(slot));
        assert_eq!(timers.next_deadline(), None);
        outbox.drain();

        // A fire that raced the stop is ignored.
        retransmitter.on_timer(&mut timers, now, &network, slot);
        assert!(outbox.is_empty());
    }

    #[test]
    fn force_sends_without_touching_the_schedule() {
        let (outbox, network) = pair();
        let mut timers = TimerQueue::new();
        let mut retransmitter = Retransmitter::new();
        let now = Instant::now();

        let slot = retransmitter.start(
            &mut timers,
            now,
            &network,
            accept(7),
            [2].into_iter().collect(),
        );
        outbox.drain();

        retransmitter.force(&network, slot);
        assert_eq!(outbox.drain().len(), 1);
        assert_eq!(timers.next_deadline(), Some(now + RETRANSMIT_TIMEOUT));
    }

    #[test]
    fn stop_all_cancels_every_slot() {
        let (outbox, network) = pair();
        let mut timers = TimerQueue::new();
        let mut retransmitter = Retransmitter::new();
        let now = Instant::now();

        retransmitter.start(&mut timers, now, &network, accept(1), [1].into_iter().collect());
        retransmitter.start(&mut timers, now, &network, accept(2), [2].into_iter().collect());
        retransmitter.stop_all(&mut timers);

        assert_eq!(timers.next_deadline(), None);
        outbox.drain();
        assert!(timers.pop_due(now + RETRANSMIT_TIMEOUT).is_none());
    }
}
