//! # Summary
//!
//! The acceptor role. It keeps no state of its own: everything it
//! learns goes straight into the log, and the view it honours is the
//! one in stable storage. The engine performs the view comparisons
//! common to all message kinds before calling in here, so both handlers
//! run at the replica's current view.

use log::debug;
use log::trace;

use crate::config::Config;
use crate::config::InstanceId;
use crate::config::ReplicaId;
use crate::config::View;
use crate::storage::log::InstanceRecord;
use crate::storage::log::LogEntryState;
use crate::message::Body;
use crate::message::Message;
use crate::network::Network;
use crate::storage::Storage;

#[derive(Debug, Default)]
pub(crate) struct Acceptor;

impl Acceptor {
    /// Phase 1: answers a new leader with every instance above its
    /// first uncommitted id that carries any information.
    pub fn on_prepare<N: Network>(
        &self,
        storage: &mut Storage,
        network: &N,
        sender: ReplicaId,
        view: View,
        first_uncommitted: InstanceId,
    ) {
        debug_assert_eq!(view, storage.view());
        let prepared: Vec<InstanceRecord> = storage
            .log()
            .range(first_uncommitted, storage.log().next_id())
            .filter(|instance| instance.state() != LogEntryState::Unknown)
            .map(|instance| instance.record())
            .collect();
        debug!(
            "answering prepare for view {} with {} instances",
            view,
            prepared.len(),
        );
        network.send_to(sender, &Message::new(view, Body::PrepareOk { prepared }));
    }

    /// Phase 2: accepts the proposed value and announces the accept to
    /// the rest of the group. Returns the accepted id, or `None` when
    /// the proposal is stale.
    pub fn on_propose<N: Network>(
        &self,
        config: &Config,
        storage: &mut Storage,
        network: &N,
        instance: &InstanceRecord,
    ) -> Option<InstanceId> {
        let view = storage.view();
        if instance.view != view {
            trace!("dropping proposal for old view {}", instance.view);
            return None;
        }
        let value = instance.value.as_deref()?;
        // Allocates the instance, and any gap below it, on first contact.
        if !storage.log_mut().set_value(instance.id, instance.view, value) {
            return None;
        }
        if let Some(entry) = storage.log_mut().instance_mut(instance.id) {
            if let Some(accepts) = entry.accepts_mut() {
                accepts.insert(config.id());
            }
        }
        network.send_to_all(&Message::new(
            view,
            Body::Accept {
                instance_id: instance.id,
            },
        ));
        Some(instance.id)
    }
}

#[cfg(test)]
mod tests {
    use crate::message::Body;
    use crate::network::Outbox;
    use crate::storage::MemStore;

    use super::*;

    fn fixture(id: ReplicaId) -> (Config, Storage, Outbox, crate::network::QueueNetwork) {
        let config = Config::new(id, 3).with_window_size(3);
        let storage = Storage::recover(config, Box::new(MemStore::new()));
        let outbox = Outbox::new();
        let network = outbox.network(id, 3);
        (config, storage, outbox, network)
    }

    fn known(id: InstanceId, view: View, value: &[u8]) -> InstanceRecord {
        InstanceRecord {
            id,
            view,
            state: LogEntryState::Known,
            value: Some(value.to_vec()),
        }
    }

    #[test]
    fn prepare_reports_known_and_decided_instances() {
        let (_, mut storage, outbox, network) = fixture(1);
        storage.log_mut().append(0, b"a".to_vec());
        storage.log_mut().append(0, b"b".to_vec());
        storage.mark_decided(0);
        storage.log_mut().extend_to(2);
        storage.set_view(1);

        Acceptor.on_prepare(&mut storage, &network, 0, 1, 0);

        let envelope = outbox.pop().unwrap();
        assert_eq!(envelope.to, 0);
        match envelope.message.body {
            Body::PrepareOk { prepared } => {
                // The unknown tail entry carries no information.
                assert_eq!(prepared.len(), 2);
                assert_eq!(prepared[0].state, LogEntryState::Decided);
                assert_eq!(prepared[1].state, LogEntryState::Known);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn prepare_honours_first_uncommitted_bound() {
        let (_, mut storage, outbox, network) = fixture(1);
        storage.log_mut().append(0, b"a".to_vec());
        storage.log_mut().append(0, b"b".to_vec());

        Acceptor.on_prepare(&mut storage, &network, 0, 0, 1);
        match outbox.pop().unwrap().message.body {
            Body::PrepareOk { prepared } => {
                assert_eq!(prepared.len(), 1);
                assert_eq!(prepared[0].id, 1);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn propose_accepts_and_broadcasts() {
        let (_, mut storage, outbox, network) = fixture(1);

        let accepted = Acceptor.on_propose(
            &Config::new(1, 3),
            &mut storage,
            &network,
            &known(0, 0, b"value"),
        );
        assert_eq!(accepted, Some(0));

        let instance = storage.log().instance(0).unwrap();
        assert_eq!(instance.state(), LogEntryState::Known);
        assert_eq!(instance.value(), Some(&b"value"[..]));
        assert!(instance.accepts().unwrap().contains(1));

        let destinations: Vec<_> = outbox.drain().into_iter().map(|e| e.to).collect();
        assert_eq!(destinations, vec![0, 2]);
    }

    #[test]
    fn propose_for_a_future_id_allocates_the_gap() {
        let (_, mut storage, _outbox, network) = fixture(1);

        Acceptor.on_propose(&Config::new(1, 3), &mut storage, &network, &known(2, 0, b"v"));
        assert_eq!(storage.log().next_id(), 3);
        assert_eq!(storage.log().state(0), Some(LogEntryState::Unknown));
        assert_eq!(storage.log().state(1), Some(LogEntryState::Unknown));
        assert_eq!(storage.log().state(2), Some(LogEntryState::Known));
    }

    #[test]
    fn propose_from_an_old_view_is_dropped() {
        let (_, mut storage, outbox, network) = fixture(1);
        storage.set_view(2);

        let accepted = Acceptor.on_propose(
            &Config::new(1, 3),
            &mut storage,
            &network,
            &known(0, 1, b"stale"),
        );
        assert_eq!(accepted, None);
        assert!(storage.log().instance(0).is_none());
        assert!(outbox.is_empty());
    }
}
