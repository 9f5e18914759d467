//! Multi-replica scenarios driven deterministically: engines are
//! stepped by hand, traffic flows through a captured outbox, and
//! timers fire only when a test advances the clock.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use multipaxos::config::SUSPECT_LEADER;
use multipaxos::dispatcher::Event;
use multipaxos::engine::Engine;
use multipaxos::network::Envelope;
use multipaxos::network::Outbox;
use multipaxos::network::QueueNetwork;
use multipaxos::request::unbatch;
use multipaxos::Body;
use multipaxos::Config;
use multipaxos::InstanceId;
use multipaxos::LogEntryState;
use multipaxos::MemStore;
use multipaxos::ReplicaId;
use multipaxos::Request;
use multipaxos::RequestId;
use multipaxos::Service;
use multipaxos::Snapshot;

/// Concatenates executed payloads; snapshots are the concatenation so
/// far. Shared handles let the test inspect state the engine owns.
#[derive(Clone, Default)]
struct JournalService(Arc<Mutex<Journal>>);

#[derive(Default)]
struct Journal {
    executed: Vec<(InstanceId, RequestId)>,
    state: Vec<u8>,
    installed_snapshots: usize,
}

impl Service for JournalService {
    fn execute(&mut self, instance_id: InstanceId, request: &Request) -> Vec<u8> {
        let mut journal = self.0.lock();
        journal.executed.push((instance_id, request.id));
        journal.state.extend_from_slice(&request.payload);
        request.payload.clone()
    }

    fn make_snapshot(&mut self) -> Vec<u8> {
        self.0.lock().state.clone()
    }

    fn update_to_snapshot(&mut self, snapshot: &[u8]) {
        let mut journal = self.0.lock();
        journal.state = snapshot.to_vec();
        journal.installed_snapshots += 1;
    }
}

struct Cluster {
    engines: Vec<Option<Engine<QueueNetwork, JournalService>>>,
    services: Vec<JournalService>,
    stores: Vec<MemStore>,
    outbox: Outbox,
    now: Instant,
}

impl Cluster {
    fn new(count: usize, window_size: u32) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let outbox = Outbox::new();
        let now = Instant::now();
        let mut cluster = Cluster {
            engines: Vec::new(),
            services: Vec::new(),
            stores: Vec::new(),
            outbox: outbox.clone(),
            now,
        };
        for id in 0..count {
            let config = Config::new(id, count).with_window_size(window_size);
            let service = JournalService::default();
            let store = MemStore::new();
            let mut engine = Engine::new(
                config,
                outbox.network(id, count),
                service.clone(),
                Box::new(store.clone()),
            );
            engine.start(now);
            cluster.engines.push(Some(engine));
            cluster.services.push(service);
            cluster.stores.push(store);
        }
        cluster
    }

    fn engine(&self, id: ReplicaId) -> &Engine<QueueNetwork, JournalService> {
        self.engines[id].as_ref().expect("replica is down")
    }

    fn propose(&mut self, to: ReplicaId, request: Request) {
        let now = self.now;
        self.engines[to]
            .as_mut()
            .expect("replica is down")
            .handle(now, Event::Propose(request));
    }

    fn offer_snapshot(&mut self, to: ReplicaId, snapshot: Snapshot) {
        let now = self.now;
        self.engines[to]
            .as_mut()
            .expect("replica is down")
            .handle(now, Event::Snapshot(snapshot));
    }

    fn deliver(&mut self, envelope: Envelope) {
        let now = self.now;
        if let Some(engine) = self.engines[envelope.to].as_mut() {
            engine.handle(
                now,
                Event::Receive {
                    sender: envelope.from,
                    message: envelope.message,
                },
            );
        }
    }

    /// Delivers queued traffic until the network is quiet.
    fn pump(&mut self) {
        self.pump_where(|_| true);
    }

    /// Delivers envelopes matching the filter; the rest is dropped,
    /// exactly like datagrams lost on the wire.
    fn pump_where(&mut self, keep: impl Fn(&Envelope) -> bool) {
        let mut safety = 0;
        while let Some(envelope) = self.outbox.pop() {
            safety += 1;
            assert!(safety < 10_000, "the network never went quiet");
            if keep(&envelope) {
                self.deliver(envelope);
            }
        }
    }

    fn crash(&mut self, id: ReplicaId) {
        self.engines[id] = None;
    }

    fn restart(&mut self, id: ReplicaId) {
        let count = self.engines.len();
        let config = Config::new(id, count).with_window_size(3);
        let service = JournalService::default();
        let mut engine = Engine::new(
            config,
            self.outbox.network(id, count),
            service.clone(),
            Box::new(self.stores[id].clone()),
        );
        engine.start(self.now);
        self.engines[id] = Some(engine);
        self.services[id] = service;
    }

    /// Fires one replica's due timers after advancing the clock far
    /// enough for its leader suspicion to trip.
    fn suspect(&mut self, id: ReplicaId) {
        self.now += SUSPECT_LEADER;
        let now = self.now;
        self.engines[id].as_mut().expect("replica is down").on_time(now);
    }

    fn decided_value(&self, id: ReplicaId, instance: InstanceId) -> Vec<u8> {
        let engine = self.engine(id);
        let entry = engine.storage().log().instance(instance).expect("no instance");
        assert_eq!(entry.state(), LogEntryState::Decided);
        entry.value().unwrap().to_vec()
    }

    fn journal(&self, id: ReplicaId) -> Vec<(InstanceId, RequestId)> {
        self.services[id].0.lock().executed.clone()
    }

    fn state(&self, id: ReplicaId) -> Vec<u8> {
        self.services[id].0.lock().state.clone()
    }
}

fn request(client_id: i64, sequence: i32, payload: &[u8]) -> Request {
    Request::new(
        RequestId {
            client_id,
            sequence,
        },
        payload.to_vec(),
    )
}

fn is_propose_of(envelope: &Envelope, instance: InstanceId) -> bool {
    matches!(&envelope.message.body, Body::Propose { instance: record } if record.id == instance)
}

#[test]
fn happy_commit() {
    let mut cluster = Cluster::new(3, 3);
    let r = request(1, 1, b"x");
    cluster.propose(0, r.clone());
    cluster.pump();

    for id in 0..3 {
        assert_eq!(cluster.engine(id).storage().first_uncommitted(), 1);
        assert_eq!(cluster.engine(id).executed_up_to(), 1);
        assert_eq!(cluster.journal(id), vec![(0, r.id)]);
        assert_eq!(cluster.state(id), b"x");
        // The reply to client 1 is cached for duplicate handling.
        assert_eq!(cluster.engine(id).reply_cache().reply(1), Some((1, &b"x"[..])));
    }
    // Agreement: every replica decided the same bytes.
    let value = cluster.decided_value(0, 0);
    assert_eq!(cluster.decided_value(1, 0), value);
    assert_eq!(cluster.decided_value(2, 0), value);
}

#[test]
fn view_change_repropose_locked_value() {
    let mut cluster = Cluster::new(3, 3);
    let r = request(1, 1, b"locked");
    cluster.propose(0, r.clone());

    // The proposal reaches replica 1 only, and every answer is lost:
    // the value is accepted by a single follower when the leader dies.
    cluster.pump_where(|envelope| {
        envelope.from == 0 && envelope.to == 1 && is_propose_of(envelope, 0)
    });
    assert_eq!(
        cluster.engine(1).storage().log().state(0),
        Some(LogEntryState::Known),
    );
    cluster.crash(0);

    // Replica 1 suspects the silent leader and takes over view 1.
    cluster.suspect(1);
    assert_eq!(cluster.engine(1).storage().view(), 1);
    cluster.pump();

    // The locked value survived the view change.
    for id in [1, 2] {
        let requests = unbatch(&cluster.decided_value(id, 0)).unwrap();
        assert_eq!(requests, vec![r.clone()]);
        assert_eq!(cluster.journal(id), vec![(0, r.id)]);
    }
}

#[test]
fn view_change_fills_gaps_with_no_ops() {
    let mut cluster = Cluster::new(3, 3);
    cluster.propose(0, request(1, 1, b"first"));
    cluster.propose(0, request(1, 2, b"second"));

    // Only the second proposal reaches replica 1; instance 0 exists
    // there purely as an allocation gap. The leader then dies.
    cluster.pump_where(|envelope| {
        envelope.from == 0 && envelope.to == 1 && is_propose_of(envelope, 1)
    });
    cluster.crash(0);

    cluster.suspect(1);
    cluster.pump();

    // Instance 0 closed as a no-op, instance 1 kept its value.
    for id in [1, 2] {
        let gap = unbatch(&cluster.decided_value(id, 0)).unwrap();
        assert_eq!(gap.len(), 1);
        assert!(gap[0].is_no_op());

        let kept = unbatch(&cluster.decided_value(id, 1)).unwrap();
        assert_eq!(kept[0].payload, b"second");

        // The service saw only the real request, in order.
        assert_eq!(
            cluster.journal(id),
            vec![(1, RequestId { client_id: 1, sequence: 2 })],
        );
        assert_eq!(cluster.engine(id).executed_up_to(), 2);
    }
}

#[test]
fn requests_batch_into_a_single_proposal() {
    let mut cluster = Cluster::new(3, 1);

    // One request in flight fills the whole window, so the burst
    // behind it queues up and leaves as a single batch.
    cluster.propose(0, request(1, 0, b"warmup"));
    for sequence in 1..7 {
        cluster.propose(0, request(1, sequence, &[b'r'; 200]));
    }
    cluster.pump();

    let requests = unbatch(&cluster.decided_value(0, 1)).unwrap();
    assert_eq!(requests.len(), 6);
    for (index, request) in requests.iter().enumerate() {
        assert_eq!(request.id.sequence, index as i32 + 1);
        assert_eq!(request.payload.len(), 200);
    }
    for id in 0..3 {
        assert_eq!(cluster.engine(id).executed_up_to(), 2);
        assert_eq!(cluster.journal(id).len(), 7);
        assert_eq!(cluster.decided_value(id, 1), cluster.decided_value(0, 1));
    }
}

#[test]
fn full_window_stalls_and_force_retransmits() {
    let mut cluster = Cluster::new(3, 3);

    // Five decided instances move the window to [5, 8).
    for sequence in 0..5 {
        cluster.propose(0, request(1, sequence, b"warmup"));
        cluster.pump();
    }
    assert_eq!(cluster.engine(0).storage().first_uncommitted(), 5);

    // Three proposals fill the window; the fourth must wait.
    for sequence in 5..8 {
        cluster.propose(0, request(1, sequence, b"inflight"));
    }
    assert_eq!(cluster.engine(0).storage().log().next_id(), 8);
    cluster.propose(0, request(1, 8, b"overflow"));
    assert_eq!(cluster.engine(0).storage().log().next_id(), 8);

    // Each stuck instance went out twice: the original send and the
    // forced nudge, to both followers each.
    let envelopes = cluster.outbox.drain();
    for instance in 5..8 {
        let copies = envelopes
            .iter()
            .filter(|envelope| is_propose_of(envelope, instance))
            .count();
        assert_eq!(copies, 4, "instance {} was not nudged", instance);
    }

    // Once the window drains, the queued request follows as instance 8.
    for envelope in envelopes {
        cluster.deliver(envelope);
    }
    cluster.pump();
    for id in 0..3 {
        assert_eq!(cluster.engine(id).executed_up_to(), 9);
    }
}

#[test]
fn lagging_replica_catches_up_through_snapshot_and_log() {
    let mut cluster = Cluster::new(3, 3);

    // Replica 2 misses five decided instances.
    for sequence in 0..5 {
        cluster.propose(0, request(1, sequence, format!("r{}", sequence).as_bytes()));
        cluster.pump_where(|envelope| envelope.to != 2 && envelope.from != 2);
    }
    assert_eq!(cluster.engine(0).storage().first_uncommitted(), 5);
    assert_eq!(cluster.engine(2).storage().first_uncommitted(), 0);

    // The leader checkpoints through instance 3 and drops that prefix.
    let state = cluster.state(0)[..8].to_vec(); // "r0r1r2r3"
    cluster.offer_snapshot(
        0,
        Snapshot {
            last_included: 3,
            view: 0,
            service_state: state,
            reply_cache: Vec::new(),
        },
    );
    assert_eq!(cluster.engine(0).storage().log().lowest_available(), 4);

    // A sixth request reaches everyone; seeing instance 5 tells
    // replica 2 how far behind it is.
    cluster.propose(0, request(1, 5, b"r5"));
    cluster.pump();

    for id in 0..3 {
        assert_eq!(cluster.engine(id).storage().first_uncommitted(), 6);
        assert_eq!(cluster.engine(id).executed_up_to(), 6);
        assert_eq!(cluster.state(id), b"r0r1r2r3r4r5");
    }
    // The gap predating the leader's log travelled as a snapshot.
    assert!(cluster.services[2].0.lock().installed_snapshots >= 1);
    assert_eq!(cluster.engine(2).storage().view(), 0);
}

#[test]
fn decisions_survive_crash_and_restart() {
    let mut cluster = Cluster::new(3, 3);
    cluster.propose(0, request(1, 1, b"a"));
    cluster.pump();
    cluster.propose(0, request(1, 2, b"b"));
    cluster.pump();

    let journal_before = cluster.journal(1);
    cluster.crash(1);
    cluster.restart(1);

    // The restarted replica replays the same decisions in the same
    // order and keeps its view.
    assert_eq!(cluster.journal(1), journal_before);
    assert_eq!(cluster.engine(1).executed_up_to(), 2);
    assert_eq!(cluster.state(1), b"ab");
    assert_eq!(cluster.engine(1).storage().view(), 0);
    assert_eq!(cluster.engine(1).reply_cache().reply(1), Some((2, &b"b"[..])));
}

#[test]
fn view_is_monotone_across_restart() {
    let mut cluster = Cluster::new(3, 3);
    cluster.propose(0, request(1, 1, b"x"));
    cluster.pump();

    cluster.crash(0);
    cluster.suspect(1);
    cluster.pump();
    assert_eq!(cluster.engine(1).storage().view(), 1);

    cluster.crash(1);
    cluster.restart(1);
    assert!(cluster.engine(1).storage().view() >= 1);
}

#[test]
fn duplicate_and_stale_messages_are_harmless() {
    let mut cluster = Cluster::new(3, 3);
    let r = request(1, 1, b"x");
    cluster.propose(0, r.clone());

    // Capture the first round of traffic and deliver it twice.
    let envelopes = cluster.outbox.drain();
    for envelope in envelopes.iter().cloned().chain(envelopes.iter().cloned()) {
        cluster.deliver(envelope);
    }
    cluster.pump();

    for id in 0..3 {
        assert_eq!(cluster.engine(id).storage().first_uncommitted(), 1);
        // Exactly one execution despite the duplicated traffic.
        assert_eq!(cluster.journal(id), vec![(0, r.id)]);
    }
}

#[test]
fn delivered_sequences_are_prefixes_of_each_other() {
    let mut cluster = Cluster::new(3, 3);
    for sequence in 0..4 {
        cluster.propose(0, request(1, sequence, format!("v{}", sequence).as_bytes()));
        // Replica 2 only hears half the traffic.
        if sequence % 2 == 0 {
            cluster.pump();
        } else {
            cluster.pump_where(|envelope| envelope.to != 2);
        }
    }

    let reference = cluster.journal(0);
    assert_eq!(reference.len(), 4);
    for id in 1..3 {
        let journal = cluster.journal(id);
        assert!(
            reference.starts_with(&journal),
            "replica {} executed {:?}, not a prefix of {:?}",
            id,
            journal,
            reference,
        );
    }
}
