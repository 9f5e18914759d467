//! # Summary
//!
//! The engine owns every piece of protocol state (log, storage, the
//! three roles, the oracle, the retransmitter, the timers) and is the
//! only place where they meet. All notifications between components are
//! routed through engine methods, so the component graph stays a tree
//! with the engine at its root. Every method here runs on the
//! dispatcher; nothing in this module is thread-safe and nothing needs
//! to be.

use std::time::Instant;

use log::debug;
use log::info;
use log::trace;
use log::warn;

use crate::acceptor::Acceptor;
use crate::catchup::CatchUp;
use crate::config::Config;
use crate::config::InstanceId;
use crate::config::View;
use crate::dispatcher::Event;
use crate::learner::Learner;
use crate::storage::log::LogEntryState;
use crate::message::Body;
use crate::message::Message;
use crate::network::Network;
use crate::oracle::LeaderOracle;
use crate::proposer::Proposer;
use crate::proposer::ProposerCtx;
use crate::proposer::ProposerState;
use crate::request::unbatch;
use crate::retransmitter::Retransmitter;
use crate::service::Service;
use crate::snapshot::ReplyCache;
use crate::snapshot::Snapshot;
use crate::snapshot::SnapshotPolicy;
use crate::storage::StableStore;
use crate::storage::Storage;
use crate::timer::TimerEvent;
use crate::timer::TimerQueue;

macro_rules! proposer_ctx {
    ($engine:expr, $now:expr) => {
        ProposerCtx {
            config: &$engine.config,
            storage: &mut $engine.storage,
            timers: &mut $engine.timers,
            retransmitter: &mut $engine.retransmitter,
            network: &$engine.network,
            now: $now,
        }
    };
}

/// One replica's whole protocol state.
pub struct Engine<N: Network, S: Service> {
    config: Config,
    storage: Storage,
    timers: TimerQueue,
    retransmitter: Retransmitter,
    oracle: LeaderOracle,
    proposer: Proposer,
    acceptor: Acceptor,
    learner: Learner,
    catchup: CatchUp,
    policy: SnapshotPolicy,
    reply_cache: ReplyCache,

    /// Next instance to hand to the service; always at most
    /// `first_uncommitted`.
    next_to_execute: InstanceId,

    network: N,
    service: S,
}

impl<N: Network, S: Service> Engine<N, S> {
    /// Recovers the replica from stable storage: the durable view is
    /// restored, the snapshot (if any) is pushed back into the service,
    /// and the decided prefix above it is re-executed.
    pub fn new(config: Config, network: N, service: S, stable: Box<dyn StableStore>) -> Self {
        let storage = Storage::recover(config, stable);
        let mut engine = Engine {
            config,
            storage,
            timers: TimerQueue::new(),
            retransmitter: Retransmitter::new(),
            oracle: LeaderOracle::new(config),
            proposer: Proposer::new(),
            acceptor: Acceptor,
            learner: Learner,
            catchup: CatchUp::new(),
            policy: SnapshotPolicy::new(),
            reply_cache: ReplyCache::new(),
            next_to_execute: 0,
            network,
            service,
        };
        if let Some(snapshot) = engine.storage.last_snapshot().cloned() {
            engine.service.update_to_snapshot(&snapshot.service_state);
            engine.reply_cache.restore(&snapshot.reply_cache);
            engine.next_to_execute = snapshot.next_instance_id();
            engine.policy.note_snapshot(snapshot.byte_size());
        }
        engine.execute_ready();
        engine
    }

    /// Arms the liveness machinery. Called once, before the first event.
    ///
    /// A completely fresh group skips the prepare round for view 0:
    /// there is nothing to prepare, so replica 0 opens its pipeline
    /// directly. A replica that merely recovered into a view it leads
    /// takes a fresh view through the full prepare round instead.
    pub fn start(&mut self, now: Instant) {
        self.catchup.start(&mut self.timers, now);
        let view = self.storage.view();
        let fresh =
            view == 0 && self.storage.log().is_empty() && self.storage.last_snapshot().is_none();
        if self.config.is_local_leader(view) && fresh {
            self.oracle.advance(&mut self.timers, now, &self.network, view);
            self.proposer.assume_initial_leadership();
        } else if self.config.is_local_leader(view) {
            self.start_view_change(now);
        } else {
            self.oracle.advance(&mut self.timers, now, &self.network, view);
        }
    }

    pub fn handle(&mut self, now: Instant, event: Event) {
        match event {
            Event::Receive { sender, message } => self.on_message(now, sender, message),
            Event::Propose(request) => {
                self.proposer.propose(&mut proposer_ctx!(self, now), request);
                self.sweep_decidable(now);
            }
            Event::Snapshot(snapshot) => self.on_service_snapshot(snapshot),
        }
    }

    /// Fires every due timer.
    pub fn on_time(&mut self, now: Instant) {
        while let Some(event) = self.timers.pop_due(now) {
            self.on_timer(now, event);
        }
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn reply_cache(&self) -> &ReplyCache {
        &self.reply_cache
    }

    /// Id of the first instance the service has not executed yet.
    pub fn executed_up_to(&self) -> InstanceId {
        self.next_to_execute
    }

    fn on_timer(&mut self, now: Instant, event: TimerEvent) {
        match event {
            TimerEvent::Retransmit { slot } => {
                self.retransmitter
                    .on_timer(&mut self.timers, now, &self.network, slot);
            }
            TimerEvent::SendAlive => {
                self.oracle.on_send_alive(&mut self.timers, now, &self.network);
            }
            TimerEvent::SuspectLeader { generation } => {
                if self.oracle.on_suspect(generation) {
                    self.start_view_change(now);
                }
            }
            TimerEvent::CatchUpResend { generation } => {
                self.catchup.on_resend(
                    &self.config,
                    &self.storage,
                    &mut self.timers,
                    &self.network,
                    now,
                    generation,
                );
            }
            TimerEvent::CatchUpPeriodic => {
                let is_leader = self.config.is_local_leader(self.storage.view());
                self.catchup.on_periodic(
                    &self.config,
                    &self.storage,
                    &mut self.timers,
                    &self.network,
                    now,
                    is_leader,
                );
            }
        }
    }

    fn on_message(&mut self, now: Instant, sender: usize, message: Message) {
        trace!("received {} from {}", message, sender);
        let Message { view, body, .. } = message;

        // Catch-up traffic carries decided data and crosses views
        // freely; everything else obeys the view gate.
        let view_gated = !matches!(
            body,
            Body::CatchUpQuery { .. } | Body::CatchUpResponse { .. } | Body::CatchUpSnapshot { .. },
        );
        if view_gated && view < self.storage.view() {
            debug!(
                "dropping message from {} at view {} (local view {})",
                sender,
                view,
                self.storage.view(),
            );
            return;
        }
        if view > self.storage.view() {
            self.advance_view(now, view);
        }
        if sender != self.config.id() && sender == self.config.leader(self.storage.view()) {
            self.oracle.on_leader_activity(&mut self.timers, now);
        }

        match body {
            Body::Prepare { first_uncommitted } => {
                if view != self.storage.view() {
                    return;
                }
                self.catchup.note_progress(first_uncommitted);
                self.acceptor.on_prepare(
                    &mut self.storage,
                    &self.network,
                    sender,
                    view,
                    first_uncommitted,
                );
            }
            Body::PrepareOk { prepared } => {
                if view != self.storage.view() {
                    return;
                }
                let decided =
                    self.proposer
                        .reconcile_prepared(&mut proposer_ctx!(self, now), &prepared);
                for id in decided {
                    self.decide(now, id);
                }
                self.proposer.note_prepared(&mut proposer_ctx!(self, now), sender);
                self.sweep_decidable(now);
            }
            Body::Propose { instance } => {
                if let Some(id) =
                    self.acceptor
                        .on_propose(&self.config, &mut self.storage, &self.network, &instance)
                {
                    if self.learner.is_decidable(&self.config, &self.storage, id) {
                        self.decide(now, id);
                    }
                }
                self.maybe_catch_up(now);
            }
            Body::Accept { instance_id } => {
                if self
                    .learner
                    .on_accept(&self.config, &mut self.storage, sender, view, instance_id)
                {
                    self.decide(now, instance_id);
                }
                // Whatever happened above, the sender holds this
                // instance now and needs no further copies.
                self.proposer.stop_propose_to(
                    &mut self.timers,
                    &mut self.retransmitter,
                    instance_id,
                    sender,
                );
                self.maybe_catch_up(now);
            }
            Body::Alive => {}
            Body::CatchUpQuery { ranges, ids } => {
                self.catchup.on_query(
                    &self.config,
                    &self.storage,
                    &self.network,
                    sender,
                    &ranges,
                    &ids,
                );
            }
            Body::CatchUpResponse { decided } => {
                let caught_up = self.catchup.on_response(&mut self.storage, &decided);
                for id in caught_up {
                    self.decide(now, id);
                }
                // One answer may not have carried everything; keep
                // querying until the gap is closed.
                self.maybe_catch_up(now);
            }
            Body::CatchUpSnapshot { snapshot } => {
                self.install_remote_snapshot(now, snapshot);
            }
        }
    }

    /// A higher view was observed. The new view is made durable before
    /// anything referring to it can be sent; a leading proposer loses
    /// its pipeline on the spot.
    fn advance_view(&mut self, now: Instant, view: View) {
        info!("observed view {} above local {}", view, self.storage.view());
        self.storage.set_view(view);
        if self.proposer.state() != ProposerState::Inactive {
            self.proposer
                .stop_proposer(&mut self.timers, &mut self.retransmitter);
        }
        if self.config.is_local_leader(view) {
            // A view this replica leads but never prepared is not worth
            // keeping; claim the following one properly.
            self.start_view_change(now);
        } else {
            self.oracle.advance(&mut self.timers, now, &self.network, view);
        }
    }

    fn start_view_change(&mut self, now: Instant) {
        if self.proposer.state() != ProposerState::Inactive {
            return;
        }
        let view = self.proposer.prepare_next_view(&mut proposer_ctx!(self, now));
        self.oracle.advance(&mut self.timers, now, &self.network, view);
    }

    fn maybe_catch_up(&mut self, now: Instant) {
        if self.config.is_local_leader(self.storage.view()) {
            return;
        }
        if self.catchup.is_lagging(&self.config, &self.storage) {
            self.catchup.maybe_query(
                &self.config,
                &self.storage,
                &mut self.timers,
                &self.network,
                now,
            );
        }
    }

    /// Decides whatever already has a majority in the open window.
    /// Matters when the local accept was the last missing one, e.g. in
    /// a group of one.
    fn sweep_decidable(&mut self, now: Instant) {
        let first = self.storage.first_uncommitted();
        let end = self
            .storage
            .log()
            .next_id()
            .min(first + self.config.window_size());
        for id in first..end {
            if self.learner.is_decidable(&self.config, &self.storage, id) {
                self.decide(now, id);
            }
        }
    }

    /// The decide path: durable record first, then the in-memory seal,
    /// then execution of whatever became contiguous.
    fn decide(&mut self, now: Instant, id: InstanceId) {
        let Some(instance) = self.storage.log().instance(id) else {
            return;
        };
        if instance.state() == LogEntryState::Decided || instance.value().is_none() {
            return;
        }
        debug!("deciding instance {}", id);
        self.storage.mark_decided(id);
        // A decided id is proof the group got this far; an open entry
        // below it marks the local replica as lagging.
        self.catchup.note_progress(id + 1);
        self.proposer
            .stop_propose(&mut self.timers, &mut self.retransmitter, id);
        self.execute_ready();
        self.maybe_snapshot();
        self.proposer.ballot_finished(&mut proposer_ctx!(self, now));
    }

    /// Hands every newly contiguous decided instance to the service, in
    /// ascending order. No-op fills are skipped but still reported via
    /// `instance_executed`.
    fn execute_ready(&mut self) {
        while self.next_to_execute < self.storage.first_uncommitted() {
            let id = self.next_to_execute;
            let value = self
                .storage
                .log()
                .instance(id)
                .expect("decided instance missing from log")
                .value()
                .expect("decided instance without value")
                .to_vec();
            let requests = match unbatch(&value) {
                Ok(requests) => requests,
                Err(error) => panic!(
                    "[PROTOCOL ERROR]: undecodable decided value for instance {}: {}",
                    id, error,
                ),
            };
            for request in &requests {
                if request.is_no_op() {
                    continue;
                }
                let reply = self.service.execute(id, request);
                self.reply_cache
                    .record(request.id.client_id, request.id.sequence, reply);
            }
            self.service.instance_executed(id);
            self.next_to_execute += 1;
        }
    }

    /// Asks the service for a checkpoint once the log outgrows the
    /// snapshot-relative thresholds.
    fn maybe_snapshot(&mut self) {
        if self.next_to_execute == 0 {
            return;
        }
        let log_bytes = self.storage.log().byte_size();
        if !self.policy.should_ask(log_bytes) {
            return;
        }
        let force = self.policy.must_force(log_bytes);
        let state = self.service.make_snapshot();
        if state.is_empty() && !force {
            // The adapter deferred; it will push a snapshot through the
            // dispatcher queue when ready.
            return;
        }
        let snapshot = Snapshot {
            last_included: self.next_to_execute - 1,
            view: self.storage.view(),
            service_state: state,
            reply_cache: self.reply_cache.entries(),
        };
        info!("taking snapshot up to instance {}", snapshot.last_included);
        self.install_local_snapshot(snapshot);
    }

    /// A checkpoint pushed by the service adapter itself.
    fn on_service_snapshot(&mut self, snapshot: Snapshot) {
        if snapshot.next_instance_id() > self.next_to_execute {
            warn!("service offered a snapshot beyond its executed prefix, ignoring");
            return;
        }
        if snapshot.next_instance_id() <= self.storage.log().lowest_available() {
            return;
        }
        self.install_local_snapshot(snapshot);
    }

    fn install_local_snapshot(&mut self, snapshot: Snapshot) {
        self.policy.note_snapshot(snapshot.byte_size());
        self.storage.install_snapshot(snapshot);
    }

    /// A peer answered catch-up with a whole snapshot: replace the
    /// service state and fast-forward past everything it covers.
    fn install_remote_snapshot(&mut self, now: Instant, snapshot: Snapshot) {
        self.catchup.note_answered();
        self.catchup.note_progress(snapshot.next_instance_id());
        if snapshot.next_instance_id() <= self.storage.first_uncommitted() {
            debug!(
                "snapshot up to {} is behind first uncommitted, ignoring",
                snapshot.last_included,
            );
            return;
        }
        info!("installing snapshot up to instance {}", snapshot.last_included);
        if snapshot.view > self.storage.view() && self.proposer.state() != ProposerState::Inactive {
            self.proposer
                .stop_proposer(&mut self.timers, &mut self.retransmitter);
        }
        let view_before = self.storage.view();
        self.service.update_to_snapshot(&snapshot.service_state);
        self.reply_cache.restore(&snapshot.reply_cache);
        self.next_to_execute = snapshot.next_instance_id();
        self.policy.note_snapshot(snapshot.byte_size());
        self.storage.install_snapshot(snapshot);
        if self.storage.view() > view_before {
            let view = self.storage.view();
            if self.config.is_local_leader(view) {
                self.start_view_change(now);
            } else {
                self.oracle.advance(&mut self.timers, now, &self.network, view);
            }
        }
        self.execute_ready();
        // The snapshot may stop short of the decided horizon; fetch the
        // rest through the log path.
        self.maybe_catch_up(now);
    }
}
