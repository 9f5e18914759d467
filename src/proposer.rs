//! # Summary
//!
//! The proposer role: drives view changes with `Prepare`, re-owns
//! whatever the previous leaders left behind, and feeds client requests
//! through the batching-and-window pipeline as `Propose` messages.
//!
//! The proposer is `Inactive` on every replica that does not lead the
//! current view. A leader change moves it through `Preparing` (phase 1
//! against a majority) into `Prepared`, where proposing is allowed; the
//! next leader change drops it back to `Inactive`.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Instant;

use bytes::BufMut;
use log::debug;
use log::info;
use log::warn;

use crate::config::Config;
use crate::config::InstanceId;
use crate::config::ReplicaId;
use crate::config::ReplicaSet;
use crate::config::View;
use crate::storage::log::InstanceRecord;
use crate::storage::log::LogEntryState;
use crate::message::Body;
use crate::message::Message;
use crate::network::Network;
use crate::request::Request;
use crate::retransmitter::Retransmitter;
use crate::retransmitter::SlotId;
use crate::storage::Storage;
use crate::timer::TimerQueue;

/// Everything a proposer operation may touch, borrowed from the engine
/// for the duration of one call.
pub(crate) struct ProposerCtx<'a, N> {
    pub config: &'a Config,
    pub storage: &'a mut Storage,
    pub timers: &'a mut TimerQueue,
    pub retransmitter: &'a mut Retransmitter,
    pub network: &'a N,
    pub now: Instant,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ProposerState {
    /// Somebody else leads; proposals are refused.
    Inactive,
    /// Phase 1 in flight, collecting `PrepareOK`s.
    Preparing,
    /// Phase 1 done; the pipeline is open.
    Prepared,
}

pub(crate) struct Proposer {
    state: ProposerState,

    /// Requests admitted but not yet put into a batch.
    pending: VecDeque<Request>,

    /// Replicas that answered the current `Prepare`.
    prepared: ReplicaSet,

    /// Retransmission slot of the outstanding `Prepare`.
    prepare_slot: Option<SlotId>,

    /// Retransmission slot per in-flight `Propose`.
    propose_slots: HashMap<InstanceId, SlotId>,

    /// Upper bound of the last gap sweep; only moves forward.
    last_retransmitted: InstanceId,
}

impl Proposer {
    pub fn new() -> Self {
        Proposer {
            state: ProposerState::Inactive,
            pending: VecDeque::new(),
            prepared: ReplicaSet::new(),
            prepare_slot: None,
            propose_slots: HashMap::new(),
            last_retransmitted: 0,
        }
    }

    pub fn state(&self) -> ProposerState {
        self.state
    }

    /// View-0 bootstrap: a fresh group has nothing to prepare, so the
    /// first leader opens the pipeline directly.
    pub fn assume_initial_leadership(&mut self) {
        assert_eq!(self.state, ProposerState::Inactive);
        self.state = ProposerState::Prepared;
    }

    /// Starts the view change that makes the local replica leader:
    /// advances to the next view it leads (durably, before anything is
    /// sent) and starts retransmitting `Prepare` to the whole group,
    /// the local replica included; its own answer loops back like any
    /// other acceptor's.
    pub fn prepare_next_view<N: Network>(&mut self, ctx: &mut ProposerCtx<N>) -> View {
        assert_eq!(self.state, ProposerState::Inactive, "proposer is active");
        self.prepared.clear();
        self.state = ProposerState::Preparing;

        let view = ctx.config.next_view_led_by_self(ctx.storage.view());
        ctx.storage.set_view(view);
        info!("preparing view {}", view);

        let prepare = Message::new(
            view,
            Body::Prepare {
                first_uncommitted: ctx.storage.first_uncommitted(),
            },
        );
        self.prepare_slot = Some(ctx.retransmitter.start(
            ctx.timers,
            ctx.now,
            ctx.network,
            prepare,
            ctx.config.all_replicas(),
        ));
        view
    }

    /// Folds the instances reported by one `PrepareOK` into the local
    /// log. Returns the ids that are now known decided; the engine runs
    /// its decide path for them before counting the answer with
    /// [`note_prepared`].
    ///
    /// [`note_prepared`]: Proposer::note_prepared
    pub fn reconcile_prepared<N>(
        &mut self,
        ctx: &mut ProposerCtx<N>,
        prepared: &[InstanceRecord],
    ) -> Vec<InstanceId> {
        let mut decided = Vec::new();
        if self.state != ProposerState::Preparing {
            return decided;
        }
        for record in prepared {
            if ctx
                .storage
                .log()
                .instance(record.id)
                .map_or(false, |local| local.state() == LogEntryState::Decided)
            {
                continue;
            }
            let Some(value) = record.value.as_deref() else {
                continue;
            };
            match record.state {
                // The accept-highest-view rule arbitrates between what
                // we hold and what the answer carries.
                LogEntryState::Known => {
                    ctx.storage.log_mut().set_value(record.id, record.view, value);
                }
                LogEntryState::Decided => {
                    ctx.storage.log_mut().set_value(record.id, record.view, value);
                    decided.push(record.id);
                }
                LogEntryState::Unknown => {}
            }
        }
        decided
    }

    /// Counts one `PrepareOK`. On a majority the proposer leaves phase
    /// 1 and starts proposing.
    pub fn note_prepared<N: Network>(&mut self, ctx: &mut ProposerCtx<N>, sender: ReplicaId) {
        if self.state != ProposerState::Preparing {
            debug!("view already prepared, ignoring answer from {}", sender);
            return;
        }
        self.prepared.insert(sender);
        if let Some(slot) = self.prepare_slot {
            ctx.retransmitter.stop_destination(ctx.timers, slot, sender);
        }
        if ctx.config.is_majority(self.prepared.cardinality()) {
            self.stop_preparing_start_proposing(ctx);
        }
    }

    fn stop_preparing_start_proposing<N: Network>(&mut self, ctx: &mut ProposerCtx<N>) {
        if let Some(slot) = self.prepare_slot.take() {
            ctx.retransmitter.stop(ctx.timers, slot);
        }
        self.state = ProposerState::Prepared;
        let view = ctx.storage.view();
        info!("view {} prepared", view);

        // Every open instance below the tail must settle under the new
        // view: decided ones are done, known ones keep their locked
        // value, untouched ones are closed with a no-op.
        let first = ctx.storage.first_uncommitted();
        let next = ctx.storage.log().next_id();
        for id in first..next {
            match ctx.storage.log().state(id) {
                Some(LogEntryState::Decided) => {}
                Some(LogEntryState::Known) => {
                    info!("proposing locked value for instance {}", id);
                    ctx.storage
                        .log_mut()
                        .instance_mut(id)
                        .unwrap()
                        .set_view(view);
                    self.continue_proposal(ctx, id);
                }
                Some(LogEntryState::Unknown) => {
                    info!("no value locked for instance {}: proposing no-op", id);
                    self.fill_with_no_operation(ctx, id);
                }
                None => {}
            }
        }
        self.send_next_proposal(ctx);
    }

    fn fill_with_no_operation<N: Network>(&mut self, ctx: &mut ProposerCtx<N>, id: InstanceId) {
        let mut value = Vec::with_capacity(4 + Request::no_op().byte_size());
        value.put_i32(1);
        Request::no_op().write_to(&mut value);
        let view = ctx.storage.view();
        ctx.storage.log_mut().set_value(id, view, &value);
        self.continue_proposal(ctx, id);
    }

    /// Restarts the `Propose` for an instance inherited from an earlier
    /// view. Goes to the whole group: the local acceptor's loopback
    /// accept replaces the tally lost in the view bump.
    fn continue_proposal<N: Network>(&mut self, ctx: &mut ProposerCtx<N>, id: InstanceId) {
        assert_eq!(self.state, ProposerState::Prepared);
        assert!(
            !self.propose_slots.contains_key(&id),
            "different proposal for the same instance",
        );
        let record = ctx.storage.log().instance(id).unwrap().record();
        let message = Message::new(ctx.storage.view(), Body::Propose { instance: record });
        let slot = ctx.retransmitter.start(
            ctx.timers,
            ctx.now,
            ctx.network,
            message,
            ctx.config.all_replicas(),
        );
        self.propose_slots.insert(id, slot);
    }

    /// Admits one client request into the pipeline. Refused while
    /// `Inactive`; duplicates of a queued request are dropped.
    pub fn propose<N: Network>(&mut self, ctx: &mut ProposerCtx<N>, request: Request) {
        if self.state == ProposerState::Inactive {
            warn!("cannot propose while inactive, dropping {}", request.id);
            return;
        }
        if self.pending.contains(&request) {
            warn!("request {} already queued, dropping", request.id);
            return;
        }
        self.pending.push_back(request);
        self.send_next_proposal(ctx);
    }

    /// A decision freed a window slot; try to fill it again.
    pub fn ballot_finished<N: Network>(&mut self, ctx: &mut ProposerCtx<N>) {
        if self.state != ProposerState::Prepared {
            return;
        }
        self.send_next_proposal(ctx);
    }

    fn send_next_proposal<N: Network>(&mut self, ctx: &mut ProposerCtx<N>) {
        if self.state != ProposerState::Prepared {
            return;
        }
        if self.pending.is_empty() || !ctx.storage.is_in_window(ctx.storage.log().next_id()) {
            // Requests are waiting but no slot is free; nudge the
            // undecided instances blocking the window instead.
            self.retransmit_gaps(ctx);
            return;
        }
        assert!(self.prepare_slot.is_none(), "prepare round unfinished");

        let first = self.pending.pop_front().unwrap();
        let size = ctx.config.batch_size().max(4 + first.byte_size());
        let mut value = Vec::with_capacity(size);
        value.put_i32(0); // patched with the final count below
        let mut count: i32 = 1;
        let mut ids = first.id.to_string();
        first.write_to(&mut value);

        while let Some(next) = self.pending.front() {
            if next.byte_size() > size - value.len() {
                break;
            }
            let next = self.pending.pop_front().unwrap();
            ids.push(',');
            ids.push_str(&next.id.to_string());
            next.write_to(&mut value);
            count += 1;
        }
        value[0..4].copy_from_slice(&count.to_be_bytes());

        let view = ctx.storage.view();
        let total = value.len();
        let id = ctx.storage.log_mut().append(view, value);
        assert!(
            !self.propose_slots.contains_key(&id),
            "different proposal for the same instance",
        );
        info!("proposing instance {}, ids={}, size={}", id, ids, total);

        // The local replica accepts its own proposal on the spot, so
        // the message only goes to the others.
        let entry = ctx.storage.log_mut().instance_mut(id).unwrap();
        entry.accepts_mut().unwrap().insert(ctx.config.id());
        let record = entry.record();
        let message = Message::new(view, Body::Propose { instance: record });
        let slot = ctx.retransmitter.start(
            ctx.timers,
            ctx.now,
            ctx.network,
            message,
            ctx.config.others(),
        );
        self.propose_slots.insert(id, slot);
    }

    /// Forces an extra retransmission for every undecided instance the
    /// window is stuck behind. Each sweep starts where the previous one
    /// ended, so a given instance is nudged once per sweep bound.
    fn retransmit_gaps<N: Network>(&mut self, ctx: &mut ProposerCtx<N>) {
        let next = ctx.storage.log().next_id();
        self.last_retransmitted = self.last_retransmitted.max(ctx.storage.first_uncommitted());
        for id in self.last_retransmitted..next {
            if ctx.storage.log().state(id) == Some(LogEntryState::Decided) {
                continue;
            }
            if let Some(slot) = self.propose_slots.get(&id) {
                ctx.retransmitter.force(ctx.network, *slot);
            }
        }
        self.last_retransmitted = self.last_retransmitted.max(next);
    }

    /// A majority accepted `id`; its `Propose` no longer needs to flow.
    pub fn stop_propose(
        &mut self,
        timers: &mut TimerQueue,
        retransmitter: &mut Retransmitter,
        id: InstanceId,
    ) {
        if let Some(slot) = self.propose_slots.remove(&id) {
            retransmitter.stop(timers, slot);
        }
    }

    /// `destination` accepted `id`; spare it further copies.
    pub fn stop_propose_to(
        &mut self,
        timers: &mut TimerQueue,
        retransmitter: &mut Retransmitter,
        id: InstanceId,
        destination: ReplicaId,
    ) {
        if let Some(slot) = self.propose_slots.get(&id) {
            retransmitter.stop_destination(timers, *slot, destination);
            if !retransmitter.is_active(*slot) {
                self.propose_slots.remove(&id);
            }
        }
    }

    /// Leadership is gone: drop the queue and silence every
    /// retransmission, prepare and proposes alike.
    pub fn stop_proposer(&mut self, timers: &mut TimerQueue, retransmitter: &mut Retransmitter) {
        self.state = ProposerState::Inactive;
        self.pending.clear();
        if let Some(slot) = self.prepare_slot.take() {
            retransmitter.stop(timers, slot);
        }
        // Prepare and propose slots are the only transmissions alive.
        retransmitter.stop_all(timers);
        self.propose_slots.clear();
    }
}
