//! # Summary
//!
//! The catch-up subprotocol. A replica that holds undecided instances
//! below what the group has moved past asks a peer for the missing
//! decided values; a peer whose log no longer reaches back far enough
//! answers with its snapshot instead. Queries are retried on a
//! self-adjusting timeout and the whole check also runs periodically,
//! so a replica that missed every hint still converges.

use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::info;
use rand::Rng;

use crate::config::Config;
use crate::config::InstanceId;
use crate::config::ReplicaId;
use crate::config::CATCHUP_MIN_RESEND_TIMEOUT;
use crate::config::PERIODIC_CATCHUP_TIMEOUT;
use crate::storage::log::InstanceRecord;
use crate::storage::log::LogEntryState;
use crate::message::Body;
use crate::message::Message;
use crate::network::Network;
use crate::storage::Storage;
use crate::timer::TimerEvent;
use crate::timer::TimerQueue;

pub(crate) struct CatchUp {
    /// Current query resend timeout; doubles while queries go
    /// unanswered, shrinks when answers come back.
    resend_timeout: Duration,

    /// Invalidates resend fires for superseded queries.
    generation: u64,

    /// Whether a query is in flight.
    outstanding: bool,

    /// Lowest id the group is known to have decided everything below.
    horizon: InstanceId,
}

impl CatchUp {
    pub fn new() -> Self {
        CatchUp {
            resend_timeout: CATCHUP_MIN_RESEND_TIMEOUT,
            generation: 0,
            outstanding: false,
            horizon: 0,
        }
    }

    pub fn start(&mut self, timers: &mut TimerQueue, now: Instant) {
        timers.schedule(now, PERIODIC_CATCHUP_TIMEOUT, TimerEvent::CatchUpPeriodic);
    }

    /// Feeds evidence of group progress, e.g. the `firstUncommitted` a
    /// leader put into its `Prepare`.
    pub fn note_progress(&mut self, first_uncommitted: InstanceId) {
        self.horizon = self.horizon.max(first_uncommitted);
    }

    /// Whether the local log is behind: an open instance below the
    /// decided horizon, or a tail further out than the proposal window
    /// reaches.
    pub fn is_lagging(&self, config: &Config, storage: &Storage) -> bool {
        let first = storage.first_uncommitted();
        first < self.horizon || storage.log().next_id() > first + config.window_size()
    }

    /// Starts a query unless one is already in flight.
    pub fn maybe_query<N: Network>(
        &mut self,
        config: &Config,
        storage: &Storage,
        timers: &mut TimerQueue,
        network: &N,
        now: Instant,
    ) {
        if self.outstanding {
            return;
        }
        self.send_query(config, storage, timers, network, now, false);
    }

    /// Periodic fire: re-arms itself and queries when behind.
    pub fn on_periodic<N: Network>(
        &mut self,
        config: &Config,
        storage: &Storage,
        timers: &mut TimerQueue,
        network: &N,
        now: Instant,
        is_leader: bool,
    ) {
        timers.schedule(now, PERIODIC_CATCHUP_TIMEOUT, TimerEvent::CatchUpPeriodic);
        // The periodic query goes out even without a suspected gap: a
        // replica can be behind without any local evidence, e.g. when
        // the accepts that would have told it were all lost.
        if !is_leader && !self.outstanding {
            self.send_query(config, storage, timers, network, now, false);
        }
    }

    /// Resend fire for an unanswered query.
    pub fn on_resend<N: Network>(
        &mut self,
        config: &Config,
        storage: &Storage,
        timers: &mut TimerQueue,
        network: &N,
        now: Instant,
        generation: u64,
    ) {
        if generation != self.generation || !self.outstanding {
            return;
        }
        self.outstanding = false;
        if self.is_lagging(config, storage) {
            self.send_query(config, storage, timers, network, now, true);
        }
    }

    fn send_query<N: Network>(
        &mut self,
        config: &Config,
        storage: &Storage,
        timers: &mut TimerQueue,
        network: &N,
        now: Instant,
        retry: bool,
    ) {
        let (ranges, mut ids) = self.build_query(storage);
        if ranges.is_empty() && ids.is_empty() {
            // Nothing known to be missing; probe for the next id so a
            // silent gap still surfaces through the answer.
            ids.push(storage.first_uncommitted());
        }

        // First try goes to the leader, the likeliest to have decided
        // everything; retries spread over the rest of the group.
        let leader = config.leader(storage.view());
        let target = if !retry && leader != config.id() {
            leader
        } else {
            random_other(config)
        };
        debug!(
            "querying {} for {} ranges and {} ids",
            target,
            ranges.len(),
            ids.len(),
        );
        network.send_to(
            target,
            &Message::new(storage.view(), Body::CatchUpQuery { ranges, ids }),
        );

        self.generation += 1;
        self.outstanding = true;
        timers.schedule(
            now,
            self.resend_timeout,
            TimerEvent::CatchUpResend {
                generation: self.generation,
            },
        );
        self.resend_timeout = (self.resend_timeout * 2).min(PERIODIC_CATCHUP_TIMEOUT);
    }

    /// Lists what is missing: runs of undecided ids as half-open
    /// ranges, isolated ones individually, and the whole stretch from
    /// the local tail to the horizon.
    fn build_query(&self, storage: &Storage) -> (Vec<(InstanceId, InstanceId)>, Vec<InstanceId>) {
        let mut ranges = Vec::new();
        let mut ids = Vec::new();
        let next = storage.log().next_id();

        let mut run: Option<(InstanceId, InstanceId)> = None;
        for id in storage.first_uncommitted()..next {
            if storage.log().state(id) == Some(LogEntryState::Decided) {
                continue;
            }
            match &mut run {
                Some((_, end)) if *end == id => *end = id + 1,
                Some(done) => {
                    push_run(*done, &mut ranges, &mut ids);
                    run = Some((id, id + 1));
                }
                None => run = Some((id, id + 1)),
            }
        }
        if let Some(done) = run {
            push_run(done, &mut ranges, &mut ids);
        }
        if self.horizon > next {
            push_run((next, self.horizon), &mut ranges, &mut ids);
        }
        (ranges, ids)
    }

    /// Installs the decided instances of a response into the log and
    /// returns their ids for the engine's decide path.
    pub fn on_response(
        &mut self,
        storage: &mut Storage,
        decided: &[InstanceRecord],
    ) -> Vec<InstanceId> {
        self.note_answered();
        let mut newly_known = Vec::new();
        for record in decided {
            if record.state != LogEntryState::Decided {
                continue;
            }
            let Some(value) = record.value.as_deref() else {
                continue;
            };
            self.horizon = self.horizon.max(record.id + 1);
            if storage
                .log()
                .instance(record.id)
                .map_or(false, |local| local.state() == LogEntryState::Decided)
            {
                continue;
            }
            if storage.log_mut().set_value(record.id, record.view, value) {
                newly_known.push(record.id);
            }
        }
        if !newly_known.is_empty() {
            info!("caught up {} decided instances", newly_known.len());
        }
        newly_known
    }

    /// A response or snapshot arrived: the outstanding query is done
    /// and the resend timeout relaxes towards its floor.
    pub fn note_answered(&mut self) {
        self.outstanding = false;
        self.resend_timeout = (self.resend_timeout / 2).max(CATCHUP_MIN_RESEND_TIMEOUT);
    }

    /// Answers a peer's query with decided instances, or with the
    /// snapshot when the request reaches below the local log.
    pub fn on_query<N: Network>(
        &self,
        config: &Config,
        storage: &Storage,
        network: &N,
        sender: ReplicaId,
        ranges: &[(InstanceId, InstanceId)],
        ids: &[InstanceId],
    ) {
        let mut requested: Vec<InstanceId> = ids.to_vec();
        // Ranges are clamped to the local tail; nothing above it could
        // be answered anyway.
        let next = storage.log().next_id();
        for (begin, end) in ranges {
            requested.extend(*begin..(*end).min(next));
        }
        requested.sort_unstable();
        requested.dedup();

        let lowest = storage.log().lowest_available();
        if requested.iter().any(|id| *id < lowest) {
            if let Some(snapshot) = storage.last_snapshot() {
                info!("gap of {} predates the log, answering with snapshot", sender);
                network.send_to(
                    sender,
                    &Message::new(
                        storage.view(),
                        Body::CatchUpSnapshot {
                            snapshot: snapshot.clone(),
                        },
                    ),
                );
                return;
            }
        }

        let mut decided = Vec::new();
        let mut budget = config.max_udp_packet_size();
        for id in requested {
            let Some(instance) = storage.log().instance(id) else {
                continue;
            };
            if instance.state() != LogEntryState::Decided {
                continue;
            }
            let record = instance.record();
            let size = 16 + record.value.as_ref().map_or(0, Vec::len);
            if !decided.is_empty() && size > budget {
                // The rest travels on the peer's next query.
                break;
            }
            budget = budget.saturating_sub(size);
            decided.push(record);
        }
        if decided.is_empty() {
            return;
        }
        network.send_to(
            sender,
            &Message::new(storage.view(), Body::CatchUpResponse { decided }),
        );
    }
}

fn push_run(
    run: (InstanceId, InstanceId),
    ranges: &mut Vec<(InstanceId, InstanceId)>,
    ids: &mut Vec<InstanceId>,
) {
    let (begin, end) = run;
    if end == begin + 1 {
        ids.push(begin);
    } else {
        ranges.push(run);
    }
}

fn random_other(config: &Config) -> ReplicaId {
    let mut rng = rand::thread_rng();
    loop {
        let candidate = rng.gen_range(0..config.count());
        if candidate != config.id() || config.count() == 1 {
            return candidate;
        }
    }
}
