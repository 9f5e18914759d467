//! # Summary
//!
//! Ping-based leader oracle. The leader of the current view announces
//! itself with `Alive` once per `SEND_TIMEOUT`; a follower that hears
//! nothing at all from the leader for `SUSPECT_LEADER`, neither an
//! `Alive` nor any protocol message, reports the suspicion so a view change can
//! start. Suspicion timers carry a generation number, since a fire may
//! already be queued when fresh activity arrives.

use std::time::Instant;

use log::debug;
use log::info;
use log::warn;

use crate::config::Config;
use crate::config::ReplicaId;
use crate::config::View;
use crate::config::SEND_TIMEOUT;
use crate::config::SUSPECT_LEADER;
use crate::message::Body;
use crate::message::Message;
use crate::network::Network;
use crate::timer::TimerEvent;
use crate::timer::TimerId;
use crate::timer::TimerQueue;

/// Tracks which view has been announced and keeps the liveness timers
/// matching the local replica's role in it.
pub struct LeaderOracle {
    config: Config,

    /// Last announced view; -1 before the oracle starts.
    view: View,

    /// Heartbeat timer, armed while the local replica leads.
    alive_timer: Option<TimerId>,

    /// Suspicion timer, armed while somebody else leads.
    suspect_timer: Option<TimerId>,

    /// Invalidates suspicion fires that raced a reset.
    generation: u64,
}

impl LeaderOracle {
    pub fn new(config: Config) -> Self {
        LeaderOracle {
            config,
            view: -1,
            alive_timer: None,
            suspect_timer: None,
            generation: 0,
        }
    }

    pub fn leader(&self) -> ReplicaId {
        self.config.leader(self.view.max(0))
    }

    pub fn is_local_leader(&self) -> bool {
        self.view >= 0 && self.config.is_local_leader(self.view)
    }

    /// Announces `view`. Emits the new leader exactly once per view
    /// transition; a repeated or older view returns `None` and changes
    /// nothing.
    pub fn advance<N: Network>(
        &mut self,
        timers: &mut TimerQueue,
        now: Instant,
        network: &N,
        view: View,
    ) -> Option<ReplicaId> {
        if view <= self.view {
            return None;
        }
        self.view = view;
        let leader = self.config.leader(view);
        info!("new view {} with leader {}", view, leader);

        if let Some(timer) = self.alive_timer.take() {
            timers.cancel(timer);
        }
        if leader == self.config.id() {
            debug!("assuming leadership of view {}", view);
            if let Some(timer) = self.suspect_timer.take() {
                timers.cancel(timer);
            }
            self.send_alive(timers, now, network);
        } else {
            self.reset_suspicion(timers, now);
        }
        Some(leader)
    }

    /// Called for every message received from the current leader; any
    /// protocol traffic is as good as an `Alive`.
    pub fn on_leader_activity(&mut self, timers: &mut TimerQueue, now: Instant) {
        if !self.is_local_leader() {
            self.reset_suspicion(timers, now);
        }
    }

    /// Heartbeat fire. Stale fires after losing leadership are ignored.
    pub fn on_send_alive<N: Network>(
        &mut self,
        timers: &mut TimerQueue,
        now: Instant,
        network: &N,
    ) {
        if !self.is_local_leader() {
            return;
        }
        self.send_alive(timers, now, network);
    }

    /// Suspicion fire. Returns true when the suspicion is still
    /// current, meaning the caller should start a view change.
    pub fn on_suspect(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.is_local_leader() || self.view < 0 {
            return false;
        }
        warn!("suspecting leader {} of view {}", self.leader(), self.view);
        true
    }

    fn send_alive<N: Network>(&mut self, timers: &mut TimerQueue, now: Instant, network: &N) {
        network.send_to_all(&Message::new(self.view, Body::Alive));
        self.alive_timer = Some(timers.schedule(now, SEND_TIMEOUT, TimerEvent::SendAlive));
    }

    fn reset_suspicion(&mut self, timers: &mut TimerQueue, now: Instant) {
        if let Some(timer) = self.suspect_timer.take() {
            timers.cancel(timer);
        }
        self.generation += 1;
        self.suspect_timer = Some(timers.schedule(
            now,
            SUSPECT_LEADER,
            TimerEvent::SuspectLeader {
                generation: self.generation,
            },
        ));
    }
}
