//! # Summary
//!
//! The replica's ordered log of consensus instances. Each instance moves
//! through `Unknown -> Known -> Decided`; once decided its value never
//! changes again. The log keeps a dense range of ids and can be
//! truncated from below once a snapshot covers the prefix.

use std::collections::BTreeMap;

use crate::config::InstanceId;
use crate::config::ReplicaSet;
use crate::config::View;

/// State of one consensus instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogEntryState {
    /// Nothing is known about this instance beyond its id.
    Unknown,
    /// A value was accepted in some view but may still be superseded.
    Known,
    /// A majority accepted the value; it is final.
    Decided,
}

impl LogEntryState {
    pub fn ordinal(self) -> i32 {
        match self {
            LogEntryState::Unknown => 0,
            LogEntryState::Known => 1,
            LogEntryState::Decided => 2,
        }
    }

    pub fn from_ordinal(ordinal: i32) -> Option<Self> {
        match ordinal {
            0 => Some(LogEntryState::Unknown),
            1 => Some(LogEntryState::Known),
            2 => Some(LogEntryState::Decided),
            _ => None,
        }
    }
}

/// The wire and storage form of an instance: everything except the
/// transient accept tally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub view: View,
    pub state: LogEntryState,
    pub value: Option<Vec<u8>>,
}

/// One slot of the replicated log.
#[derive(Debug)]
pub struct ConsensusInstance {
    id: InstanceId,
    view: View,
    value: Option<Vec<u8>>,
    state: LogEntryState,
    /// Replicas that sent an Accept for `(id, view)`. Released once the
    /// instance is decided, so a decided instance cannot tally further.
    accepts: Option<ReplicaSet>,
}

impl ConsensusInstance {
    fn new(id: InstanceId) -> Self {
        ConsensusInstance {
            id,
            view: -1,
            value: None,
            state: LogEntryState::Unknown,
            accepts: Some(ReplicaSet::new()),
        }
    }

    fn decided(id: InstanceId, view: View, value: Vec<u8>) -> Self {
        ConsensusInstance {
            id,
            view,
            value: Some(value),
            state: LogEntryState::Decided,
            accepts: None,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn state(&self) -> LogEntryState {
        self.state
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Raises the view without touching the value. Accept tallies are
    /// only meaningful within one view, so they reset on a raise.
    pub fn set_view(&mut self, view: View) {
        assert!(self.view <= view, "cannot lower an instance view");
        if view > self.view {
            self.view = view;
            if let Some(accepts) = &mut self.accepts {
                accepts.clear();
            }
        }
    }

    /// Accepts `value` under `view`, following the accept-highest-view
    /// rule: an older view is ignored, the same view must carry the same
    /// value, a newer view overwrites.
    fn set_value(&mut self, view: View, value: &[u8]) {
        if view < self.view {
            return;
        }
        if self.state == LogEntryState::Decided {
            if self.value.as_deref() != Some(value) {
                panic!(
                    "[PROTOCOL ERROR]: conflicting value for decided instance {}",
                    self.id,
                );
            }
            return;
        }
        if view > self.view {
            self.set_view(view);
        } else {
            assert!(
                self.value.as_deref().map_or(true, |current| current == value),
                "different value for the same view in instance {}",
                self.id,
            );
        }
        if self.state == LogEntryState::Unknown {
            self.state = LogEntryState::Known;
        }
        self.value = Some(value.to_vec());
    }

    /// Seals the instance. The accept tally is dropped for good.
    fn set_decided(&mut self) {
        assert!(self.value.is_some(), "cannot decide an instance without a value");
        self.state = LogEntryState::Decided;
        self.accepts = None;
    }

    /// The accept tally, or `None` once decided.
    pub fn accepts_mut(&mut self) -> Option<&mut ReplicaSet> {
        self.accepts.as_mut()
    }

    pub fn accepts(&self) -> Option<&ReplicaSet> {
        self.accepts.as_ref()
    }

    pub fn record(&self) -> InstanceRecord {
        InstanceRecord {
            id: self.id,
            view: self.view,
            state: self.state,
            value: self.value.clone(),
        }
    }

    fn value_len(&self) -> usize {
        self.value.as_ref().map_or(0, Vec::len)
    }
}

impl std::fmt::Display for ConsensusInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "instance={} state={:?} view={}",
            self.id, self.state, self.view,
        )
    }
}

/// Dense, truncatable map of instance ids to instances. Ids in
/// `[lowest_available, next_id)` are present; everything below
/// `lowest_available` has been absorbed by a snapshot.
#[derive(Debug, Default)]
pub struct Log {
    instances: BTreeMap<InstanceId, ConsensusInstance>,
    next_id: InstanceId,
    lowest_available: InstanceId,
    /// Total value bytes held, maintained incrementally for the
    /// snapshot policy.
    value_bytes: usize,
}

impl Log {
    pub fn new() -> Self {
        Log::default()
    }

    /// Id that the next append will receive.
    pub fn next_id(&self) -> InstanceId {
        self.next_id
    }

    /// First id not yet discarded by a snapshot.
    pub fn lowest_available(&self) -> InstanceId {
        self.lowest_available
    }

    /// Value bytes currently held, excluding anything already snapshotted.
    pub fn byte_size(&self) -> usize {
        self.value_bytes
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instance(&self, id: InstanceId) -> Option<&ConsensusInstance> {
        self.instances.get(&id)
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> Option<&mut ConsensusInstance> {
        self.instances.get_mut(&id)
    }

    pub fn state(&self, id: InstanceId) -> Option<LogEntryState> {
        self.instances.get(&id).map(ConsensusInstance::state)
    }

    /// Appends a fresh `Known` instance at `next_id`.
    pub fn append(&mut self, view: View, value: Vec<u8>) -> InstanceId {
        let id = self.next_id;
        let mut instance = ConsensusInstance::new(id);
        instance.set_value(view, &value);
        self.value_bytes += instance.value_len();
        self.instances.insert(id, instance);
        self.next_id += 1;
        id
    }

    /// Makes sure `id` exists, allocating empty `Unknown` entries for
    /// any gap between the current tail and `id`.
    pub fn extend_to(&mut self, id: InstanceId) {
        while self.next_id <= id {
            self.instances
                .insert(self.next_id, ConsensusInstance::new(self.next_id));
            self.next_id += 1;
        }
    }

    /// Applies the accept-highest-view rule to `id`, allocating the
    /// instance (and any gap below it) first if needed. Returns `false`
    /// for ids already truncated away.
    pub fn set_value(&mut self, id: InstanceId, view: View, value: &[u8]) -> bool {
        if id < self.lowest_available {
            return false;
        }
        self.extend_to(id);
        let instance = self.instances.get_mut(&id).unwrap();
        let before = instance.value_len();
        instance.set_value(view, value);
        self.value_bytes = self.value_bytes + instance.value_len() - before;
        true
    }

    /// Seals `id`. The caller is responsible for having made the
    /// decision durable first.
    pub fn set_decided(&mut self, id: InstanceId) {
        self.instances
            .get_mut(&id)
            .expect("deciding an instance outside the log")
            .set_decided();
    }

    /// Inserts an already-decided instance, as recovered from stable
    /// storage or received through catch-up of a truncated peer.
    pub fn insert_decided(&mut self, id: InstanceId, view: View, value: Vec<u8>) {
        if id < self.lowest_available {
            return;
        }
        self.extend_to(id);
        let instance = self.instances.get_mut(&id).unwrap();
        let before = instance.value_len();
        *instance = ConsensusInstance::decided(id, view, value);
        self.value_bytes = self.value_bytes + instance.value_len() - before;
    }

    /// Discards every instance below `id`. Only called once the service
    /// has applied (or snapshot-skipped) the whole discarded prefix.
    pub fn truncate_below(&mut self, id: InstanceId) {
        let retained = self.instances.split_off(&id);
        let removed = std::mem::replace(&mut self.instances, retained);
        for instance in removed.values() {
            self.value_bytes -= instance.value_len();
        }
        self.lowest_available = self.lowest_available.max(id);
        self.next_id = self.next_id.max(id);
    }

    /// Instances with ids in `[from, to)`.
    pub fn range(
        &self,
        from: InstanceId,
        to: InstanceId,
    ) -> impl Iterator<Item = &ConsensusInstance> {
        self.instances.range(from..to).map(|(_, instance)| instance)
    }
}
