//! # Summary
//!
//! This module describes the static process group: how many replicas
//! exist, which one we are, and the tunables of the proposal pipeline.
//! A `Config` is immutable once the engine is constructed; there is no
//! process-global configuration.

use std::time::Duration;

/// Index of a replica within the group, in `0..count`.
pub type ReplicaId = usize;

/// View (epoch) number. The leader of view `v` is replica `v mod N`.
/// Views only ever grow. `-1` marks "no view yet" on log entries.
pub type View = i32;

/// Identifier of one consensus instance (one slot of the ordered log).
pub type InstanceId = u32;

/// Interval at which unacknowledged messages are re-offered to the network.
pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Interval at which the leader announces itself with `Alive`.
pub const SEND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Silence from the leader tolerated before a follower starts a view change.
pub const SUSPECT_LEADER: Duration = Duration::from_millis(2000);

/// Lower bound of the self-adjusting catch-up resend timeout.
pub const CATCHUP_MIN_RESEND_TIMEOUT: Duration = Duration::from_millis(50);

/// Upper bound of the catch-up resend timeout, and the period of the
/// unconditional catch-up check.
pub const PERIODIC_CATCHUP_TIMEOUT: Duration = Duration::from_millis(2000);

/// Minimum size of the log before a snapshot is requested at all.
pub const SNAPSHOT_MIN_LOG_SIZE: usize = 20 * 1024 * 1024;

/// log/snapshot ratio above which the service is asked for a snapshot.
pub const SNAPSHOT_ASK_RATIO: f64 = 1.0;

/// log/snapshot ratio above which a snapshot is forced.
pub const SNAPSHOT_FORCE_RATIO: f64 = 2.0;

/// Snapshot size assumed before the first snapshot ever exists.
pub const FIRST_SNAPSHOT_SIZE_ESTIMATE: usize = 1024;

const DEFAULT_WINDOW_SIZE: u32 = 1;

// 1500 ethernet payload - 20 IPv4 header - 8 UDP header.
const DEFAULT_MAX_UDP_PACKET_SIZE: usize = 1472;

const DEFAULT_BUSY_THRESHOLD: usize = 10 * 1024;

/// Immutable description of one replica's place in the group.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// Unique replica ID
    id: ReplicaId,

    /// Total number of replicas
    count: usize,

    /// Maximum number of concurrently proposed instances
    window_size: u32,

    /// Largest message the wire layer will carry in one datagram
    max_udp_packet_size: usize,

    /// Target size of one batched proposal
    batch_size: usize,

    /// Dispatcher queue depth beyond which client proposals are refused
    busy_threshold: usize,
}

impl Config {
    pub fn new(id: ReplicaId, count: usize) -> Self {
        assert!(count > 0 && id < count, "replica id out of range");
        Config {
            id,
            count,
            window_size: DEFAULT_WINDOW_SIZE,
            max_udp_packet_size: DEFAULT_MAX_UDP_PACKET_SIZE,
            batch_size: DEFAULT_MAX_UDP_PACKET_SIZE,
            busy_threshold: DEFAULT_BUSY_THRESHOLD,
        }
    }

    pub fn with_window_size(mut self, window_size: u32) -> Self {
        assert!(window_size > 0, "window size must be positive");
        self.window_size = window_size;
        self
    }

    pub fn with_max_udp_packet_size(mut self, size: usize) -> Self {
        self.max_udp_packet_size = size;
        self.batch_size = size;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_busy_threshold(mut self, threshold: usize) -> Self {
        self.busy_threshold = threshold;
        self
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    pub fn max_udp_packet_size(&self) -> usize {
        self.max_udp_packet_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn busy_threshold(&self) -> usize {
        self.busy_threshold
    }

    /// The leader of `view` is `view mod N`.
    pub fn leader(&self, view: View) -> ReplicaId {
        debug_assert!(view >= 0);
        view as usize % self.count
    }

    pub fn is_local_leader(&self, view: View) -> bool {
        self.leader(view) == self.id
    }

    /// Smallest view above `view` in which the local replica leads.
    pub fn next_view_led_by_self(&self, view: View) -> View {
        let mut next = view + 1;
        while self.leader(next) != self.id {
            next += 1;
        }
        next
    }

    /// More than half of the group.
    pub fn is_majority(&self, cardinality: usize) -> bool {
        cardinality > self.count / 2
    }

    /// Every replica, the local one included.
    pub fn all_replicas(&self) -> ReplicaSet {
        (0..self.count).collect()
    }

    /// Every replica except the local one.
    pub fn others(&self) -> ReplicaSet {
        let mut set = self.all_replicas();
        set.remove(self.id);
        set
    }
}

/// Small fixed-capacity set of replica IDs, used for accept tallies,
/// prepared tallies, and retransmission destinations.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct ReplicaSet(u64);

impl ReplicaSet {
    pub fn new() -> Self {
        ReplicaSet(0)
    }

    pub fn insert(&mut self, id: ReplicaId) {
        debug_assert!(id < 64);
        self.0 |= 1 << id;
    }

    pub fn remove(&mut self, id: ReplicaId) {
        self.0 &= !(1 << id);
    }

    pub fn contains(&self, id: ReplicaId) -> bool {
        self.0 & (1 << id) != 0
    }

    pub fn cardinality(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        (0..64).filter(move |id| self.contains(*id))
    }
}

impl std::fmt::Debug for ReplicaSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<ReplicaId> for ReplicaSet {
    fn from_iter<I: IntoIterator<Item = ReplicaId>>(iter: I) -> Self {
        let mut set = ReplicaSet::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_view_skips_to_own_turn() {
        let config = Config::new(1, 3);
        assert_eq!(config.next_view_led_by_self(0), 1);
        assert_eq!(config.next_view_led_by_self(1), 4);
        assert_eq!(config.next_view_led_by_self(2), 4);

        let config = Config::new(0, 3);
        assert_eq!(config.next_view_led_by_self(0), 3);
        assert_eq!(config.next_view_led_by_self(4), 6);
    }

    #[test]
    fn leader_rotates_modulo_group_size() {
        let config = Config::new(0, 3);
        assert_eq!(config.leader(0), 0);
        assert_eq!(config.leader(1), 1);
        assert_eq!(config.leader(5), 2);
        assert!(config.is_local_leader(3));
        assert!(!config.is_local_leader(4));
    }

    #[test]
    fn majority_is_strictly_more_than_half() {
        let config = Config::new(0, 3);
        assert!(!config.is_majority(1));
        assert!(config.is_majority(2));

        let config = Config::new(0, 4);
        assert!(!config.is_majority(2));
        assert!(config.is_majority(3));
    }

    #[test]
    fn replica_set_operations() {
        let mut set = ReplicaSet::new();
        assert!(set.is_empty());

        set.insert(0);
        set.insert(2);
        assert_eq!(set.cardinality(), 2);
        assert!(set.contains(0));
        assert!(!set.contains(1));

        set.remove(0);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![2]);

        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn others_excludes_local_replica() {
        let config = Config::new(1, 3);
        assert_eq!(config.all_replicas().iter().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(config.others().iter().collect::<Vec<_>>(), vec![0, 2]);
    }
}
