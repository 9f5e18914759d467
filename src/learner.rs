//! # Summary
//!
//! The learner role: tallies `Accept` messages per instance and spots
//! the moment a value has a majority behind it. The tally lives on the
//! instance itself and obeys the view discipline: accepts from an
//! older view are worthless, and a newer view starts a fresh tally.

use log::trace;

use crate::config::Config;
use crate::config::InstanceId;
use crate::config::ReplicaId;
use crate::config::View;
use crate::storage::log::LogEntryState;
use crate::storage::Storage;

#[derive(Debug, Default)]
pub(crate) struct Learner;

impl Learner {
    /// Records one `Accept`. Returns true when this accept completed a
    /// majority for an instance that can now be decided.
    pub fn on_accept(
        &self,
        config: &Config,
        storage: &mut Storage,
        sender: ReplicaId,
        view: View,
        instance_id: InstanceId,
    ) -> bool {
        let log = storage.log_mut();
        if instance_id < log.lowest_available() {
            return false;
        }
        // An accept can outrun its proposal; the entry starts Unknown
        // and the tally is kept until the value arrives.
        log.extend_to(instance_id);
        let entry = log.instance_mut(instance_id).unwrap();
        if entry.state() == LogEntryState::Decided {
            return false;
        }
        if view < entry.view() {
            trace!(
                "dropping accept for instance {} at view {} (entry at {})",
                instance_id,
                view,
                entry.view(),
            );
            return false;
        }
        entry.set_view(view);
        if let Some(accepts) = entry.accepts_mut() {
            accepts.insert(sender);
        }
        self.is_decidable(config, storage, instance_id)
    }

    /// Whether `instance_id` holds a value with a majority of accepts.
    pub fn is_decidable(&self, config: &Config, storage: &Storage, instance_id: InstanceId) -> bool {
        let Some(entry) = storage.log().instance(instance_id) else {
            return false;
        };
        entry.state() == LogEntryState::Known
            && entry.value().is_some()
            && entry
                .accepts()
                .map_or(false, |accepts| config.is_majority(accepts.cardinality()))
    }
}
