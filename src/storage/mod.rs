//! # Summary
//!
//! Durable state and the in-memory view over it. `StableStore` is the
//! persistence backend: an append-only record file whose contents must
//! survive a crash the moment a write returns. `Storage` combines the
//! backend with the live log, the current view, and the decided-prefix
//! bookkeeping that the rest of the protocol reads.

pub mod log;

use std::io::Read;
use std::io::Seek;

use serde::Deserialize;
use serde::Serialize;

use self::log::InstanceRecord;
use self::log::Log;
use self::log::LogEntryState;
use crate::config::Config;
use crate::config::InstanceId;
use crate::config::View;
use crate::snapshot::Snapshot;

/// Everything a backend holds when the replica comes back up.
#[derive(Debug, Default)]
pub struct Recovered {
    /// Highest view ever made durable.
    pub view: View,

    /// Most recent installed snapshot, if any.
    pub snapshot: Option<Snapshot>,

    /// Decided instances, sorted by id. Entries covered by the snapshot
    /// have already been dropped.
    pub decided: Vec<(InstanceId, View, Vec<u8>)>,
}

/// Persistence backend. Every method must be durable before it returns;
/// a backend that cannot guarantee that must abort the replica instead
/// of returning.
pub trait StableStore: Send {
    /// Called once at startup, before any write.
    fn recover(&mut self) -> Recovered;

    fn set_view(&mut self, view: View);

    fn mark_decided(&mut self, id: InstanceId, view: View, value: &[u8]);

    /// Atomically replaces everything below the snapshot with the
    /// snapshot itself. `retained` lists decided instances above it
    /// that must survive the compaction.
    fn set_snapshot(&mut self, view: View, snapshot: &Snapshot, retained: &[InstanceRecord]);
}

#[derive(Serialize, Deserialize)]
enum Record {
    View(View),
    Decided {
        id: InstanceId,
        view: View,
        value: Vec<u8>,
    },
    Snapshot(Snapshot),
}

/// File-backed [`StableStore`]: an append-only bincode record log,
/// fsynced per write, compacted by rewrite-and-rename on snapshot.
pub struct FileStore {
    path: std::path::PathBuf,
    file: std::fs::File,
}

impl FileStore {
    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .expect("[STORAGE ERROR]: could not open stable storage");
        FileStore { path, file }
    }

    fn append(&mut self, record: &Record) {
        bincode::serialize_into(&mut self.file, record)
            .expect("[STORAGE ERROR]: failed to write record");
        self.file
            .sync_data()
            .expect("[STORAGE ERROR]: failed to sync stable storage");
    }
}

impl StableStore for FileStore {
    fn recover(&mut self) -> Recovered {
        self.file
            .seek(std::io::SeekFrom::Start(0))
            .expect("[STORAGE ERROR]: failed to rewind stable storage");
        let mut bytes = Vec::new();
        self.file
            .read_to_end(&mut bytes)
            .expect("[STORAGE ERROR]: failed to read stable storage");

        let mut recovered = Recovered::default();
        let mut decided = std::collections::BTreeMap::new();
        let mut reader = bytes.as_slice();
        loop {
            // A torn trailing record is an interrupted write; everything
            // before it was acknowledged and is kept.
            match bincode::deserialize_from::<_, Record>(&mut reader) {
                Ok(Record::View(view)) => recovered.view = recovered.view.max(view),
                Ok(Record::Decided { id, view, value }) => {
                    decided.insert(id, (view, value));
                }
                Ok(Record::Snapshot(snapshot)) => {
                    decided = decided.split_off(&snapshot.next_instance_id());
                    recovered.snapshot = Some(snapshot);
                }
                Err(_) => break,
            }
        }
        recovered.decided = decided
            .into_iter()
            .map(|(id, (view, value))| (id, view, value))
            .collect();
        recovered
    }

    fn set_view(&mut self, view: View) {
        self.append(&Record::View(view));
    }

    fn mark_decided(&mut self, id: InstanceId, view: View, value: &[u8]) {
        self.append(&Record::Decided {
            id,
            view,
            value: value.to_vec(),
        });
    }

    fn set_snapshot(&mut self, view: View, snapshot: &Snapshot, retained: &[InstanceRecord]) {
        let tmp_path = self.path.with_extension("compact");
        let mut tmp = std::fs::File::create(&tmp_path)
            .expect("[STORAGE ERROR]: could not create compaction file");
        let mut write = |record: &Record| {
            bincode::serialize_into(&mut tmp, record)
                .expect("[STORAGE ERROR]: failed to write compaction record");
        };
        write(&Record::View(view));
        write(&Record::Snapshot(snapshot.clone()));
        for record in retained {
            let value = record
                .value
                .as_ref()
                .expect("[STORAGE ERROR]: retained instance without value");
            write(&Record::Decided {
                id: record.id,
                view: record.view,
                value: value.clone(),
            });
        }
        tmp.sync_all()
            .expect("[STORAGE ERROR]: failed to sync compaction file");
        std::fs::rename(&tmp_path, &self.path)
            .expect("[STORAGE ERROR]: failed to install compaction file");
        self.file = std::fs::OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .expect("[STORAGE ERROR]: could not reopen stable storage");
    }
}

/// In-memory [`StableStore`] for tests. Handles are shared, so a test
/// can drop one engine and recover another from the same contents.
#[derive(Clone, Default)]
pub struct MemStore(std::sync::Arc<parking_lot::Mutex<MemStoreInner>>);

#[derive(Default)]
struct MemStoreInner {
    view: View,
    snapshot: Option<Snapshot>,
    decided: std::collections::BTreeMap<InstanceId, (View, Vec<u8>)>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }
}

impl StableStore for MemStore {
    fn recover(&mut self) -> Recovered {
        let inner = self.0.lock();
        Recovered {
            view: inner.view,
            snapshot: inner.snapshot.clone(),
            decided: inner
                .decided
                .iter()
                .map(|(id, (view, value))| (*id, *view, value.clone()))
                .collect(),
        }
    }

    fn set_view(&mut self, view: View) {
        self.0.lock().view = view;
    }

    fn mark_decided(&mut self, id: InstanceId, view: View, value: &[u8]) {
        self.0.lock().decided.insert(id, (view, value.to_vec()));
    }

    fn set_snapshot(&mut self, view: View, snapshot: &Snapshot, retained: &[InstanceRecord]) {
        let mut inner = self.0.lock();
        inner.view = view;
        inner.decided = retained
            .iter()
            .map(|record| {
                (
                    record.id,
                    (record.view, record.value.clone().unwrap_or_default()),
                )
            })
            .collect();
        inner.snapshot = Some(snapshot.clone());
    }
}

/// The replica's whole persistent-and-cached state: current view, the
/// log, the decided-prefix watermark, and the last snapshot.
pub struct Storage {
    config: Config,
    log: Log,
    view: View,
    first_uncommitted: InstanceId,
    last_snapshot: Option<Snapshot>,
    stable: Box<dyn StableStore>,
}

impl Storage {
    /// Rebuilds the in-memory state from whatever the backend recovered.
    pub fn recover(config: Config, mut stable: Box<dyn StableStore>) -> Self {
        let recovered = stable.recover();
        let mut log = Log::new();
        let mut first_uncommitted = 0;
        if let Some(snapshot) = &recovered.snapshot {
            log.truncate_below(snapshot.next_instance_id());
            first_uncommitted = snapshot.next_instance_id();
        }
        for (id, view, value) in recovered.decided {
            log.insert_decided(id, view, value);
        }
        let mut storage = Storage {
            config,
            log,
            view: recovered.view,
            first_uncommitted,
            last_snapshot: recovered.snapshot,
            stable,
        };
        storage.update_first_uncommitted();
        storage
    }

    pub fn view(&self) -> View {
        self.view
    }

    /// Raises the view and makes it durable before returning, so no
    /// message carrying the new view can precede its record.
    pub fn set_view(&mut self, view: View) {
        assert!(view >= self.view, "view must not go back");
        if view > self.view {
            self.stable.set_view(view);
            self.view = view;
        }
    }

    /// First id not yet part of the contiguous decided prefix.
    pub fn first_uncommitted(&self) -> InstanceId {
        self.first_uncommitted
    }

    pub fn update_first_uncommitted(&mut self) {
        while self.log.state(self.first_uncommitted) == Some(LogEntryState::Decided) {
            self.first_uncommitted += 1;
        }
    }

    /// A new proposal may only go to an id within the window above the
    /// decided prefix.
    pub fn is_in_window(&self, id: InstanceId) -> bool {
        id < self.first_uncommitted + self.config.window_size()
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut Log {
        &mut self.log
    }

    /// Seals `id`, writing the durable record before the in-memory
    /// transition so a crash can never forget a decision it exposed.
    pub fn mark_decided(&mut self, id: InstanceId) {
        let instance = self
            .log
            .instance(id)
            .expect("deciding an instance outside the log");
        let view = instance.view();
        let value = instance
            .value()
            .expect("deciding an instance without a value")
            .to_vec();
        self.stable.mark_decided(id, view, &value);
        self.log.set_decided(id);
        self.update_first_uncommitted();
    }

    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.last_snapshot.as_ref()
    }

    /// Installs a snapshot (local or received), persists it atomically
    /// and drops the covered log prefix.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) {
        let next = snapshot.next_instance_id();
        let view = self.view.max(snapshot.view);
        let retained: Vec<InstanceRecord> = self
            .log
            .range(next, self.log.next_id())
            .filter(|instance| instance.state() == LogEntryState::Decided)
            .map(|instance| instance.record())
            .collect();
        self.stable.set_snapshot(view, &snapshot, &retained);
        self.view = view;
        self.log.truncate_below(next);
        self.first_uncommitted = self.first_uncommitted.max(next);
        self.update_first_uncommitted();
        self.last_snapshot = Some(snapshot);
    }
}
