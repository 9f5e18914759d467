//! # Summary
//!
//! Service checkpoints and the policy deciding when to take them. A
//! snapshot lets the log drop its prefix and lets a hopelessly lagging
//! replica recover without replaying every decision.

use std::collections::HashMap;

use bytes::Buf;
use bytes::BufMut;
use serde::Deserialize;
use serde::Serialize;

use crate::config::FIRST_SNAPSHOT_SIZE_ESTIMATE;
use crate::config::InstanceId;
use crate::config::SNAPSHOT_ASK_RATIO;
use crate::config::SNAPSHOT_FORCE_RATIO;
use crate::config::SNAPSHOT_MIN_LOG_SIZE;
use crate::config::View;
use crate::error::Error;

/// The latest reply sent to one client, carried inside snapshots so the
/// service adapter can keep answering duplicates after an install.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyCacheEntry {
    pub client_id: i64,
    pub sequence: i32,
    pub reply: Vec<u8>,
}

/// A service checkpoint covering every instance up to and including
/// `last_included`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Highest instance whose effects the checkpoint contains.
    pub last_included: InstanceId,

    /// View current when the checkpoint was taken.
    pub view: View,

    /// Opaque service state.
    pub service_state: Vec<u8>,

    /// Per-client reply cache at checkpoint time.
    pub reply_cache: Vec<ReplyCacheEntry>,
}

impl Snapshot {
    /// Id of the first instance not covered by this snapshot.
    pub fn next_instance_id(&self) -> InstanceId {
        self.last_included + 1
    }

    pub fn byte_size(&self) -> usize {
        16 + self.service_state.len()
            + self
                .reply_cache
                .iter()
                .map(|entry| 16 + entry.reply.len())
                .sum::<usize>()
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.put_u32(self.last_included);
        buf.put_i32(self.view);
        buf.put_i32(self.service_state.len() as i32);
        buf.put_slice(&self.service_state);
        buf.put_i32(self.reply_cache.len() as i32);
        for entry in &self.reply_cache {
            buf.put_i64(entry.client_id);
            buf.put_i32(entry.sequence);
            buf.put_i32(entry.reply.len() as i32);
            buf.put_slice(&entry.reply);
        }
    }

    pub fn read_from(buf: &mut &[u8]) -> Result<Self, Error> {
        if buf.remaining() < 12 {
            return Err(Error::Codec("truncated snapshot header"));
        }
        let last_included = buf.get_u32();
        let view = buf.get_i32();
        let service_len = buf.get_i32();
        if service_len < 0 || buf.remaining() < service_len as usize + 4 {
            return Err(Error::Codec("truncated snapshot state"));
        }
        let service_state = buf[..service_len as usize].to_vec();
        buf.advance(service_len as usize);

        let count = buf.get_i32();
        if count < 0 {
            return Err(Error::Codec("negative reply cache count"));
        }
        let mut reply_cache = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if buf.remaining() < 16 {
                return Err(Error::Codec("truncated reply cache entry"));
            }
            let client_id = buf.get_i64();
            let sequence = buf.get_i32();
            let reply_len = buf.get_i32();
            if reply_len < 0 || buf.remaining() < reply_len as usize {
                return Err(Error::Codec("truncated reply cache entry"));
            }
            let reply = buf[..reply_len as usize].to_vec();
            buf.advance(reply_len as usize);
            reply_cache.push(ReplyCacheEntry {
                client_id,
                sequence,
                reply,
            });
        }
        Ok(Snapshot {
            last_included,
            view,
            service_state,
            reply_cache,
        })
    }
}

/// Live per-client reply cache, rebuilt from executed requests and
/// serialized into every snapshot.
#[derive(Debug, Default)]
pub struct ReplyCache {
    replies: HashMap<i64, (i32, Vec<u8>)>,
}

impl ReplyCache {
    pub fn new() -> Self {
        ReplyCache::default()
    }

    /// Records the reply to the newest request seen from `client_id`.
    pub fn record(&mut self, client_id: i64, sequence: i32, reply: Vec<u8>) {
        match self.replies.get(&client_id) {
            Some((cached, _)) if *cached >= sequence => {}
            _ => {
                self.replies.insert(client_id, (sequence, reply));
            }
        }
    }

    pub fn reply(&self, client_id: i64) -> Option<(i32, &[u8])> {
        self.replies
            .get(&client_id)
            .map(|(sequence, reply)| (*sequence, reply.as_slice()))
    }

    pub fn entries(&self) -> Vec<ReplyCacheEntry> {
        let mut entries: Vec<_> = self
            .replies
            .iter()
            .map(|(client_id, (sequence, reply))| ReplyCacheEntry {
                client_id: *client_id,
                sequence: *sequence,
                reply: reply.clone(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.client_id);
        entries
    }

    /// Replaces the cache with the one carried by an installed snapshot.
    pub fn restore(&mut self, entries: &[ReplyCacheEntry]) {
        self.replies = entries
            .iter()
            .map(|entry| {
                (
                    entry.client_id,
                    (entry.sequence, entry.reply.clone()),
                )
            })
            .collect();
    }
}

/// Decides when the accumulated log justifies asking the service for a
/// fresh checkpoint. Sized relative to the previous snapshot so that a
/// service with large state is not asked constantly.
#[derive(Debug)]
pub struct SnapshotPolicy {
    last_snapshot_size: usize,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        SnapshotPolicy {
            last_snapshot_size: FIRST_SNAPSHOT_SIZE_ESTIMATE,
        }
    }
}

impl SnapshotPolicy {
    pub fn new() -> Self {
        SnapshotPolicy::default()
    }

    pub fn should_ask(&self, log_bytes: usize) -> bool {
        let threshold = (self.last_snapshot_size as f64 * SNAPSHOT_ASK_RATIO) as usize;
        log_bytes > SNAPSHOT_MIN_LOG_SIZE.max(threshold)
    }

    pub fn must_force(&self, log_bytes: usize) -> bool {
        let threshold = (self.last_snapshot_size as f64 * SNAPSHOT_FORCE_RATIO) as usize;
        log_bytes > SNAPSHOT_MIN_LOG_SIZE.max(threshold)
    }

    pub fn note_snapshot(&mut self, byte_size: usize) {
        self.last_snapshot_size = byte_size.max(1);
    }
}
