use bytes::Buf;
use bytes::BufMut;

use crate::config::InstanceId;
use crate::config::View;
use crate::error::Error;
use crate::storage::log::InstanceRecord;
use crate::storage::log::LogEntryState;
use crate::snapshot::Snapshot;

const PREPARE: u8 = 1;
const PREPARE_OK: u8 = 2;
const PROPOSE: u8 = 3;
const ACCEPT: u8 = 4;
const ALIVE: u8 = 5;
const CATCH_UP_QUERY: u8 = 6;
const CATCH_UP_RESPONSE: u8 = 7;
const CATCH_UP_SNAPSHOT: u8 = 8;

/// Milliseconds since the Unix epoch, carried on every message for RTT
/// estimation.
pub fn clock_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// One protocol message: the common header plus a per-kind payload.
///
/// The encoding is big-endian and bit-exact: `encode` always produces
/// exactly `byte_size` bytes, and `decode` reverses it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub view: View,
    pub sent_time: i64,
    pub body: Body,
}

/// The eight message kinds of the protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    /// Phase 1: a new leader asks everyone what they have accepted from
    /// `first_uncommitted` on.
    Prepare { first_uncommitted: InstanceId },

    /// Phase 1 answer: every non-empty instance the acceptor holds in
    /// the requested range.
    PrepareOk { prepared: Vec<InstanceRecord> },

    /// Phase 2: the leader pushes one instance at its current view.
    Propose { instance: InstanceRecord },

    /// Phase 2 answer: the sender has accepted `instance_id` at the
    /// header view.
    Accept { instance_id: InstanceId },

    /// Leader heartbeat.
    Alive,

    /// A lagging replica lists the decided instances it is missing,
    /// as ranges and as isolated ids.
    CatchUpQuery {
        ranges: Vec<(InstanceId, InstanceId)>,
        ids: Vec<InstanceId>,
    },

    /// Decided instances answering a catch-up query.
    CatchUpResponse { decided: Vec<InstanceRecord> },

    /// Answer to a catch-up query whose range predates the peer's log.
    CatchUpSnapshot { snapshot: Snapshot },
}

impl Message {
    pub fn new(view: View, body: Body) -> Self {
        Message {
            view,
            sent_time: clock_ms(),
            body,
        }
    }

    fn kind(&self) -> u8 {
        match self.body {
            Body::Prepare { .. } => PREPARE,
            Body::PrepareOk { .. } => PREPARE_OK,
            Body::Propose { .. } => PROPOSE,
            Body::Accept { .. } => ACCEPT,
            Body::Alive => ALIVE,
            Body::CatchUpQuery { .. } => CATCH_UP_QUERY,
            Body::CatchUpResponse { .. } => CATCH_UP_RESPONSE,
            Body::CatchUpSnapshot { .. } => CATCH_UP_SNAPSHOT,
        }
    }

    pub fn byte_size(&self) -> usize {
        let payload = match &self.body {
            Body::Prepare { .. } => 4,
            Body::PrepareOk { prepared } => {
                4 + prepared.iter().map(record_byte_size).sum::<usize>()
            }
            Body::Propose { instance } => record_byte_size(instance),
            Body::Accept { .. } => 4,
            Body::Alive => 0,
            Body::CatchUpQuery { ranges, ids } => 8 + ranges.len() * 8 + ids.len() * 4,
            Body::CatchUpResponse { decided } => {
                4 + decided.iter().map(record_byte_size).sum::<usize>()
            }
            Body::CatchUpSnapshot { snapshot } => snapshot.byte_size(),
        };
        // type(1) + view(4) + sentTime(8)
        13 + payload
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.byte_size());
        buf.put_u8(self.kind());
        buf.put_i32(self.view);
        buf.put_i64(self.sent_time);
        match &self.body {
            Body::Prepare { first_uncommitted } => {
                buf.put_u32(*first_uncommitted);
            }
            Body::PrepareOk { prepared } => {
                buf.put_i32(prepared.len() as i32);
                for record in prepared {
                    write_record(record, &mut buf);
                }
            }
            Body::Propose { instance } => {
                write_record(instance, &mut buf);
            }
            Body::Accept { instance_id } => {
                buf.put_u32(*instance_id);
            }
            Body::Alive => {}
            Body::CatchUpQuery { ranges, ids } => {
                buf.put_i32(ranges.len() as i32);
                for (begin, end) in ranges {
                    buf.put_u32(*begin);
                    buf.put_u32(*end);
                }
                buf.put_i32(ids.len() as i32);
                for id in ids {
                    buf.put_u32(*id);
                }
            }
            Body::CatchUpResponse { decided } => {
                buf.put_i32(decided.len() as i32);
                for record in decided {
                    write_record(record, &mut buf);
                }
            }
            Body::CatchUpSnapshot { snapshot } => {
                snapshot.write_to(&mut buf);
            }
        }
        debug_assert_eq!(buf.len(), self.byte_size());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = bytes;
        if buf.remaining() < 13 {
            return Err(Error::Codec("truncated message header"));
        }
        let kind = buf.get_u8();
        let view = buf.get_i32();
        let sent_time = buf.get_i64();
        let body = match kind {
            PREPARE => {
                if buf.remaining() < 4 {
                    return Err(Error::Codec("truncated Prepare"));
                }
                Body::Prepare {
                    first_uncommitted: buf.get_u32(),
                }
            }
            PREPARE_OK => Body::PrepareOk {
                prepared: read_records(&mut buf)?,
            },
            PROPOSE => Body::Propose {
                instance: read_record(&mut buf)?,
            },
            ACCEPT => {
                if buf.remaining() < 4 {
                    return Err(Error::Codec("truncated Accept"));
                }
                Body::Accept {
                    instance_id: buf.get_u32(),
                }
            }
            ALIVE => Body::Alive,
            CATCH_UP_QUERY => {
                if buf.remaining() < 4 {
                    return Err(Error::Codec("truncated CatchUpQuery"));
                }
                let range_count = buf.get_i32();
                if range_count < 0 || buf.remaining() < range_count as usize * 8 + 4 {
                    return Err(Error::Codec("truncated CatchUpQuery ranges"));
                }
                let mut ranges = Vec::with_capacity(range_count as usize);
                for _ in 0..range_count {
                    ranges.push((buf.get_u32(), buf.get_u32()));
                }
                let id_count = buf.get_i32();
                if id_count < 0 || buf.remaining() < id_count as usize * 4 {
                    return Err(Error::Codec("truncated CatchUpQuery ids"));
                }
                let mut ids = Vec::with_capacity(id_count as usize);
                for _ in 0..id_count {
                    ids.push(buf.get_u32());
                }
                Body::CatchUpQuery { ranges, ids }
            }
            CATCH_UP_RESPONSE => Body::CatchUpResponse {
                decided: read_records(&mut buf)?,
            },
            CATCH_UP_SNAPSHOT => Body::CatchUpSnapshot {
                snapshot: Snapshot::read_from(&mut buf)?,
            },
            _ => return Err(Error::Codec("unknown message type")),
        };
        if buf.has_remaining() {
            return Err(Error::Codec("trailing bytes after message"));
        }
        Ok(Message {
            view,
            sent_time,
            body,
        })
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.body {
            Body::Prepare { first_uncommitted } => {
                write!(f, "Prepare(view={}, from={})", self.view, first_uncommitted)
            }
            Body::PrepareOk { prepared } => {
                write!(f, "PrepareOK(view={}, {} instances)", self.view, prepared.len())
            }
            Body::Propose { instance } => {
                write!(f, "Propose(view={}, id={})", self.view, instance.id)
            }
            Body::Accept { instance_id } => {
                write!(f, "Accept(view={}, id={})", self.view, instance_id)
            }
            Body::Alive => write!(f, "Alive(view={})", self.view),
            Body::CatchUpQuery { ranges, ids } => write!(
                f,
                "CatchUpQuery(view={}, {} ranges, {} ids)",
                self.view,
                ranges.len(),
                ids.len(),
            ),
            Body::CatchUpResponse { decided } => {
                write!(f, "CatchUpResponse(view={}, {} instances)", self.view, decided.len())
            }
            Body::CatchUpSnapshot { snapshot } => write!(
                f,
                "CatchUpSnapshot(view={}, up to {})",
                self.view, snapshot.last_included,
            ),
        }
    }
}

/// id(4) + view(4) + state(4) + length(4, -1 when absent) + bytes.
fn record_byte_size(record: &InstanceRecord) -> usize {
    16 + record.value.as_ref().map_or(0, Vec::len)
}

fn write_record(record: &InstanceRecord, buf: &mut Vec<u8>) {
    buf.put_u32(record.id);
    buf.put_i32(record.view);
    buf.put_i32(record.state.ordinal());
    match &record.value {
        Some(value) => {
            buf.put_i32(value.len() as i32);
            buf.put_slice(value);
        }
        None => buf.put_i32(-1),
    }
}

fn read_record(buf: &mut &[u8]) -> Result<InstanceRecord, Error> {
    if buf.remaining() < 16 {
        return Err(Error::Codec("truncated instance record"));
    }
    let id = buf.get_u32();
    let view = buf.get_i32();
    let state = LogEntryState::from_ordinal(buf.get_i32())
        .ok_or(Error::Codec("invalid instance state"))?;
    let length = buf.get_i32();
    let value = if length == -1 {
        None
    } else {
        if length < 0 || buf.remaining() < length as usize {
            return Err(Error::Codec("truncated instance value"));
        }
        let value = buf[..length as usize].to_vec();
        buf.advance(length as usize);
        Some(value)
    };
    if state == LogEntryState::Unknown && value.is_some() {
        return Err(Error::Codec("unknown instance carrying a value"));
    }
    Ok(InstanceRecord {
        id,
        view,
        state,
        value,
    })
}

fn read_records(buf: &mut &[u8]) -> Result<Vec<InstanceRecord>, Error> {
    if buf.remaining() < 4 {
        return Err(Error::Codec("truncated record list"));
    }
    let count = buf.get_i32();
    if count < 0 {
        return Err(Error::Codec("negative record count"));
    }
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        records.push(read_record(buf)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::snapshot::ReplyCacheEntry;

    use super::*;

    fn known(id: InstanceId, view: View, value: &[u8]) -> InstanceRecord {
        InstanceRecord {
            id,
            view,
            state: LogEntryState::Known,
            value: Some(value.to_vec()),
        }
    }

    fn round_trip(message: Message) {
        let encoded = message.encode();
        assert_eq!(encoded.len(), message.byte_size());
        assert_eq!(Message::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn round_trip_every_kind() {
        let snapshot = Snapshot {
            last_included: 41,
            view: 3,
            service_state: b"service".to_vec(),
            reply_cache: vec![ReplyCacheEntry {
                client_id: 12,
                sequence: 1,
                reply: b"r".to_vec(),
            }],
        };
        let messages = vec![
            Message {
                view: 12,
                sent_time: 99,
                body: Body::Prepare {
                    first_uncommitted: 32,
                },
            },
            Message {
                view: 12,
                sent_time: 99,
                body: Body::PrepareOk {
                    prepared: vec![
                        known(0, 11, b"locked"),
                        InstanceRecord {
                            id: 1,
                            view: 12,
                            state: LogEntryState::Decided,
                            value: Some(b"done".to_vec()),
                        },
                    ],
                },
            },
            Message {
                view: 0,
                sent_time: 1,
                body: Body::Propose {
                    instance: known(7, 0, b"batch"),
                },
            },
            Message {
                view: 0,
                sent_time: 1,
                body: Body::Accept { instance_id: 7 },
            },
            Message {
                view: 5,
                sent_time: 0,
                body: Body::Alive,
            },
            Message {
                view: 5,
                sent_time: 0,
                body: Body::CatchUpQuery {
                    ranges: vec![(3, 8), (10, 11)],
                    ids: vec![15],
                },
            },
            Message {
                view: 5,
                sent_time: 0,
                body: Body::CatchUpResponse {
                    decided: vec![InstanceRecord {
                        id: 3,
                        view: 2,
                        state: LogEntryState::Decided,
                        value: Some(b"v".to_vec()),
                    }],
                },
            },
            Message {
                view: 5,
                sent_time: 0,
                body: Body::CatchUpSnapshot { snapshot },
            },
        ];
        for message in messages {
            round_trip(message);
        }
    }

    #[test]
    fn empty_prepare_ok_round_trips() {
        round_trip(Message {
            view: 1,
            sent_time: 7,
            body: Body::PrepareOk { prepared: Vec::new() },
        });
    }

    #[test]
    fn absent_value_encodes_as_minus_one() {
        let message = Message {
            view: 2,
            sent_time: 0,
            body: Body::PrepareOk {
                prepared: vec![InstanceRecord {
                    id: 9,
                    view: -1,
                    state: LogEntryState::Unknown,
                    value: None,
                }],
            },
        };
        let encoded = message.encode();
        // Last four payload bytes are the -1 length marker.
        assert_eq!(&encoded[encoded.len() - 4..], &[0xff, 0xff, 0xff, 0xff]);
        round_trip(message);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Message::decode(&[]).is_err());
        assert!(Message::decode(&[PREPARE; 5]).is_err());

        // Unknown type byte.
        let mut encoded = Message {
            view: 0,
            sent_time: 0,
            body: Body::Alive,
        }
        .encode();
        encoded[0] = 99;
        assert!(Message::decode(&encoded).is_err());
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut encoded = Message {
            view: 0,
            sent_time: 0,
            body: Body::Accept { instance_id: 1 },
        }
        .encode();
        encoded.push(0);
        assert!(Message::decode(&encoded).is_err());
    }

    #[test]
    fn decode_rejects_unknown_state_with_value() {
        let record = InstanceRecord {
            id: 0,
            view: -1,
            state: LogEntryState::Unknown,
            value: None,
        };
        let mut encoded = Message {
            view: 0,
            sent_time: 0,
            body: Body::Propose { instance: record },
        }
        .encode();
        // Rewrite the length marker to claim a zero-length value.
        let at = encoded.len() - 4;
        encoded[at..].copy_from_slice(&0i32.to_be_bytes());
        assert!(Message::decode(&encoded).is_err());
    }

    #[test]
    fn header_layout_is_fixed() {
        let message = Message {
            view: 0x0102_0304,
            sent_time: 0x1112_1314_1516_1718,
            body: Body::Alive,
        };
        let encoded = message.encode();
        assert_eq!(encoded[0], ALIVE);
        assert_eq!(&encoded[1..5], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&encoded[5..13], &[0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18]);
    }
}
