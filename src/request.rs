//! # Summary
//!
//! Client requests as the replication core sees them: an identifier and
//! an opaque payload. The core never inspects the payload; it only needs
//! a self-delimiting encoding so that several requests can be packed
//! back-to-back into one batched proposal value.

use bytes::Buf;
use bytes::BufMut;

use crate::error::Error;

/// Identity of a request: which client sent it and where it falls in
/// that client's submission order. Two requests are the same request
/// exactly when their IDs are equal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestId {
    pub client_id: i64,
    pub sequence: i32,
}

impl RequestId {
    /// The reserved ID of the no-op request used to fill abandoned
    /// instances during a view change.
    pub const NO_OP: RequestId = RequestId {
        client_id: -1,
        sequence: -1,
    };
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.client_id, self.sequence)
    }
}

/// One client request. Equality is by [`RequestId`] only; the payload is
/// carried through the protocol untouched.
#[derive(Clone, Debug)]
pub struct Request {
    pub id: RequestId,
    pub payload: Vec<u8>,
}

impl PartialEq for Request {
    fn eq(&self, rhs: &Self) -> bool {
        self.id == rhs.id
    }
}

impl Eq for Request {}

impl Request {
    pub fn new(id: RequestId, payload: Vec<u8>) -> Self {
        Request { id, payload }
    }

    /// The well-known no-op: reserved ID, empty payload. It is never
    /// handed to the service.
    pub fn no_op() -> Self {
        Request {
            id: RequestId::NO_OP,
            payload: Vec::new(),
        }
    }

    pub fn is_no_op(&self) -> bool {
        self.id == RequestId::NO_OP
    }

    /// Encoded length: clientId(8) + sequence(4) + length(4) + payload.
    pub fn byte_size(&self) -> usize {
        16 + self.payload.len()
    }

    /// Appends the self-delimiting big-endian encoding to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.put_i64(self.id.client_id);
        buf.put_i32(self.id.sequence);
        buf.put_i32(self.payload.len() as i32);
        buf.put_slice(&self.payload);
    }

    /// Reads one request from the front of `buf`, consuming exactly
    /// `byte_size` bytes.
    pub fn read_from(buf: &mut &[u8]) -> Result<Self, Error> {
        if buf.remaining() < 16 {
            return Err(Error::Codec("truncated request header"));
        }
        let client_id = buf.get_i64();
        let sequence = buf.get_i32();
        let length = buf.get_i32();
        if length < 0 || buf.remaining() < length as usize {
            return Err(Error::Codec("truncated request payload"));
        }
        let payload = buf[..length as usize].to_vec();
        buf.advance(length as usize);
        Ok(Request {
            id: RequestId {
                client_id,
                sequence,
            },
            payload,
        })
    }
}

/// Parses a batched proposal value: a 4-byte request count followed by
/// that many self-delimited requests.
pub fn unbatch(value: &[u8]) -> Result<Vec<Request>, Error> {
    let mut buf = value;
    if buf.remaining() < 4 {
        return Err(Error::Codec("truncated batch header"));
    }
    let count = buf.get_i32();
    if count < 0 {
        return Err(Error::Codec("negative batch count"));
    }
    let mut requests = Vec::with_capacity(count as usize);
    for _ in 0..count {
        requests.push(Request::read_from(&mut buf)?);
    }
    if buf.has_remaining() {
        return Err(Error::Codec("trailing bytes after batch"));
    }
    Ok(requests)
}
