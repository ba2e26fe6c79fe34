//! protocol.rs
//! Batch framing for the plant ↔ controller link.
//!
//! One batch per datagram:
//!
//! ```text
//! +--------+---------+------------------------------------------+
//! | "NCSB" | version | bincode { kind, seq, timestamp, values } |
//! +--------+---------+------------------------------------------+
//!   4 bytes  1 byte
//! ```
//!
//! Receivers keep a `SequenceFilter` per direction and accept a batch only if its sequence
//! number is strictly greater than the last accepted one. Batches are accepted or rejected
//! whole; fields are never merged across batches.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::plant::variable::ValueMap;

pub const MAGIC: &[u8; 4] = b"NCSB";
pub const PROTOCOL_VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchKind {
    /// Plant → Controller.
    Sample,
    /// Controller → Plant.
    Actuation,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Sample => "sample",
            BatchKind::Actuation => "actuation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub kind: BatchKind,
    pub seq: u64,
    /// Seconds since the UNIX epoch at the time the batch was built.
    pub timestamp: f64,
    pub values: ValueMap,
}

impl Batch {
    pub fn new(kind: BatchKind, seq: u64, values: ValueMap) -> Self {
        Self {
            kind,
            seq,
            timestamp: unix_now(),
            values,
        }
    }

    /// Builds the actuation answer to this sample batch. The reply echoes the sample's
    /// sequence number so the plant can match it to the send time.
    pub fn reply(&self, values: ValueMap) -> Batch {
        Batch::new(BatchKind::Actuation, self.seq, values)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = bincode::serialize(self)?;
        let total = HEADER_LEN + payload.len();
        if total > MAX_DATAGRAM {
            return Err(ProtocolError::TooLarge(total));
        }
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(MAGIC);
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Batch, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated(data.len()));
        }
        let magic = [data[0], data[1], data[2], data[3]];
        if &magic != MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        if data[4] != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(data[4]));
        }
        Ok(bincode::deserialize(&data[HEADER_LEN..])?)
    }

    /// Decodes and checks the batch travels in the expected direction.
    pub fn decode_kind(data: &[u8], expected: BatchKind) -> Result<Batch, ProtocolError> {
        let batch = Batch::decode(data)?;
        if batch.kind != expected {
            return Err(ProtocolError::UnexpectedKind {
                expected: expected.as_str(),
                actual: batch.kind.as_str(),
            });
        }
        Ok(batch)
    }
}

/// Monotonic sequence tracking for one direction of the link.
#[derive(Debug, Default, Clone)]
pub struct SequenceFilter {
    last: Option<u64>,
    accepted: u64,
    rejected: u64,
}

impl SequenceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `seq` if it is strictly newer than the last accepted one.
    /// On rejection returns the last accepted sequence number.
    pub fn accept(&mut self, seq: u64) -> Result<(), u64> {
        match self.last {
            Some(last) if seq <= last => {
                self.rejected += 1;
                Err(last)
            }
            _ => {
                self.last = Some(seq);
                self.accepted += 1;
                Ok(())
            }
        }
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

/// Wall-clock seconds since the UNIX epoch.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
