//! # Test Message Model
//!
//! Every topic (`Throughput`, `Latency`, `Announcement`) carries the same
//! fixed-shape [`TestMessage`]. A handful of reserved `size` values double as
//! control markers, so receivers classify a message with [`TestMessage::kind`]
//! before looking at the payload.
//!
//! ## Timestamps
//!
//! Send time is a 64-bit microsecond value split across two 32-bit fields,
//! `timestamp_sec` (high word) and `timestamp_usec` (low word).

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Width of the instance key carried by every message.
pub const KEY_SIZE: usize = 4;

/// Per-message byte overhead added to the payload length when computing the
/// effective wire size and when counting received bytes.
pub const OVERHEAD_BYTES: i32 = 28;

/// Warm-up / pre-registration sample, never measured.
pub const INITIALIZE_SIZE: i32 = 1234;

/// The sender declares end-of-test for its role.
pub const FINISHED_SIZE: i32 = 1235;

/// Scan mode: the data size is about to change, an acknowledgement is expected.
pub const LENGTH_CHANGED_SIZE: i32 = 1236;

/// Reserved instance key delivered to every subscriber regardless of its
/// content filter.
pub const MAX_CFT_VALUE: u32 = 65535;

/// `latency_ping` value of a sample that is not a ping.
pub const NO_PING: i32 = -1;

/// Classification of a message by its `size` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Initialize,
    Finished,
    LengthChanged,
    /// A measured sample carrying `size` payload bytes.
    Data(i32),
}

impl MessageKind {
    /// Returns true for the three control sentinels.
    pub fn is_control(self) -> bool {
        !matches!(self, MessageKind::Data(_))
    }
}

/// Returns true when `size` is one of the reserved control values.
pub fn is_sentinel_size(size: i32) -> bool {
    matches!(size, INITIALIZE_SIZE | FINISHED_SIZE | LENGTH_CHANGED_SIZE)
}

/// The unit of exchange on every topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMessage {
    pub key: [u8; KEY_SIZE],
    /// Publisher id on the throughput and latency topics, subscriber id on
    /// the announcement topic.
    pub entity_id: i32,
    pub seq_num: u64,
    pub timestamp_sec: i32,
    pub timestamp_usec: u32,
    pub latency_ping: i32,
    pub size: i32,
    pub data: Vec<u8>,
}

impl Default for TestMessage {
    fn default() -> Self {
        Self {
            key: [0; KEY_SIZE],
            entity_id: 0,
            seq_num: 0,
            timestamp_sec: 0,
            timestamp_usec: 0,
            latency_ping: NO_PING,
            size: 0,
            data: Vec::new(),
        }
    }
}

impl TestMessage {
    /// Create a data message with a zero-filled payload of `size` bytes.
    pub fn with_payload(entity_id: i32, size: i32) -> Self {
        let mut message = Self {
            entity_id,
            ..Self::default()
        };
        message.set_payload_size(size);
        message
    }

    /// Create a control message (`size` is one of the sentinels) with no
    /// payload bytes.
    pub fn control(entity_id: i32, size: i32) -> Self {
        Self {
            entity_id,
            size,
            ..Self::default()
        }
    }

    /// Classify this message by its `size` field.
    pub fn kind(&self) -> MessageKind {
        match self.size {
            INITIALIZE_SIZE => MessageKind::Initialize,
            FINISHED_SIZE => MessageKind::Finished,
            LENGTH_CHANGED_SIZE => MessageKind::LengthChanged,
            size => MessageKind::Data(size),
        }
    }

    /// Resize the payload buffer and set `size` to match.
    ///
    /// The buffer keeps its allocation when shrinking so switching between
    /// scan sizes does not reallocate.
    pub fn set_payload_size(&mut self, size: i32) {
        self.size = size;
        self.data.resize(size.max(0) as usize, 0);
    }

    /// Turn this message into a control sample, dropping the payload bytes
    /// but keeping the buffer for the next data size.
    pub fn set_control_size(&mut self, size: i32) {
        self.size = size;
        self.data.clear();
    }

    /// Pack a microsecond timestamp into the two 32-bit fields.
    pub fn set_timestamp(&mut self, micros: u64) {
        self.timestamp_sec = ((micros >> 32) & 0xFFFF_FFFF) as u32 as i32;
        self.timestamp_usec = (micros & 0xFFFF_FFFF) as u32;
    }

    /// Reassemble the 64-bit microsecond timestamp.
    pub fn timestamp(&self) -> u64 {
        ((self.timestamp_sec as u32 as u64) << 32) | self.timestamp_usec as u64
    }

    /// The subscriber addressed by this ping, if it is one.
    pub fn ping_target(&self) -> Option<i32> {
        (self.latency_ping != NO_PING).then_some(self.latency_ping)
    }

    /// Numeric value of the little-endian instance key.
    pub fn key_value(&self) -> u32 {
        u32::from_le_bytes(self.key)
    }

    pub fn set_key_value(&mut self, value: u32) {
        self.key = value.to_le_bytes();
    }

    /// Bytes accounted for this sample on the receive side.
    pub fn wire_size(&self) -> u64 {
        (self.size + OVERHEAD_BYTES).max(0) as u64
    }

    /// Serialize the message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize bytes to a message
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
