use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Instant;

use bytes::Bytes;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Packet payload: raw bytes or a typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Undecoded bytes
    Raw(Bytes),
    /// A decoded line of text
    Text(String),
    /// A structured value (maps, lists, scalars)
    Value(serde_json::Value),
}

impl Payload {
    /// Returns the text if this is a [`Payload::Text`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the value if this is a [`Payload::Value`].
    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Value(value) => Some(value),
            _ => None,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_owned())
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Raw(bytes)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Value(value)
    }
}

/// Immutable unit of application data.
///
/// Packets are ordered by creation timestamp. Packets created at the same instant are
/// ordered by creation sequence, which makes the order total and stable.
#[derive(Clone)]
pub struct Packet {
    source_id: String,
    timestamp: Instant,
    sequence: u64,
    payload: Payload,
}

impl Packet {
    /// Creates a packet stamped with the current instant.
    pub fn new(source_id: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self::at(source_id, Instant::now(), payload)
    }

    /// Creates a packet with an explicit timestamp.
    pub fn at(source_id: impl Into<String>, timestamp: Instant, payload: impl Into<Payload>) -> Self {
        Self {
            source_id: source_id.into(),
            timestamp,
            sequence: NEXT_SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed),
            payload: payload.into(),
        }
    }

    /// Creates a raw-bytes packet.
    pub fn raw(source_id: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self::new(source_id, Payload::Raw(bytes.into()))
    }

    /// Id of the connection this packet came from or is addressed to.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Creation instant.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// The payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// True when the payload is undecoded bytes.
    pub fn is_raw(&self) -> bool {
        matches!(self.payload, Payload::Raw(_))
    }

    /// Consumes the packet, returning its payload.
    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Derives a new packet with a different payload, keeping source and timestamp.
    pub fn with_payload(&self, payload: impl Into<Payload>) -> Packet {
        Packet {
            source_id: self.source_id.clone(),
            timestamp: self.timestamp,
            sequence: self.sequence,
            payload: payload.into(),
        }
    }

    /// Derives a new packet attributed to another source, keeping payload and timestamp.
    pub fn with_source_id(self, source_id: impl Into<String>) -> Packet {
        Packet {
            source_id: source_id.into(),
            ..self
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("source_id", &self.source_id)
            .field("sequence", &self.sequence)
            .field("payload", &self.payload)
            .finish()
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Packet {}

impl PartialOrd for Packet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Packet {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.sequence.cmp(&other.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn orders_by_timestamp_then_creation() {
        let now = Instant::now();
        let later = Packet::at("a", now + Duration::from_millis(5), "later");
        let first = Packet::at("a", now, "first");
        let second = Packet::at("b", now, "second");

        let mut packets = vec![later.clone(), second.clone(), first.clone()];
        packets.sort();

        assert_eq!(packets[0].payload().as_text(), Some("first"));
        assert_eq!(packets[1].payload().as_text(), Some("second"));
        assert_eq!(packets[2].payload().as_text(), Some("later"));
    }

    #[test]
    fn derived_packets_keep_origin() {
        let packet = Packet::raw("peer", Bytes::from_static(b"abc"));
        assert!(packet.is_raw());

        let text = packet.with_payload("abc");
        assert!(!text.is_raw());
        assert_eq!(text.timestamp(), packet.timestamp());
        assert_eq!(text.source_id(), "peer");

        let renamed = text.with_source_id("user@peer");
        assert_eq!(renamed.source_id(), "user@peer");
        assert_eq!(renamed.payload().as_text(), Some("abc"));
    }
}
