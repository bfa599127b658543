//! Definition of the [`Codec`] trait
//!
//! A codec sits between a connection's socket and its inspector/handlers. It turns the
//! inbound byte stream into [`Packet`]s and queues encoded outbound bytes until the
//! dispatcher drains them. Codecs are stateful: partial records are buffered between
//! [`Codec::decode`] calls and encoded bytes stay queued until [`Codec::read`] takes them.

use bytes::{Buf, BytesMut};

use crate::{NotifyCallback, Packet, Result};

/// Bidirectional byte stream ↔ packet converter.
pub trait Codec {
    /// Decodes newly arrived bytes.
    ///
    /// May return zero packets (incomplete record) or many (several buffered records
    /// completed by this call). Packets are attributed to `source_id`.
    fn decode(&mut self, source_id: &str, bytes: &[u8]) -> Result<Vec<Packet>>;

    /// Encodes a packet, queuing its bytes for [`Codec::read`].
    fn encode(&mut self, packet: Packet) -> Result<()>;

    /// Drains as many queued output bytes as fit into `buf`, returning the count.
    ///
    /// Must be callable repeatedly with buffers of any size until
    /// [`Codec::has_pending_output`] reports false.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// True while encoded bytes (or packets about to become bytes) are waiting.
    fn has_pending_output(&self) -> bool;

    /// Installs the callback fired when output becomes available asynchronously.
    fn set_output_notify(&mut self, _notify: NotifyCallback) {}

    /// Releases buffered state.
    fn close(&mut self) {}
}

impl<C> Codec for &mut C
where
    C: Codec + ?Sized,
{
    fn decode(&mut self, source_id: &str, bytes: &[u8]) -> Result<Vec<Packet>> {
        (**self).decode(source_id, bytes)
    }

    fn encode(&mut self, packet: Packet) -> Result<()> {
        (**self).encode(packet)
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        (**self).read(buf)
    }

    fn has_pending_output(&self) -> bool {
        (**self).has_pending_output()
    }

    fn set_output_notify(&mut self, notify: NotifyCallback) {
        (**self).set_output_notify(notify)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

impl<C> Codec for Box<C>
where
    C: Codec + ?Sized,
{
    fn decode(&mut self, source_id: &str, bytes: &[u8]) -> Result<Vec<Packet>> {
        (**self).decode(source_id, bytes)
    }

    fn encode(&mut self, packet: Packet) -> Result<()> {
        (**self).encode(packet)
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        (**self).read(buf)
    }

    fn has_pending_output(&self) -> bool {
        (**self).has_pending_output()
    }

    fn set_output_notify(&mut self, notify: NotifyCallback) {
        (**self).set_output_notify(notify)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Queue of encoded bytes waiting to be drained by the dispatcher.
#[derive(Debug, Default)]
pub struct OutputQueue {
    buf: BytesMut,
}

impl OutputQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes at the tail.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Copies as many bytes as fit into `buf` and removes them from the queue.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.buf.len());
        buf[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        n
    }

    /// Number of queued bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drops everything queued.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_small_steps() {
        let mut queue = OutputQueue::new();
        queue.push(b"hello ");
        queue.push(b"world");

        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        while !queue.is_empty() {
            let n = queue.read(&mut buf);
            assert!(n > 0);
            out.extend_from_slice(&buf[..n]);
        }

        assert_eq!(out, b"hello world");
        assert_eq!(queue.read(&mut buf), 0);
    }

    #[test]
    fn empty_buffer_reads_nothing() {
        let mut queue = OutputQueue::new();
        queue.push(b"x");
        assert_eq!(queue.read(&mut []), 0);
        assert_eq!(queue.len(), 1);
    }
}
