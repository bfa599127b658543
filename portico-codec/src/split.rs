use portico_core::{Codec, NotifyCallback, Packet, Result};

/// Pairs independent codecs for the two directions.
///
/// Inbound bytes only ever reach `decoder`; outbound packets only ever reach `encoder`.
pub struct SplitCodec<D, E> {
    decoder: D,
    encoder: E,
}

impl<D: Codec, E: Codec> SplitCodec<D, E> {
    /// Creates a split codec.
    pub fn new(decoder: D, encoder: E) -> Self {
        Self { decoder, encoder }
    }
}

impl<D: Codec, E: Codec> Codec for SplitCodec<D, E> {
    fn decode(&mut self, source_id: &str, bytes: &[u8]) -> Result<Vec<Packet>> {
        self.decoder.decode(source_id, bytes)
    }

    fn encode(&mut self, packet: Packet) -> Result<()> {
        self.encoder.encode(packet)
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.encoder.read(buf)
    }

    fn has_pending_output(&self) -> bool {
        self.encoder.has_pending_output()
    }

    fn set_output_notify(&mut self, notify: NotifyCallback) {
        self.encoder.set_output_notify(notify);
    }

    fn close(&mut self) {
        self.decoder.close();
        self.encoder.close();
    }
}
