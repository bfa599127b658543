use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use log::warn;

use portico_core::{Codec, Error, NotifyCallback, OutputQueue, Packet, Result};

/// Size of the per-instance inflate, deflate and plain-text scratch buffers.
pub const BUFFER_SIZE: usize = 8192;

/// Raw DEFLATE wrapper around another codec.
///
/// Inbound bytes are inflated and the plain text is handed to the inner codec. Outbound,
/// everything the inner codec produced is compressed and sync-flushed, so the peer can
/// decode each drained batch without waiting for more data.
pub struct DeflateCodec<C> {
    inner: C,
    inflate: Decompress,
    deflate: Compress,
    inflated: Box<[u8]>,
    plain: Box<[u8]>,
    deflated: Box<[u8]>,
    output: OutputQueue,
}

impl<C: Codec> DeflateCodec<C> {
    /// Wraps `inner`, compressing at `level` (0 to 9).
    pub fn new(inner: C, level: u32) -> Self {
        Self {
            inner,
            inflate: Decompress::new(false),
            deflate: Compress::new(Compression::new(level.min(9)), false),
            inflated: vec![0; BUFFER_SIZE].into_boxed_slice(),
            plain: vec![0; BUFFER_SIZE].into_boxed_slice(),
            deflated: vec![0; BUFFER_SIZE].into_boxed_slice(),
            output: OutputQueue::new(),
        }
    }

    /// The wrapped codec.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn compress_pending(&mut self) -> Result<()> {
        let mut drained = false;
        loop {
            let n = self.inner.read(&mut self.plain);
            if n == 0 {
                break;
            }
            drained = true;
            deflate_into(
                &mut self.deflate,
                &self.plain[..n],
                FlushCompress::None,
                &mut self.deflated,
                &mut self.output,
            )?;
        }
        if drained {
            deflate_into(
                &mut self.deflate,
                &[],
                FlushCompress::Sync,
                &mut self.deflated,
                &mut self.output,
            )?;
        }
        Ok(())
    }
}

fn deflate_into(
    deflate: &mut Compress,
    mut input: &[u8],
    flush: FlushCompress,
    scratch: &mut [u8],
    output: &mut OutputQueue,
) -> Result<()> {
    loop {
        let (before_in, before_out) = (deflate.total_in(), deflate.total_out());
        deflate
            .compress(input, scratch, flush)
            .map_err(|err| Error::Encode(err.to_string()))?;
        let consumed = (deflate.total_in() - before_in) as usize;
        let produced = (deflate.total_out() - before_out) as usize;

        output.push(&scratch[..produced]);
        input = &input[consumed..];
        if produced < scratch.len() && input.is_empty() {
            return Ok(());
        }
        if consumed == 0 && produced == 0 {
            return Ok(());
        }
    }
}

impl<C: Codec> Codec for DeflateCodec<C> {
    fn decode(&mut self, source_id: &str, bytes: &[u8]) -> Result<Vec<Packet>> {
        let mut packets = Vec::new();
        let mut input = bytes;
        loop {
            let (before_in, before_out) = (self.inflate.total_in(), self.inflate.total_out());
            let status = self
                .inflate
                .decompress(input, &mut self.inflated, FlushDecompress::None)
                .map_err(|err| Error::Decode(err.to_string()))?;
            let consumed = (self.inflate.total_in() - before_in) as usize;
            let produced = (self.inflate.total_out() - before_out) as usize;
            input = &input[consumed..];

            if produced > 0 {
                packets.extend(self.inner.decode(source_id, &self.inflated[..produced])?);
            }
            if status == Status::StreamEnd {
                self.inflate.reset(false);
                if input.is_empty() {
                    break;
                }
                continue;
            }
            if produced < self.inflated.len() && input.is_empty() {
                break;
            }
            if consumed == 0 && produced == 0 {
                break;
            }
        }
        Ok(packets)
    }

    fn encode(&mut self, packet: Packet) -> Result<()> {
        self.inner.encode(packet)
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        if let Err(err) = self.compress_pending() {
            warn!("compressing output failed: {}", err);
        }
        self.output.read(buf)
    }

    fn has_pending_output(&self) -> bool {
        !self.output.is_empty() || self.inner.has_pending_output()
    }

    fn set_output_notify(&mut self, notify: NotifyCallback) {
        self.inner.set_output_notify(notify);
    }

    fn close(&mut self) {
        self.inner.close();
        self.output.clear();
        self.inflate.reset(false);
        self.deflate.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::{LineCodec, LineConfig};
    use flate2::write::{DeflateDecoder, DeflateEncoder};
    use std::io::Write;

    fn line_deflate() -> DeflateCodec<LineCodec> {
        DeflateCodec::new(LineCodec::new(&LineConfig::default()).unwrap(), 6)
    }

    fn drain(codec: &mut impl Codec, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        while codec.has_pending_output() {
            let n = codec.read(&mut buf);
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    fn texts(packets: &[Packet]) -> Vec<String> {
        packets
            .iter()
            .map(|p| p.payload().as_text().unwrap_or_default().to_owned())
            .collect()
    }

    fn round_trip(lines: &[String], chunk: usize) {
        let mut sender = line_deflate();
        let mut receiver = line_deflate();
        for line in lines {
            sender.encode(Packet::new("s", line.as_str())).unwrap();
        }
        let wire = drain(&mut sender, 7);

        let mut packets = Vec::new();
        for piece in wire.chunks(chunk) {
            packets.extend(receiver.decode("s", piece).unwrap());
        }
        assert_eq!(texts(&packets), lines);
    }

    #[test]
    fn round_trips_small_lines() {
        let lines: Vec<String> = (0..20).map(|i| format!("line number {}", i)).collect();
        round_trip(&lines, 3);
        round_trip(&lines, 4096);
    }

    #[test]
    fn round_trips_at_buffer_boundary() {
        // with the delimiter each line is exactly one scratch buffer
        let exact = "x".repeat(BUFFER_SIZE - 1);
        let over = "y".repeat(BUFFER_SIZE);
        let lines = vec![exact, over, "z".repeat(3 * BUFFER_SIZE + 17)];
        round_trip(&lines, 1);
        round_trip(&lines, BUFFER_SIZE);
    }

    #[test]
    fn output_is_sync_flushed() {
        let mut codec = line_deflate();
        codec.encode(Packet::new("s", "hello")).unwrap();
        let wire = drain(&mut codec, 64);
        assert!(wire.ends_with(&[0x00, 0x00, 0xff, 0xff]));

        let mut plain = DeflateDecoder::new(Vec::new());
        plain.write_all(&wire).unwrap();
        plain.flush().unwrap();
        assert_eq!(plain.get_ref().as_slice(), b"hello\n");
    }

    #[test]
    fn decodes_foreign_raw_deflate() {
        let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"from a peer\nsecond\n").unwrap();
        let wire = encoder.finish().unwrap();

        let mut codec = line_deflate();
        let packets = codec.decode("peer", &wire).unwrap();
        assert_eq!(texts(&packets), vec!["from a peer", "second"]);
    }

    #[test]
    fn corrupt_stream_is_an_error() {
        let mut codec = line_deflate();
        assert!(matches!(
            codec.decode("peer", &[0xff; 16]),
            Err(Error::Decode(_))
        ));
    }
}
