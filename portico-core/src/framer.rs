//! Streaming delimiter scanner.
//!
//! [`DelimiterFramer`] splits a byte stream into records separated by an arbitrary byte
//! delimiter. Bytes that do not yet form a complete record are kept as residual and
//! prefixed to the next call, so a delimiter may straddle any number of reads.
//!
//! The scan keeps a match depth (how many delimiter bytes are currently matched) across
//! calls and falls back along a prefix table on mismatch. Every input byte is examined
//! exactly once; resuming with the saved depth is equivalent to rescanning the last
//! `delimiter.len() - 1` bytes of the previous call.

use bytes::{Bytes, BytesMut};
use log::warn;

use crate::{Error, Packet, Result};

/// Extension point turning one complete record into packets.
pub trait RecordDecoder {
    /// Decodes one record (delimiter excluded).
    fn decode_record(&mut self, source_id: &str, record: &[u8]) -> Vec<Packet>;
}

impl<F> RecordDecoder for F
where
    F: FnMut(&str, &[u8]) -> Vec<Packet>,
{
    fn decode_record(&mut self, source_id: &str, record: &[u8]) -> Vec<Packet> {
        self(source_id, record)
    }
}

/// Splits a byte stream on a delimiter, carrying partial records across calls.
#[derive(Debug)]
pub struct DelimiterFramer {
    delimiter: Vec<u8>,
    /// `fallback[i]`: longest proper prefix of `delimiter[..=i]` that is also its suffix
    fallback: Vec<usize>,
    residual: BytesMut,
    depth: usize,
    max_record_len: Option<usize>,
}

impl DelimiterFramer {
    /// Creates a framer for `delimiter`. The delimiter must not be empty.
    pub fn new(delimiter: impl Into<Vec<u8>>) -> Result<Self> {
        let delimiter = delimiter.into();
        if delimiter.is_empty() {
            return Err(Error::Config("delimiter must not be empty".to_owned()));
        }
        let fallback = prefix_table(&delimiter);
        Ok(Self {
            delimiter,
            fallback,
            residual: BytesMut::new(),
            depth: 0,
            max_record_len: None,
        })
    }

    /// Caps the residual size. A residual growing past `max` without a delimiter is dropped.
    pub fn with_max_record_len(mut self, max: usize) -> Self {
        self.max_record_len = Some(max);
        self
    }

    /// The delimiter bytes.
    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Bytes received but not yet part of a complete record.
    pub fn residual(&self) -> &[u8] {
        &self.residual
    }

    /// Appends `bytes` and returns every record completed by them.
    pub fn split(&mut self, bytes: &[u8]) -> Vec<Bytes> {
        let scan_from = self.residual.len();
        self.residual.extend_from_slice(bytes);

        let len = self.delimiter.len();
        let mut ends = Vec::new();
        for i in scan_from..self.residual.len() {
            let b = self.residual[i];
            while self.depth > 0 && self.delimiter[self.depth] != b {
                self.depth = self.fallback[self.depth - 1];
            }
            if self.delimiter[self.depth] == b {
                self.depth += 1;
            }
            if self.depth == len {
                ends.push(i + 1);
                self.depth = 0;
            }
        }

        let mut records = Vec::with_capacity(ends.len());
        let mut consumed = 0;
        for end in ends {
            let mut record = self.residual.split_to(end - consumed);
            consumed = end;
            record.truncate(record.len() - len);
            records.push(record.freeze());
        }

        if let Some(max) = self.max_record_len {
            if self.residual.len() > max {
                warn!(
                    "dropping {} buffered bytes without a delimiter (limit {})",
                    self.residual.len(),
                    max
                );
                self.residual.clear();
                self.depth = 0;
            }
        }

        records
    }

    /// Appends `bytes` and feeds every completed record to `decoder`.
    pub fn frame<D>(&mut self, source_id: &str, bytes: &[u8], decoder: &mut D) -> Vec<Packet>
    where
        D: RecordDecoder + ?Sized,
    {
        self.split(bytes)
            .iter()
            .flat_map(|record| decoder.decode_record(source_id, record))
            .collect()
    }

    /// Forgets the residual.
    pub fn clear(&mut self) {
        self.residual.clear();
        self.depth = 0;
    }
}

fn prefix_table(pattern: &[u8]) -> Vec<usize> {
    let mut table = vec![0; pattern.len()];
    let mut k = 0;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = table[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        table[i] = k;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn split_all(delimiter: &[u8], chunks: &[&[u8]]) -> (Vec<Vec<u8>>, Vec<u8>) {
        let mut framer = DelimiterFramer::new(delimiter.to_vec()).unwrap();
        let mut records = Vec::new();
        for chunk in chunks {
            records.extend(framer.split(chunk).into_iter().map(|b| b.to_vec()));
        }
        (records, framer.residual().to_vec())
    }

    #[rstest]
    #[case::newline("\n", &["a\nbb\n", "ccc"], &["a", "bb"], "ccc")]
    #[case::crlf_straddling("\r\n", &["one\r", "\ntwo\r\n"], &["one", "two"], "")]
    #[case::empty_records("\n", &["\n\n"], &["", ""], "")]
    #[case::overlapping("aab", &["xaa", "aabyaab"], &["xaa", "y"], "")]
    #[case::no_delimiter("||", &["abc", "|", "def"], &[], "abc|def")]
    fn splits_records(
        #[case] delimiter: &str,
        #[case] chunks: &[&str],
        #[case] expected: &[&str],
        #[case] residual: &str,
    ) {
        let chunks: Vec<&[u8]> = chunks.iter().map(|c| c.as_bytes()).collect();
        let (records, rest) = split_all(delimiter.as_bytes(), &chunks);
        let expected: Vec<Vec<u8>> = expected.iter().map(|r| r.as_bytes().to_vec()).collect();
        assert_eq!(records, expected);
        assert_eq!(rest, residual.as_bytes());
    }

    #[test]
    fn rejects_empty_delimiter() {
        assert!(matches!(DelimiterFramer::new(Vec::new()), Err(Error::Config(_))));
    }

    #[test]
    fn oversized_residual_is_dropped() {
        let mut framer = DelimiterFramer::new(b"\n".to_vec())
            .unwrap()
            .with_max_record_len(4);
        assert!(framer.split(b"abcdef").is_empty());
        assert!(framer.residual().is_empty());
        assert_eq!(framer.split(b"xy\n"), vec![Bytes::from_static(b"xy")]);
    }

    #[test]
    fn frame_feeds_decoder_in_order() {
        let mut framer = DelimiterFramer::new(b";".to_vec()).unwrap();
        let mut decoder = |source: &str, record: &[u8]| {
            vec![Packet::new(source, String::from_utf8_lossy(record).into_owned())]
        };
        let packets = framer.frame("peer", b"x;y;z", &mut decoder);
        let texts: Vec<_> = packets
            .iter()
            .map(|p| p.payload().as_text().unwrap().to_owned())
            .collect();
        assert_eq!(texts, vec!["x", "y"]);
        assert!(packets.iter().all(|p| p.source_id() == "peer"));
        assert_eq!(framer.residual(), b"z");
    }

    fn cut(data: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
        let mut points: Vec<usize> = cuts.iter().map(|c| c % (data.len() + 1)).collect();
        points.sort_unstable();
        let mut chunks = Vec::new();
        let mut start = 0;
        for p in points {
            chunks.push(data[start..p].to_vec());
            start = p;
        }
        chunks.push(data[start..].to_vec());
        chunks
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_records(
            data in proptest::collection::vec(prop_oneof![Just(b'a'), Just(b'b'), Just(b'\r'), Just(b'\n')], 0..256),
            cuts in proptest::collection::vec(any::<usize>(), 0..8),
        ) {
            let delimiter = b"\r\n";
            let (whole, whole_rest) = split_all(delimiter, &[&data]);

            let chunks = cut(&data, &cuts);
            let chunk_refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
            let (chunked, chunked_rest) = split_all(delimiter, &chunk_refs);

            prop_assert_eq!(&whole, &chunked);
            prop_assert_eq!(&whole_rest, &chunked_rest);

            let occurrences = {
                let (mut count, mut i) = (0, 0);
                while i + 1 < data.len() {
                    if &data[i..i + 2] == delimiter { count += 1; i += 2; } else { i += 1; }
                }
                count
            };
            prop_assert_eq!(whole.len(), occurrences);
        }

        #[test]
        fn no_byte_lost_or_duplicated(
            data in proptest::collection::vec(prop_oneof![Just(b'x'), Just(b'|'), Just(b'#')], 0..256),
            cuts in proptest::collection::vec(any::<usize>(), 0..8),
        ) {
            let delimiter = b"|#|";
            let chunks = cut(&data, &cuts);
            let chunk_refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
            let (records, rest) = split_all(delimiter, &chunk_refs);

            let mut rebuilt = Vec::new();
            for record in &records {
                rebuilt.extend_from_slice(record);
                rebuilt.extend_from_slice(delimiter);
            }
            rebuilt.extend_from_slice(&rest);
            prop_assert_eq!(rebuilt, data);
        }
    }
}
