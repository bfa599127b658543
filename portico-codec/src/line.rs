use log::debug;
use serde::{Deserialize, Serialize};

use portico_core::{
    Codec, DelimiterFramer, Error, OutputQueue, Packet, Payload, RecordDecoder, Result,
};

use crate::charset::{Charset, ErrorPolicy};

/// Settings shared by line-oriented codecs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineConfig {
    /// Charset of the wire text
    pub charset: Charset,
    /// Handling of bytes the charset cannot decode, and characters it cannot encode
    pub error_policy: ErrorPolicy,
    /// Record separator, encoded with `charset`
    pub delimiter: String,
    /// Longest line kept buffered without a delimiter
    pub max_line_length: Option<usize>,
    /// Drop a trailing `\r` from decoded lines. Off by default, so a line is exactly the
    /// bytes between two delimiters.
    pub strip_carriage_return: bool,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            charset: Charset::Utf8,
            error_policy: ErrorPolicy::Replace,
            delimiter: "\n".to_owned(),
            max_line_length: None,
            strip_carriage_return: false,
        }
    }
}

impl LineConfig {
    /// Checks the values that would make a codec unusable.
    pub fn validate(&self) -> Result<()> {
        if self.delimiter.is_empty() {
            return Err(Error::Config("line delimiter must not be empty".to_owned()));
        }
        if self.max_line_length == Some(0) {
            return Err(Error::Config("max_line_length must be positive".to_owned()));
        }
        Ok(())
    }
}

/// Hook turning one decoded line into a payload. `None` drops the line.
pub trait StringDecoder {
    /// Converts `line`, received from `source_id`.
    fn decode_string(&mut self, source_id: &str, line: String) -> Option<Payload>;
}

impl<F> StringDecoder for F
where
    F: FnMut(&str, String) -> Option<Payload>,
{
    fn decode_string(&mut self, source_id: &str, line: String) -> Option<Payload> {
        self(source_id, line)
    }
}

/// Identity hook: every line becomes a [`Payload::Text`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TextDecoder;

impl StringDecoder for TextDecoder {
    fn decode_string(&mut self, _source_id: &str, line: String) -> Option<Payload> {
        Some(Payload::Text(line))
    }
}

/// Record decoder applying charset decoding and a [`StringDecoder`] hook.
#[derive(Debug)]
pub struct LineDecoder<D> {
    charset: Charset,
    policy: ErrorPolicy,
    strip_carriage_return: bool,
    hook: D,
}

impl<D: StringDecoder> RecordDecoder for LineDecoder<D> {
    fn decode_record(&mut self, source_id: &str, record: &[u8]) -> Vec<Packet> {
        let record = match record {
            [line @ .., b'\r'] if self.strip_carriage_return => line,
            _ => record,
        };
        let line = match self.charset.decode(record, self.policy) {
            Ok(line) => line,
            Err(err) => {
                debug!("dropping line from {}: {}", source_id, err);
                return Vec::new();
            }
        };
        self.hook
            .decode_string(source_id, line)
            .map(|payload| Packet::new(source_id, payload))
            .into_iter()
            .collect()
    }
}

/// Delimiter-framed text codec.
///
/// Inbound records are decoded with the configured charset and passed through the
/// [`StringDecoder`] hook. Outbound, text is charset-encoded, raw bytes are written as-is
/// and structured values are written as JSON text; every packet is followed by the
/// delimiter.
#[derive(Debug)]
pub struct LineCodec<D = TextDecoder> {
    framer: DelimiterFramer,
    lines: LineDecoder<D>,
    output: OutputQueue,
}

impl LineCodec<TextDecoder> {
    /// Creates a plain text line codec.
    pub fn new(config: &LineConfig) -> Result<Self> {
        Self::with_decoder(config, TextDecoder)
    }
}

impl<D: StringDecoder> LineCodec<D> {
    /// Creates a line codec with a custom line hook.
    pub fn with_decoder(config: &LineConfig, hook: D) -> Result<Self> {
        config.validate()?;
        let delimiter = config.charset.encode(&config.delimiter, ErrorPolicy::Strict)?;
        let mut framer = DelimiterFramer::new(delimiter)?;
        if let Some(max) = config.max_line_length {
            framer = framer.with_max_record_len(max);
        }
        Ok(Self {
            framer,
            lines: LineDecoder {
                charset: config.charset,
                policy: config.error_policy,
                strip_carriage_return: config.strip_carriage_return,
                hook,
            },
            output: OutputQueue::new(),
        })
    }

    /// Bytes received but not yet terminated by a delimiter.
    pub fn residual(&self) -> &[u8] {
        self.framer.residual()
    }

    fn push_text(&mut self, text: &str) -> Result<()> {
        let bytes = self.lines.charset.encode(text, self.lines.policy)?;
        self.output.push(&bytes);
        Ok(())
    }
}

impl<D: StringDecoder> Codec for LineCodec<D> {
    fn decode(&mut self, source_id: &str, bytes: &[u8]) -> Result<Vec<Packet>> {
        Ok(self.framer.frame(source_id, bytes, &mut self.lines))
    }

    fn encode(&mut self, packet: Packet) -> Result<()> {
        match packet.payload() {
            Payload::Text(text) => self.push_text(text)?,
            Payload::Raw(bytes) => self.output.push(bytes),
            Payload::Value(value) => {
                let text =
                    serde_json::to_string(value).map_err(|err| Error::Encode(err.to_string()))?;
                self.push_text(&text)?;
            }
        }
        self.output.push(self.framer.delimiter());
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.output.read(buf)
    }

    fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    fn close(&mut self) {
        self.framer.clear();
        self.output.clear();
    }
}
