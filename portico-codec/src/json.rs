use log::debug;

use portico_core::{Payload, Result};

use crate::line::{LineCodec, LineConfig, StringDecoder};

/// Line hook parsing every line as one JSON document.
///
/// Blank lines are skipped. A line that is not valid JSON is dropped and decoding goes on
/// with the next one.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDecoder;

impl StringDecoder for JsonDecoder {
    fn decode_string(&mut self, source_id: &str, line: String) -> Option<Payload> {
        if line.trim().is_empty() {
            return None;
        }
        match serde_json::from_str(&line) {
            Ok(value) => Some(Payload::Value(value)),
            Err(err) => {
                debug!("dropping malformed json from {}: {}", source_id, err);
                None
            }
        }
    }
}

/// JSON-over-lines codec.
pub type JsonCodec = LineCodec<JsonDecoder>;

impl LineCodec<JsonDecoder> {
    /// Creates a JSON-over-lines codec.
    pub fn json(config: &LineConfig) -> Result<Self> {
        Self::with_decoder(config, JsonDecoder)
    }
}
