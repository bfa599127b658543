use std::time::Duration;

use serde::{Deserialize, Serialize};

use portico_core::{Codec, Error, Packet, Result};
use portico_timer::SchedulerHandle;

use crate::deflate::DeflateCodec;
use crate::delay::DelayCodec;
use crate::json::JsonCodec;
use crate::line::{LineCodec, LineConfig};
use crate::split::SplitCodec;

fn default_level() -> u32 {
    6
}

/// Typed description of a (possibly nested) codec.
///
/// ```json
/// {"type": "deflate", "level": 6, "inner": {"type": "json"}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodecConfig {
    /// Text lines
    Line(LineConfig),
    /// One JSON document per line
    Json(LineConfig),
    /// Raw DEFLATE around another codec
    Deflate {
        /// Compression level, 0 to 9
        #[serde(default = "default_level")]
        level: u32,
        /// Codec seeing the plain bytes
        inner: Box<CodecConfig>,
    },
    /// Output delay around another codec
    Delay {
        /// Delay applied to every outbound packet, in milliseconds
        delay_ms: u64,
        /// Codec encoding the delayed packets
        inner: Box<CodecConfig>,
    },
    /// Different codecs per direction
    Split {
        /// Inbound codec
        decoder: Box<CodecConfig>,
        /// Outbound codec
        encoder: Box<CodecConfig>,
    },
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig::Line(LineConfig::default())
    }
}

impl CodecConfig {
    /// Short tag naming the codec kind.
    pub fn tag(&self) -> &'static str {
        match self {
            CodecConfig::Line(_) => "line",
            CodecConfig::Json(_) => "json",
            CodecConfig::Deflate { .. } => "deflate",
            CodecConfig::Delay { .. } => "delay",
            CodecConfig::Split { .. } => "split",
        }
    }

    /// Checks the whole codec tree.
    pub fn validate(&self) -> Result<()> {
        match self {
            CodecConfig::Line(line) | CodecConfig::Json(line) => line.validate(),
            CodecConfig::Deflate { level, inner } => {
                if *level > 9 {
                    return Err(Error::Config(format!(
                        "deflate level {} is outside 0..=9",
                        level
                    )));
                }
                inner.validate()
            }
            CodecConfig::Delay { inner, .. } => inner.validate(),
            CodecConfig::Split { decoder, encoder } => {
                decoder.validate()?;
                encoder.validate()
            }
        }
    }

    /// True when building this codec needs a delay scheduler.
    pub fn needs_scheduler(&self) -> bool {
        match self {
            CodecConfig::Line(_) | CodecConfig::Json(_) => false,
            CodecConfig::Delay { .. } => true,
            CodecConfig::Deflate { inner, .. } => inner.needs_scheduler(),
            CodecConfig::Split { decoder, encoder } => {
                decoder.needs_scheduler() || encoder.needs_scheduler()
            }
        }
    }

    /// Builds a fresh codec instance for one connection.
    pub fn build(&self, scheduler: Option<&SchedulerHandle<Packet>>) -> Result<Box<dyn Codec>> {
        let codec: Box<dyn Codec> = match self {
            CodecConfig::Line(line) => Box::new(LineCodec::new(line)?),
            CodecConfig::Json(line) => Box::new(JsonCodec::json(line)?),
            CodecConfig::Deflate { level, inner } => {
                Box::new(DeflateCodec::new(inner.build(scheduler)?, *level))
            }
            CodecConfig::Delay { delay_ms, inner } => {
                let scheduler = scheduler.ok_or_else(|| Error::Construction {
                    kind: "codec",
                    tag: self.tag().to_owned(),
                    reason: "no delay scheduler is running".to_owned(),
                })?;
                Box::new(DelayCodec::new(
                    inner.build(Some(scheduler))?,
                    Duration::from_millis(*delay_ms),
                    scheduler.clone(),
                ))
            }
            CodecConfig::Split { decoder, encoder } => Box::new(SplitCodec::new(
                decoder.build(scheduler)?,
                encoder.build(scheduler)?,
            )),
        };
        Ok(codec)
    }
}
