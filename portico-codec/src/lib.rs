//! # portico-codec - Framing and Serialization Codecs
//!
//! Concrete [`Codec`](portico_core::Codec) implementations for portico connections. Every
//! codec is a stateful, per-connection instance: partial records and queued output live
//! inside it and nothing is shared between connections.
//!
//! ## Codecs
//!
//! - [`LineCodec`]: delimiter-framed text with a configurable charset and error policy
//! - [`JsonCodec`]: one JSON document per line; malformed lines are skipped
//! - [`DeflateCodec`]: raw DEFLATE around any other codec, sync-flushed per batch
//! - [`DelayCodec`]: holds outbound packets back on the shared delay scheduler
//! - [`SplitCodec`]: independent codecs for the inbound and outbound directions
//!
//! Codecs nest freely; [`CodecConfig`] describes such a tree and builds it:
//!
//! ```rust
//! use portico_codec::CodecConfig;
//! use portico_core::Codec;
//!
//! let config: CodecConfig = serde_json::from_str(
//!     r#"{"type": "deflate", "inner": {"type": "json"}}"#,
//! ).unwrap();
//! let codec = config.build(None).unwrap();
//! assert!(!codec.has_pending_output());
//! ```
#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

mod charset;
mod config;
mod deflate;
mod delay;
mod json;
mod line;
mod split;

pub use charset::{Charset, ErrorPolicy};
pub use config::CodecConfig;
pub use deflate::{DeflateCodec, BUFFER_SIZE};
pub use delay::{DelayCodec, DUE_CAPACITY};
pub use json::{JsonCodec, JsonDecoder};
pub use line::{LineCodec, LineConfig, LineDecoder, StringDecoder, TextDecoder};
pub use split::SplitCodec;
