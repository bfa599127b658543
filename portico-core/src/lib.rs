//! # portico-core - Connection Pipeline Building Blocks
//!
//! `portico-core` defines the pieces every portico connection is assembled from, without
//! touching sockets or the readiness multiplexer:
//!
//! - [`Packet`]: the immutable unit of application data flowing through a connection
//! - [`Codec`]: converts a raw byte stream into packets and back, buffering partial data
//! - [`DelimiterFramer`]: the streaming delimiter scanner line-oriented codecs are built on
//! - [`Inspector`]: per-connection identity, authentication, filtering and idle timeout
//! - [`Handler`]: application logic receiving packets and producing replies
//! - [`Connection`]: the session state machine tying one socket to the stages above
//!
//! ## Event Flow
//!
//! ```text
//!                                  Dispatcher (reactor thread)
//!                 | Connection::write(bytes)               /|\ Connection::read(buf)
//!   +-------------+-----------------------------------------+--------------+
//!   |             |            Connection                   |              |
//!   |            \|/                                        |              |
//!   |    +--------+-----------------------------------------+--------+     |
//!   |    |                         Codec                             |     |
//!   |    |   decode: residual ++ bytes -> records -> packets         |     |
//!   |    |   encode: packets -> bytes -> output queue                |     |
//!   |    +--------+-----------------------------------------+--------+     |
//!   |             |                                        /|\             |
//!   |            \|/                                        |              |
//!   |    +--------+---------------+                         |              |
//!   |    |       Inspector        |                         |              |
//!   |    | Pass / Filter / AuthErr |                        |              |
//!   |    +--------+---------------+                         |              |
//!   |             |                                         |              |
//!   |            \|/                                        |              |
//!   |    +--------+-----------------------------------------+--------+     |
//!   |    |   Handler 1  ->  Handler 2  ->  ...  ->  Handler N        |     |
//!   |    |   Context.write(packet) / Handler::poll_write()  ---------+     |
//!   |    +-----------------------------------------------------------+     |
//!   +----------------------------------------------------------------------+
//! ```
//!
//! Inbound bytes are decoded by the codec, every decoded packet passes the inspector, and
//! surviving packets are delivered to every handler in declaration order. Replies go
//! straight from the handlers back into the codec; the inspector only sits on the inbound
//! path.
//!
//! ## Example
//!
//! ```rust
//! use portico_core::{Context, Handler, Packet, Result};
//!
//! struct EchoHandler;
//!
//! impl Handler for EchoHandler {
//!     fn name(&self) -> &str {
//!         "EchoHandler"
//!     }
//!
//!     fn handle_read(&mut self, ctx: &Context, packet: &Packet) -> Result<()> {
//!         ctx.write(Packet::new(ctx.connection_id(), packet.payload().clone()));
//!         Ok(())
//!     }
//! }
//! ```
#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

use std::sync::Arc;

/// Codec contract and the byte output queue shared by codec implementations
pub mod codec;

/// Per-client session state machine
pub mod connection;

/// Error and result types
pub mod error;

/// Streaming delimiter scanner with cross-call residual buffering
pub mod framer;

/// Handler contract and the per-connection context
pub mod handler;

/// Inspector contract and baseline inspectors
pub mod inspector;

/// Immutable application packets
pub mod packet;

pub use codec::{Codec, OutputQueue};
pub use connection::{Channel, Connection, ConnectionState, InterestOps};
pub use error::{AuthenticationFailure, Error, Result};
pub use framer::{DelimiterFramer, RecordDecoder};
pub use handler::{Context, Handler};
pub use inspector::{
    IdleTimeoutInspector, Inspection, Inspector, InspectorConfig, PassThroughInspector,
    TokenAuthInspector,
};
pub use packet::{Packet, Payload};

/// Callback used to tell the reactor that a connection has new output to flush.
///
/// It may be invoked from any thread, e.g. by the delay scheduler once a held packet
/// becomes due.
pub type NotifyCallback = Arc<dyn Fn() + Send + Sync>;
