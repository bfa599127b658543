//! ### What is portico?
//! portico is the core of an event-driven TCP server: one reactor thread multiplexes many client
//! sockets, turns their byte streams into packets through composable codecs, screens the packets
//! with a per-connection inspector and hands the survivors to application handlers. The set of
//! listening ports follows a topology source that can change while the server runs.
//!
//! ### How does a packet flow?
//! ```text
//!   socket bytes ──► Codec::decode ──► Inspector::inspect ──► Handler 1 .. Handler N
//!                                                                   │
//!   socket bytes ◄── Codec::read ◄── Codec::encode ◄── Context::write
//! ```
//!
//! ### Crates
//! - the crate root: packets, the codec/inspector/handler contracts and the connection state
//!   machine
//! - [`codec`]: line, JSON, DEFLATE, delay and split codecs
//! - [`timer`]: the delay scheduler worker behind the delay codec
//! - [`bootstrap`]: the dispatcher, listener registry and topology sources
//!
//! ### Example
//! ```rust,no_run
//! use portico::bootstrap::{ComponentRegistry, Dispatcher, FileTopology, ServerConfig};
//! use portico::{Context, Handler, Packet, Result};
//!
//! struct EchoHandler;
//!
//! impl Handler for EchoHandler {
//!     fn name(&self) -> &str {
//!         "EchoHandler"
//!     }
//!
//!     fn handle_read(&mut self, ctx: &Context, packet: &Packet) -> Result<()> {
//!         ctx.write(packet.clone());
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = ComponentRegistry::new();
//! registry.register_handler("echo", |_: serde_json::Value, _: &Context| {
//!     Ok(Box::new(EchoHandler) as Box<dyn Handler>)
//! });
//!
//! let topology = FileTopology::new("topology.json");
//! let mut dispatcher = Dispatcher::new(ServerConfig::new(), registry, topology).unwrap();
//! let (_stop_tx, stop_rx) = crossbeam_channel::bounded(1);
//! dispatcher.run(&stop_rx).unwrap();
//! ```
#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

pub use portico_bootstrap as bootstrap;
pub use portico_codec as codec;
pub use portico_timer as timer;

pub use portico_core::{
    AuthenticationFailure, Channel, Codec, Connection, ConnectionState, Context, DelimiterFramer,
    Error, Handler, IdleTimeoutInspector, Inspection, Inspector, InspectorConfig, InterestOps,
    NotifyCallback, OutputQueue, Packet, PassThroughInspector, Payload, RecordDecoder, Result,
    TokenAuthInspector,
};
