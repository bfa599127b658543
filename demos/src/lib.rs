//! # Portico Demos
//!
//! Small handlers showing how applications plug into portico, plus the `echo_server`
//! example wiring them to a live topology.
//!
//! ## Running Examples
//!
//! ```bash
//! cargo run --example echo_server -- --debug --port 7000
//! cargo run --example echo_server -- --debug --config demos/topology.json
//! ```
//!
//! and try `nc 127.0.0.1 7000` in another shell.

#![warn(rust_2018_idioms)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use log::{debug, info};
use serde::Deserialize;

use portico_bootstrap::ComponentRegistry;
use portico_core::{Context, Handler, Packet, Payload, Result};

/// Writes every packet back unchanged.
pub struct EchoHandler;

impl Handler for EchoHandler {
    fn name(&self) -> &str {
        "EchoHandler"
    }

    fn handle_read(&mut self, ctx: &Context, packet: &Packet) -> Result<()> {
        ctx.write(packet.clone());
        Ok(())
    }
}

/// Settings of [`UppercaseHandler`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UppercaseConfig {
    /// Text put in front of every reply
    pub prefix: String,
}

/// Replies with the upper-cased text of every text packet; other payloads are ignored.
pub struct UppercaseHandler {
    prefix: String,
}

impl UppercaseHandler {
    /// Creates the handler from its settings.
    pub fn new(config: UppercaseConfig) -> Self {
        Self {
            prefix: config.prefix,
        }
    }
}

impl Handler for UppercaseHandler {
    fn name(&self) -> &str {
        "UppercaseHandler"
    }

    fn handle_read(&mut self, ctx: &Context, packet: &Packet) -> Result<()> {
        if let Some(text) = packet.payload().as_text() {
            ctx.write(packet.with_payload(format!("{}{}", self.prefix, text.to_uppercase())));
        }
        Ok(())
    }
}

/// Members of a chat room, keyed by peer address.
#[derive(Default)]
pub struct Room {
    peers: BTreeMap<String, Context>,
}

impl Room {
    /// Creates an empty room.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connected members.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when nobody is connected.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn join(&mut self, ctx: &Context) {
        info!("{} joined", ctx.remote_addr());
        self.peers.insert(ctx.remote_addr().to_string(), ctx.clone());
    }

    fn leave(&mut self, ctx: &Context) {
        info!("{} left", ctx.remote_addr());
        self.peers.remove(&ctx.remote_addr().to_string());
    }

    /// Sends `text` to every member except `sender`.
    fn broadcast(&self, sender: &Context, text: &str) {
        let sender_key = sender.remote_addr().to_string();
        let message = format!("{}: {}", sender.connection_id(), text);
        for (peer, ctx) in self.peers.iter() {
            if *peer != sender_key {
                ctx.write(Packet::new(sender.connection_id(), message.clone()));
                // Output produced outside the receiver's own read path.
                ctx.refresh_interest_ops();
            }
        }
    }
}

/// Relays every text line to all other connections sharing the same [`Room`].
pub struct ChatHandler {
    room: Rc<RefCell<Room>>,
}

impl ChatHandler {
    /// Creates a handler attached to `room`.
    pub fn new(room: Rc<RefCell<Room>>) -> Self {
        Self { room }
    }
}

impl Handler for ChatHandler {
    fn name(&self) -> &str {
        "ChatHandler"
    }

    fn transport_active(&mut self, ctx: &Context) {
        self.room.borrow_mut().join(ctx);
    }

    fn handle_read(&mut self, ctx: &Context, packet: &Packet) -> Result<()> {
        let text = match packet.payload() {
            Payload::Text(text) => text.clone(),
            Payload::Value(value) => value.to_string(),
            Payload::Raw(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        };
        debug!("{} says {}", ctx.connection_id(), text);
        self.room.borrow().broadcast(ctx, &text);
        Ok(())
    }

    fn close(&mut self, ctx: &Context) {
        self.room.borrow_mut().leave(ctx);
    }
}

/// Registry with the demo handlers under `echo`, `uppercase` and `chat`.
///
/// Every `chat` handler built from this registry shares one room.
pub fn default_registry() -> ComponentRegistry {
    let room = Rc::new(RefCell::new(Room::new()));
    let mut registry = ComponentRegistry::new();
    registry
        .register_handler("echo", |_: serde::de::IgnoredAny, _: &Context| {
            Ok(Box::new(EchoHandler) as Box<dyn Handler>)
        })
        .register_handler("uppercase", |config: UppercaseConfig, _: &Context| {
            Ok(Box::new(UppercaseHandler::new(config)) as Box<dyn Handler>)
        })
        .register_handler("chat", move |_: serde::de::IgnoredAny, _: &Context| {
            Ok(Box::new(ChatHandler::new(Rc::clone(&room))) as Box<dyn Handler>)
        });
    registry
}
