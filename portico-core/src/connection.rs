use std::io;

use log::{debug, info, trace, warn};

use crate::{Codec, Context, Error, Handler, Inspection, Inspector, Packet, Result};

/// The socket side of a connection, as far as the connection itself is concerned.
///
/// Reading and writing the socket is the dispatcher's job; the connection only needs to be
/// able to shut it down.
pub trait Channel {
    /// Shuts the channel down.
    fn close(&mut self) -> io::Result<()>;
}

/// Lifecycle of a [`Connection`]. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Data flows in both directions
    Open,
    /// Close in progress: stages are being released
    Closing,
    /// Everything released
    Closed,
}

/// Readiness a connection wants to be woken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestOps {
    /// Inbound data only
    Read,
    /// Inbound data and room to flush pending output
    ReadWrite,
}

impl InterestOps {
    /// True for [`InterestOps::ReadWrite`].
    pub fn wants_write(&self) -> bool {
        matches!(self, InterestOps::ReadWrite)
    }
}

struct Pipeline {
    codec: Box<dyn Codec>,
    inspector: Box<dyn Inspector>,
    handlers: Vec<Box<dyn Handler>>,
}

/// Session state of one accepted client.
///
/// The connection is socket-shaped from the dispatcher's point of view: inbound bytes are
/// *written* into it with [`Connection::write`] and outbound bytes are *read* out of it
/// with [`Connection::read`].
pub struct Connection<S: Channel> {
    channel: Option<S>,
    ctx: Context,
    pipeline: Option<Pipeline>,
    state: ConnectionState,
    id: String,
    interest: InterestOps,
}

impl<S: Channel> Connection<S> {
    /// Assembles a connection and activates its handlers.
    ///
    /// The codec receives the context's interest callback so asynchronously produced output
    /// can wake the reactor.
    pub fn new(
        channel: S,
        ctx: Context,
        mut codec: Box<dyn Codec>,
        inspector: Box<dyn Inspector>,
        mut handlers: Vec<Box<dyn Handler>>,
    ) -> Self {
        if let Some(notify) = ctx.interest_notify() {
            codec.set_output_notify(notify);
        }
        let id = inspector.id().to_owned();
        ctx.set_connection_id(&id);
        for handler in handlers.iter_mut() {
            handler.transport_active(&ctx);
        }

        Self {
            channel: Some(channel),
            ctx,
            pipeline: Some(Pipeline {
                codec,
                inspector,
                handlers,
            }),
            state: ConnectionState::Open,
            id,
            interest: InterestOps::Read,
        }
    }

    /// Current connection id. After close, the last id the inspector reported.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the listener that accepted this connection.
    pub fn listener_id(&self) -> &str {
        self.ctx.listener_id()
    }

    /// The handler-facing context.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// The underlying channel, until the connection is closed.
    pub fn channel_mut(&mut self) -> Option<&mut S> {
        self.channel.as_mut()
    }

    /// Lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True until [`Connection::close`] starts.
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Last computed interest.
    pub fn interest(&self) -> InterestOps {
        self.interest
    }

    /// Feeds inbound bytes through codec, inspector and handlers.
    ///
    /// Returns the number of bytes consumed, which is always all of them. A decode error
    /// or an authentication failure closes the connection; in the latter case the packets
    /// following the rejected one are discarded unseen.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        let Some(pipeline) = self.pipeline.as_mut() else {
            return Err(Error::Closed);
        };
        trace!("connection {} received {} bytes", self.id, bytes.len());

        let packets = match pipeline.codec.decode(&self.id, bytes) {
            Ok(packets) => packets,
            Err(err) => {
                warn!("closing connection {}: {}", self.id, err);
                self.close();
                return Err(err);
            }
        };

        for packet in packets {
            let Some(pipeline) = self.pipeline.as_mut() else {
                break;
            };
            let inspected = pipeline.inspector.inspect(packet);

            let id = pipeline.inspector.id();
            if id != self.id {
                debug!("connection {} is now known as {}", self.id, id);
                self.id = id.to_owned();
                self.ctx.set_connection_id(id);
            }

            match inspected {
                Ok(Inspection::Pass(packet)) => {
                    for handler in pipeline.handlers.iter_mut() {
                        if let Err(err) = handler.handle_read(&self.ctx, &packet) {
                            warn!(
                                "handler {} failed on connection {}: {}",
                                handler.name(),
                                self.id,
                                err
                            );
                        }
                    }
                }
                Ok(Inspection::Filter) => {
                    trace!("connection {} filtered a packet", self.id);
                }
                Err(failure) => {
                    info!("closing connection {}: {}", self.id, failure);
                    self.close();
                    return Err(Error::Authentication(failure));
                }
            }
        }

        Ok(bytes.len())
    }

    /// Drains outbound bytes into `buf`, returning how many were produced.
    ///
    /// Replies queued on the context and packets buffered by handlers are encoded first.
    /// Never blocks; returns `Ok(0)` when nothing is pending.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        self.flush_replies();
        let Some(pipeline) = self.pipeline.as_mut() else {
            return Err(Error::Closed);
        };
        let n = pipeline.codec.read(buf);
        if n > 0 {
            trace!("connection {} produced {} bytes", self.id, n);
        }
        Ok(n)
    }

    fn flush_replies(&mut self) {
        let Some(pipeline) = self.pipeline.as_mut() else {
            return;
        };
        let id = &self.id;
        let encode = |codec: &mut Box<dyn Codec>, packet: Packet| {
            if let Err(err) = codec.encode(packet) {
                warn!("dropping reply on connection {}: {}", id, err);
            }
        };

        while let Some(packet) = self.ctx.take_reply() {
            encode(&mut pipeline.codec, packet);
        }
        for handler in pipeline.handlers.iter_mut() {
            while let Some(packet) = handler.poll_write(&self.ctx) {
                encode(&mut pipeline.codec, packet);
            }
        }
    }

    /// True when any stage has output waiting.
    pub fn has_pending_output(&self) -> bool {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return false;
        };
        self.ctx.has_pending_output()
            || pipeline.codec.has_pending_output()
            || pipeline.inspector.has_pending_output()
            || pipeline.handlers.iter().any(|h| h.has_pending_output())
    }

    /// Recomputes and stores the readiness this connection wants.
    pub fn update_interest_ops(&mut self) -> InterestOps {
        self.interest = if self.has_pending_output() {
            InterestOps::ReadWrite
        } else {
            InterestOps::Read
        };
        self.interest
    }

    /// True when the inspector considers this connection expired.
    pub fn timeout(&mut self) -> bool {
        match self.pipeline.as_mut() {
            Some(pipeline) if self.state == ConnectionState::Open => pipeline.inspector.timeout(),
            _ => false,
        }
    }

    /// Closes the channel, then the codec, the inspector and every handler, in that order.
    ///
    /// Idempotent.
    pub fn close(&mut self) {
        if self.state != ConnectionState::Open {
            return;
        }
        self.state = ConnectionState::Closing;

        if let Some(mut channel) = self.channel.take() {
            if let Err(err) = channel.close() {
                debug!("connection {} channel close: {}", self.id, err);
            }
        }
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.codec.close();
            pipeline.inspector.close();
            for handler in pipeline.handlers.iter_mut() {
                handler.close(&self.ctx);
            }
        }
        self.ctx.clear();

        self.state = ConnectionState::Closed;
        self.interest = InterestOps::Read;
        info!("connection {} closed", self.id);
    }
}

impl<S: Channel> Drop for Connection<S> {
    fn drop(&mut self) {
        self.close();
    }
}
