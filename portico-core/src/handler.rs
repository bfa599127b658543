//! # Handler Trait - Per-Connection Application Logic
//!
//! A [`Handler`] receives every packet that survived its connection's inspector and may
//! answer through the connection's [`Context`]. A connection owns an ordered list of
//! handlers; each decoded packet is offered to all of them in declaration order.
//!
//! ## Producing Output
//!
//! There are two ways for a handler to emit packets:
//!
//! - **Immediately**, by calling [`Context::write`] from inside [`Handler::handle_read`].
//!   The packet is queued on the context and encoded the next time the dispatcher drains
//!   the connection.
//! - **Lazily**, by buffering internally and returning packets from [`Handler::poll_write`]
//!   while reporting [`Handler::has_pending_output`]. This suits handlers whose output is
//!   produced outside of a read, e.g. a broadcast from another connection.
//!
//! Output produced outside of `handle_read` is only picked up once the reactor recomputes
//! the connection's interest, which is what [`Context::refresh_interest_ops`] requests.
//!
//! ## Example: Echo Handler
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
//!         ctx.write(packet.clone());
//!         Ok(())
//!     }
//! }
//! ```
//!
//! Errors returned from `handle_read` are logged by the connection and never stop
//! delivery to the remaining handlers.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::{NotifyCallback, Packet, Result};

/// Application logic attached to a connection.
pub trait Handler {
    /// Handler name, used in logs.
    fn name(&self) -> &str;

    /// Called once when the connection is established.
    fn transport_active(&mut self, _ctx: &Context) {}

    /// Handles one inbound packet.
    fn handle_read(&mut self, ctx: &Context, packet: &Packet) -> Result<()>;

    /// Returns the next packet this handler buffered for sending, if any.
    fn poll_write(&mut self, _ctx: &Context) -> Option<Packet> {
        None
    }

    /// True while [`Handler::poll_write`] would return a packet.
    fn has_pending_output(&self) -> bool {
        false
    }

    /// Called once when the connection closes.
    fn close(&mut self, _ctx: &Context) {}
}

impl<H> Handler for Box<H>
where
    H: Handler + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn transport_active(&mut self, ctx: &Context) {
        (**self).transport_active(ctx)
    }

    fn handle_read(&mut self, ctx: &Context, packet: &Packet) -> Result<()> {
        (**self).handle_read(ctx, packet)
    }

    fn poll_write(&mut self, ctx: &Context) -> Option<Packet> {
        (**self).poll_write(ctx)
    }

    fn has_pending_output(&self) -> bool {
        (**self).has_pending_output()
    }

    fn close(&mut self, ctx: &Context) {
        (**self).close(ctx)
    }
}

struct ContextInner {
    server_id: String,
    listener_id: String,
    remote_addr: SocketAddr,
    connection_id: RefCell<String>,
    replies: RefCell<VecDeque<Packet>>,
    notify: RefCell<Option<NotifyCallback>>,
}

/// Per-connection handle given to handlers.
///
/// Cloning is cheap and every clone refers to the same connection. The context lives on
/// the reactor thread; use [`Context::interest_notify`] to obtain a `Send` callback that
/// can wake the reactor from elsewhere.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Context {
    /// Creates a context for a connection accepted on `listener_id` from `remote_addr`.
    pub fn new(
        server_id: impl Into<String>,
        listener_id: impl Into<String>,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                server_id: server_id.into(),
                listener_id: listener_id.into(),
                remote_addr,
                connection_id: RefCell::new(remote_addr.to_string()),
                replies: RefCell::new(VecDeque::new()),
                notify: RefCell::new(None),
            }),
        }
    }

    /// Address of the connected peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Id of the server owning the connection.
    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    /// Id of the listener that accepted the connection.
    pub fn listener_id(&self) -> &str {
        &self.inner.listener_id
    }

    /// Current connection id as assigned by the inspector.
    pub fn connection_id(&self) -> String {
        self.inner.connection_id.borrow().clone()
    }

    /// Queues a reply packet. Replies bypass the inspector.
    pub fn write(&self, packet: Packet) {
        self.inner.replies.borrow_mut().push_back(packet);
    }

    /// Asks the reactor to recompute this connection's interest.
    ///
    /// Needed only when output was produced outside of [`Handler::handle_read`].
    pub fn refresh_interest_ops(&self) {
        if let Some(notify) = self.inner.notify.borrow().as_ref() {
            notify();
        }
    }

    /// Installs the reactor callback behind [`Context::refresh_interest_ops`].
    pub fn set_interest_notify(&self, notify: NotifyCallback) {
        *self.inner.notify.borrow_mut() = Some(notify);
    }

    /// The reactor callback, if one is installed.
    pub fn interest_notify(&self) -> Option<NotifyCallback> {
        self.inner.notify.borrow().clone()
    }

    /// True while replies are queued.
    pub fn has_pending_output(&self) -> bool {
        !self.inner.replies.borrow().is_empty()
    }

    pub(crate) fn set_connection_id(&self, id: &str) {
        let mut current = self.inner.connection_id.borrow_mut();
        if current.as_str() != id {
            *current = id.to_owned();
        }
    }

    pub(crate) fn take_reply(&self) -> Option<Packet> {
        self.inner.replies.borrow_mut().pop_front()
    }

    pub(crate) fn clear(&self) {
        self.inner.replies.borrow_mut().clear();
        self.inner.notify.borrow_mut().take();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("server_id", &self.inner.server_id)
            .field("listener_id", &self.inner.listener_id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("connection_id", &*self.inner.connection_id.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn context() -> Context {
        Context::new("srv", "echo", "10.0.0.1:5000".parse().unwrap())
    }

    #[test]
    fn replies_are_fifo() {
        let ctx = context();
        assert!(!ctx.has_pending_output());
        ctx.write(Packet::new("a", "one"));
        ctx.clone().write(Packet::new("a", "two"));
        assert!(ctx.has_pending_output());

        assert_eq!(ctx.take_reply().unwrap().payload().as_text(), Some("one"));
        assert_eq!(ctx.take_reply().unwrap().payload().as_text(), Some("two"));
        assert!(ctx.take_reply().is_none());
    }

    #[test]
    fn refresh_calls_notify() {
        let ctx = context();
        ctx.refresh_interest_ops();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        ctx.set_interest_notify(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        ctx.refresh_interest_ops();
        ctx.refresh_interest_ops();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn identity_accessors() {
        let ctx = context();
        assert_eq!(ctx.server_id(), "srv");
        assert_eq!(ctx.listener_id(), "echo");
        assert_eq!(ctx.connection_id(), "10.0.0.1:5000");
        ctx.set_connection_id("bob@10.0.0.1:5000");
        assert_eq!(ctx.clone().connection_id(), "bob@10.0.0.1:5000");
    }
}
