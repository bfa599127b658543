use std::collections::{BTreeSet, HashMap};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use log::{debug, error, info, trace, warn};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};

use portico_core::{
    Channel, Connection, Context, Error, InterestOps, NotifyCallback, Packet, Result,
};
use portico_timer::{DelayScheduler, SchedulerBuilder, SchedulerHandle};

use crate::config::{ListenerDefinition, ServerConfig};
use crate::listener::ListenerRegistry;
use crate::registry::ComponentRegistry;
use crate::topology::{ChangeEvent, TopologyChange, TopologySource};

const WAKER_TOKEN: Token = Token(0);

/// Accepted socket as seen by its [`Connection`].
struct TcpChannel {
    stream: TcpStream,
}

impl Channel for TcpChannel {
    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            result => result,
        }
    }
}

struct Session {
    conn: Connection<TcpChannel>,
    // Bytes taken out of the connection that the socket did not accept yet.
    pending: BytesMut,
    registered: InterestOps,
}

enum ReadOutcome {
    Drained,
    Eof,
    Failed,
}

/// Single-threaded reactor serving every listener of one server.
///
/// Each [`Dispatcher::run_once`] waits for readiness, accepts and services sockets, sweeps
/// expired connections when the sweep interval has elapsed and finally applies whatever
/// the topology source reports.
pub struct Dispatcher {
    config: ServerConfig,
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    notify_tx: Sender<Token>,
    notify_rx: Receiver<Token>,
    overflow: Arc<AtomicBool>,
    components: ComponentRegistry,
    topology: Box<dyn TopologySource>,
    listeners: ListenerRegistry,
    unbound: BTreeSet<String>,
    sessions: HashMap<Token, Session>,
    next_token: usize,
    scratch: Vec<u8>,
    scheduler: Option<DelayScheduler<Packet>>,
    last_sweep: Instant,
}

impl Dispatcher {
    /// Creates a dispatcher. Listeners are bound by the first [`Dispatcher::run_once`].
    pub fn new(
        config: ServerConfig,
        components: ComponentRegistry,
        topology: impl TopologySource + 'static,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (notify_tx, notify_rx) = bounded(config.notify_capacity);

        Ok(Self {
            events: Events::with_capacity(config.max_events),
            scratch: vec![0u8; config.read_buffer_size],
            listeners: ListenerRegistry::new(config.bind_host),
            config,
            poll,
            waker,
            notify_tx,
            notify_rx,
            overflow: Arc::new(AtomicBool::new(false)),
            components,
            topology: Box::new(topology),
            unbound: BTreeSet::new(),
            sessions: HashMap::new(),
            next_token: WAKER_TOKEN.0 + 1,
            scheduler: None,
            last_sweep: Instant::now(),
        })
    }

    /// Address listener `id` is bound on.
    pub fn local_addr(&self, id: &str) -> Option<SocketAddr> {
        self.listeners.get(id).map(|listener| listener.local_addr)
    }

    /// Definition new connections on listener `id` are built from.
    pub fn listener_definition(&self, id: &str) -> Option<&ListenerDefinition> {
        self.listeners.get(id).map(|listener| listener.definition.as_ref())
    }

    /// Number of bound listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    /// Runs until `stop` yields a value or disconnects, then shuts down.
    pub fn run(&mut self, stop: &Receiver<()>) -> Result<()> {
        info!("dispatcher {} running", self.config.server_id);
        let result = loop {
            match stop.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break Ok(()),
                Err(TryRecvError::Empty) => {}
            }
            if let Err(err) = self.run_once() {
                error!("dispatcher {} failed: {}", self.config.server_id, err);
                break Err(err);
            }
        };
        self.shutdown();
        result
    }

    /// Runs exactly one reactor iteration.
    ///
    /// Only a failing readiness wait is an error; everything else is logged and handled
    /// per connection or per listener.
    pub fn run_once(&mut self) -> Result<()> {
        if let Err(err) = self
            .poll
            .poll(&mut self.events, Some(self.config.poll_timeout))
        {
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                (
                    event.token(),
                    event.is_readable() || event.is_read_closed() || event.is_error(),
                    event.is_writable(),
                )
            })
            .collect();

        for (token, readable, writable) in ready {
            if token == WAKER_TOKEN {
                self.drain_notifications();
            } else if self.listeners.by_token(token).is_some() {
                self.accept(token);
            } else {
                trace!("{:?} readable={} writable={}", token, readable, writable);
                self.service(token, readable);
            }
        }

        if self.last_sweep.elapsed() >= self.config.sweep_interval {
            self.sweep_timeouts();
            self.last_sweep = Instant::now();
        }
        self.reconcile_topology();
        Ok(())
    }

    /// Closes every connection and listener and stops the delay scheduler. Idempotent.
    pub fn shutdown(&mut self) {
        let tokens: Vec<Token> = self.sessions.keys().copied().collect();
        for token in tokens {
            self.close_session(token);
        }
        self.listeners.clear(self.poll.registry());
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
        debug!("dispatcher {} shut down", self.config.server_id);
    }

    /// Applies one topology change to the listener registry.
    ///
    /// On error the registry is left as it was.
    pub fn apply_change(&mut self, change: TopologyChange) -> Result<()> {
        let id = change.definition.id.clone();
        match change.event {
            ChangeEvent::Add if self.listeners.contains(&id) => {
                debug!("listener {} already bound, applying as an update", id);
                self.listeners.update(&change.definition).map(|_| ())
            }
            ChangeEvent::Add => {
                let token = self.next_token();
                self.listeners.add(self.poll.registry(), token, change.definition)
            }
            ChangeEvent::Remove => self.listeners.remove(self.poll.registry(), &id),
            ChangeEvent::Update => self.listeners.update(&change.definition).map(|_| ()),
        }
    }

    fn reconcile_topology(&mut self) {
        let changes = match self.topology.poll() {
            Ok(changes) => changes,
            Err(err) => {
                warn!("topology poll failed: {}", err);
                return;
            }
        };
        let mut rejected = Vec::new();
        for change in changes {
            let event = change.event;
            let id = change.definition.id.clone();
            match self.apply_change(change.clone()) {
                Ok(()) => {
                    if self.unbound.remove(&id) {
                        info!("listener {} bound after earlier failures", id);
                    }
                }
                Err(err) if event == ChangeEvent::Add => {
                    // the source offers it again on every poll; log the first failure only
                    if self.unbound.insert(id.clone()) {
                        error!("cannot bind listener {}: {}", id, err);
                    } else {
                        debug!("listener {} still cannot bind: {}", id, err);
                    }
                    rejected.push(change);
                }
                Err(Error::UnknownListener(_)) if event == ChangeEvent::Update => {
                    warn!("update of unbound listener {} handed back to the source", id);
                    rejected.push(change);
                }
                Err(err) => warn!("{:?} of listener {} rejected: {}", event, id, err),
            }
            if event == ChangeEvent::Remove {
                self.unbound.remove(&id);
            }
        }
        if !rejected.is_empty() {
            self.topology.rejected(&rejected);
        }
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn notifier(&self, token: Token) -> NotifyCallback {
        let tx = self.notify_tx.clone();
        let waker = Arc::clone(&self.waker);
        let overflow = Arc::clone(&self.overflow);
        Arc::new(move || {
            if tx.try_send(token).is_err() {
                overflow.store(true, Ordering::Release);
            }
            if let Err(err) = waker.wake() {
                debug!("waking reactor for {:?}: {}", token, err);
            }
        })
    }

    fn drain_notifications(&mut self) {
        let mut tokens: BTreeSet<Token> = self.notify_rx.try_iter().collect();
        if self.overflow.swap(false, Ordering::Acquire) {
            trace!("notification queue overflowed, refreshing every connection");
            tokens.extend(self.sessions.keys().copied());
        }
        for token in tokens {
            self.service(token, false);
        }
    }

    fn accept(&mut self, token: Token) {
        loop {
            let Some(listener) = self.listeners.by_token(token) else {
                return;
            };
            match listener.socket.accept() {
                Ok((stream, peer)) => {
                    let definition = Rc::clone(&listener.definition);
                    self.open_session(stream, peer, definition);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("listener {} accept error: {}", listener.definition.id, err);
                    return;
                }
            }
        }
    }

    fn scheduler_handle(
        &mut self,
        definition: &ListenerDefinition,
    ) -> Result<Option<SchedulerHandle<Packet>>> {
        if !definition.codec.needs_scheduler() {
            return Ok(None);
        }
        if self.scheduler.is_none() {
            let mut builder =
                SchedulerBuilder::new().name(&format!("{}-delay", self.config.server_id));
            if let Some(core_id) = self.config.scheduler_core {
                builder = builder.core_id(core_id);
            }
            self.scheduler = Some(builder.spawn()?);
            debug!("dispatcher {} started its delay scheduler", self.config.server_id);
        }
        Ok(self.scheduler.as_ref().map(|scheduler| scheduler.handle()))
    }

    fn open_session(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
        definition: Rc<ListenerDefinition>,
    ) {
        let token = self.next_token();
        let ctx = Context::new(self.config.server_id.clone(), definition.id.clone(), peer);
        ctx.set_interest_notify(self.notifier(token));

        let parts = self.scheduler_handle(&definition).and_then(|scheduler| {
            self.components
                .build_connection_parts(&definition, &ctx, scheduler.as_ref())
        });
        let parts = match parts {
            Ok(parts) => parts,
            Err(err) => {
                warn!(
                    "dropping connection from {} on listener {}: {}",
                    peer, definition.id, err
                );
                return;
            }
        };
        if let Err(err) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            warn!("cannot register connection from {}: {}", peer, err);
            return;
        }

        let conn = Connection::new(
            TcpChannel { stream },
            ctx,
            parts.codec,
            parts.inspector,
            parts.handlers,
        );
        info!(
            "accepted connection {} on listener {}",
            conn.id(),
            definition.id
        );
        self.sessions.insert(
            token,
            Session {
                conn,
                pending: BytesMut::new(),
                registered: InterestOps::Read,
            },
        );
        self.service(token, true);
    }

    fn service(&mut self, token: Token, readable: bool) {
        let Some(session) = self.sessions.get_mut(&token) else {
            return;
        };

        let outcome = if readable {
            read_socket(session, &mut self.scratch)
        } else {
            ReadOutcome::Drained
        };
        let flushed = flush_socket(session, &mut self.scratch);

        match outcome {
            ReadOutcome::Drained if flushed && session.conn.is_open() => {}
            ReadOutcome::Eof => {
                debug!("connection {} reached end of stream", session.conn.id());
                self.close_session(token);
                return;
            }
            _ => {
                self.close_session(token);
                return;
            }
        }

        let wants_write = session.conn.update_interest_ops().wants_write();
        let next = if wants_write || !session.pending.is_empty() {
            InterestOps::ReadWrite
        } else {
            InterestOps::Read
        };
        if next == session.registered {
            return;
        }
        let interest = match next {
            InterestOps::Read => Interest::READABLE,
            InterestOps::ReadWrite => Interest::READABLE | Interest::WRITABLE,
        };
        let Some(channel) = session.conn.channel_mut() else {
            return;
        };
        match self
            .poll
            .registry()
            .reregister(&mut channel.stream, token, interest)
        {
            Ok(()) => session.registered = next,
            Err(err) => {
                warn!("cannot update interest of {}: {}", session.conn.id(), err);
                self.close_session(token);
            }
        }
    }

    fn sweep_timeouts(&mut self) {
        let expired: Vec<Token> = self
            .sessions
            .iter_mut()
            .filter_map(|(token, session)| session.conn.timeout().then_some(*token))
            .collect();
        for token in expired {
            if let Some(session) = self.sessions.get(&token) {
                info!("connection {} timed out", session.conn.id());
            }
            self.close_session(token);
        }
    }

    fn close_session(&mut self, token: Token) {
        let Some(mut session) = self.sessions.remove(&token) else {
            return;
        };
        if let Some(channel) = session.conn.channel_mut() {
            if let Err(err) = self.poll.registry().deregister(&mut channel.stream) {
                debug!("deregistering {}: {}", session.conn.id(), err);
            }
        }
        session.conn.close();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_socket(session: &mut Session, buf: &mut [u8]) -> ReadOutcome {
    loop {
        let Some(channel) = session.conn.channel_mut() else {
            return ReadOutcome::Failed;
        };
        match channel.stream.read(buf) {
            Ok(0) => return ReadOutcome::Eof,
            Ok(n) => {
                trace!("connection {} read {} bytes", session.conn.id(), n);
                if let Err(err) = session.conn.write(&buf[..n]) {
                    debug!("connection {} stopped reading: {}", session.conn.id(), err);
                    return ReadOutcome::Failed;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Drained,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!("connection {} read error: {}", session.conn.id(), err);
                return ReadOutcome::Failed;
            }
        }
    }
}

// Returns false when the socket failed and the session has to be closed.
fn flush_socket(session: &mut Session, buf: &mut [u8]) -> bool {
    loop {
        if session.pending.is_empty() {
            let n = match session.conn.read(buf) {
                Ok(n) => n,
                Err(Error::Closed) => return false,
                Err(err) => {
                    warn!("connection {} output failed: {}", session.conn.id(), err);
                    return false;
                }
            };
            if n == 0 {
                return true;
            }
            session.pending.extend_from_slice(&buf[..n]);
        }

        let Some(channel) = session.conn.channel_mut() else {
            return false;
        };
        match channel.stream.write(&session.pending) {
            Ok(0) => return false,
            Ok(n) => {
                trace!("wrote {} bytes", n);
                session.pending.advance(n);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!("connection {} write error: {}", session.conn.id(), err);
                return false;
            }
        }
    }
}
