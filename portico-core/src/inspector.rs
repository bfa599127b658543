//! Per-connection inspection stage.
//!
//! Every decoded packet passes through the connection's [`Inspector`] before any handler
//! sees it. The inspector owns the connection's identity, may authenticate, filter or
//! transform packets, and independently decides when the connection has timed out.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{AuthenticationFailure, Packet, Payload};

/// Outcome of inspecting one packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Inspection {
    /// Deliver this packet (the original or a transformed one) to the handlers
    Pass(Packet),
    /// Drop the packet silently
    Filter,
}

/// Authentication, filtering, identity and timeout stage of a connection.
pub trait Inspector {
    /// Current connection id. May change over the connection's life, typically once.
    fn id(&self) -> &str;

    /// Inspects one inbound packet.
    fn inspect(&mut self, packet: Packet) -> Result<Inspection, AuthenticationFailure>;

    /// True once the connection should be closed for inactivity.
    fn timeout(&mut self) -> bool;

    /// True when the inspector itself wants to emit output.
    fn has_pending_output(&self) -> bool {
        false
    }

    /// Releases inspector state.
    fn close(&mut self) {}
}

impl<I> Inspector for Box<I>
where
    I: Inspector + ?Sized,
{
    fn id(&self) -> &str {
        (**self).id()
    }

    fn inspect(&mut self, packet: Packet) -> Result<Inspection, AuthenticationFailure> {
        (**self).inspect(packet)
    }

    fn timeout(&mut self) -> bool {
        (**self).timeout()
    }

    fn has_pending_output(&self) -> bool {
        (**self).has_pending_output()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Lets every packet through and never times out. The id is the peer address.
#[derive(Debug, Clone)]
pub struct PassThroughInspector {
    id: String,
}

impl PassThroughInspector {
    /// Creates an inspector identified by `remote_addr`.
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: remote_addr.to_string(),
        }
    }
}

impl Inspector for PassThroughInspector {
    fn id(&self) -> &str {
        &self.id
    }

    fn inspect(&mut self, packet: Packet) -> Result<Inspection, AuthenticationFailure> {
        Ok(Inspection::Pass(packet))
    }

    fn timeout(&mut self) -> bool {
        false
    }
}

/// Passes every packet through and times out after a period without packets.
///
/// A timeout of `None` (or zero) disables expiry.
#[derive(Debug, Clone)]
pub struct IdleTimeoutInspector {
    id: String,
    timeout: Option<Duration>,
    last_seen: Instant,
}

impl IdleTimeoutInspector {
    /// Creates an inspector that expires `timeout` after the last packet.
    pub fn new(remote_addr: SocketAddr, timeout: Option<Duration>) -> Self {
        Self {
            id: remote_addr.to_string(),
            timeout: timeout.filter(|t| !t.is_zero()),
            last_seen: Instant::now(),
        }
    }

    /// Instant the last packet was inspected (or the inspector was created).
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Timeout check against an explicit clock reading.
    pub fn timeout_at(&self, now: Instant) -> bool {
        match self.timeout {
            Some(timeout) => now.saturating_duration_since(self.last_seen) > timeout,
            None => false,
        }
    }
}

impl Inspector for IdleTimeoutInspector {
    fn id(&self) -> &str {
        &self.id
    }

    fn inspect(&mut self, packet: Packet) -> Result<Inspection, AuthenticationFailure> {
        self.last_seen = Instant::now();
        Ok(Inspection::Pass(packet))
    }

    fn timeout(&mut self) -> bool {
        self.timeout_at(Instant::now())
    }
}

/// Requires the first packet to be `<user>:<secret>`.
///
/// The credentials packet is consumed; on success the connection id becomes
/// `<user>@<peer>` and later packets are re-attributed to it. Any other first packet is an
/// authentication failure. Idle expiry works like [`IdleTimeoutInspector`].
#[derive(Debug, Clone)]
pub struct TokenAuthInspector {
    idle: IdleTimeoutInspector,
    peer: String,
    secret: String,
    authenticated: bool,
}

impl TokenAuthInspector {
    /// Creates an inspector expecting `secret`.
    pub fn new(remote_addr: SocketAddr, secret: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            idle: IdleTimeoutInspector::new(remote_addr, timeout),
            peer: remote_addr.to_string(),
            secret: secret.into(),
            authenticated: false,
        }
    }

    /// True once credentials were accepted.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn credentials(packet: &Packet) -> Option<String> {
        match packet.payload() {
            Payload::Text(text) => Some(text.trim().to_owned()),
            Payload::Raw(bytes) => std::str::from_utf8(bytes).ok().map(|s| s.trim().to_owned()),
            Payload::Value(value) => value.as_str().map(|s| s.trim().to_owned()),
        }
    }
}

impl Inspector for TokenAuthInspector {
    fn id(&self) -> &str {
        self.idle.id()
    }

    fn inspect(&mut self, packet: Packet) -> Result<Inspection, AuthenticationFailure> {
        self.idle.last_seen = Instant::now();

        if self.authenticated {
            let id = self.idle.id.clone();
            return Ok(Inspection::Pass(packet.with_source_id(id)));
        }

        let credentials = Self::credentials(&packet).unwrap_or_default();
        match credentials.split_once(':') {
            Some((user, secret)) if !user.is_empty() && secret == self.secret => {
                self.authenticated = true;
                self.idle.id = format!("{}@{}", user, self.peer);
                info!("connection {} authenticated as {}", self.peer, self.idle.id);
                Ok(Inspection::Filter)
            }
            _ => {
                debug!("rejecting credentials from {}", self.peer);
                Err(AuthenticationFailure::new(
                    self.peer.clone(),
                    "invalid credentials",
                ))
            }
        }
    }

    fn timeout(&mut self) -> bool {
        self.idle.timeout()
    }
}

/// Typed configuration for the built-in inspectors.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InspectorConfig {
    /// [`PassThroughInspector`]
    #[default]
    PassThrough,
    /// [`IdleTimeoutInspector`]; `timeout_ms == 0` never expires
    IdleTimeout {
        /// Idle timeout in milliseconds
        #[serde(default)]
        timeout_ms: u64,
    },
    /// [`TokenAuthInspector`]
    TokenAuth {
        /// Shared secret expected after `<user>:`
        secret: String,
        /// Idle timeout in milliseconds, 0 disables
        #[serde(default)]
        timeout_ms: u64,
    },
}

impl InspectorConfig {
    /// Short tag naming the inspector kind.
    pub fn tag(&self) -> &'static str {
        match self {
            InspectorConfig::PassThrough => "pass_through",
            InspectorConfig::IdleTimeout { .. } => "idle_timeout",
            InspectorConfig::TokenAuth { .. } => "token_auth",
        }
    }

    /// Builds the configured inspector for a connection from `remote_addr`.
    pub fn build(&self, remote_addr: SocketAddr) -> Box<dyn Inspector> {
        match self {
            InspectorConfig::PassThrough => Box::new(PassThroughInspector::new(remote_addr)),
            InspectorConfig::IdleTimeout { timeout_ms } => Box::new(IdleTimeoutInspector::new(
                remote_addr,
                Some(Duration::from_millis(*timeout_ms)),
            )),
            InspectorConfig::TokenAuth { secret, timeout_ms } => Box::new(TokenAuthInspector::new(
                remote_addr,
                secret.clone(),
                Some(Duration::from_millis(*timeout_ms)),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn idle_timeout_boundary() {
        let timeout = Duration::from_millis(500);
        let epsilon = Duration::from_millis(1);
        let mut inspector = IdleTimeoutInspector::new(peer(), Some(timeout));
        inspector.inspect(Packet::new("x", "ping")).unwrap();
        let last = inspector.last_seen();

        assert!(!inspector.timeout_at(last + timeout - epsilon));
        assert!(inspector.timeout_at(last + timeout + epsilon));
    }

    #[test]
    fn disabled_timeout_never_expires() {
        let far = Instant::now() + Duration::from_secs(365 * 24 * 3600);
        for timeout in [None, Some(Duration::ZERO)] {
            let inspector = IdleTimeoutInspector::new(peer(), timeout);
            assert!(!inspector.timeout_at(far));
        }
    }

    #[test]
    fn packets_refresh_idle_clock() {
        let mut inspector = IdleTimeoutInspector::new(peer(), Some(Duration::from_secs(1)));
        let created = inspector.last_seen();
        std::thread::sleep(Duration::from_millis(5));
        inspector.inspect(Packet::new("x", "ping")).unwrap();
        assert!(inspector.last_seen() > created);
    }

    #[test]
    fn token_auth_changes_id_once() {
        let mut inspector = TokenAuthInspector::new(peer(), "s3cret", None);
        assert_eq!(inspector.id(), "127.0.0.1:4000");

        let outcome = inspector.inspect(Packet::new("127.0.0.1:4000", "alice:s3cret\r")).unwrap();
        assert_eq!(outcome, Inspection::Filter);
        assert!(inspector.is_authenticated());
        assert_eq!(inspector.id(), "alice@127.0.0.1:4000");

        match inspector.inspect(Packet::new("127.0.0.1:4000", "hello")).unwrap() {
            Inspection::Pass(packet) => {
                assert_eq!(packet.source_id(), "alice@127.0.0.1:4000");
                assert_eq!(packet.payload().as_text(), Some("hello"));
            }
            Inspection::Filter => panic!("authenticated packet was filtered"),
        }
    }

    #[test]
    fn token_auth_refreshes_idle_clock() {
        let timeout = Duration::from_secs(1);
        let mut inspector = TokenAuthInspector::new(peer(), "s3cret", Some(timeout));
        let created = inspector.idle.last_seen();
        std::thread::sleep(Duration::from_millis(5));
        inspector.inspect(Packet::new("p", "alice:s3cret")).unwrap();
        let after_login = inspector.idle.last_seen();
        assert!(after_login > created);

        std::thread::sleep(Duration::from_millis(5));
        inspector.inspect(Packet::new("p", "hello")).unwrap();
        assert!(inspector.idle.last_seen() > after_login);
        assert!(!inspector.idle.timeout_at(after_login + timeout));
    }

    #[test]
    fn token_auth_rejects_bad_credentials() {
        let mut inspector = TokenAuthInspector::new(peer(), "s3cret", None);
        let err = inspector.inspect(Packet::new("p", "alice:nope")).unwrap_err();
        assert_eq!(err.connection_id, "127.0.0.1:4000");
        assert!(!inspector.is_authenticated());
    }

    #[test]
    fn config_builds_inspectors() {
        let config: InspectorConfig =
            serde_json::from_str(r#"{"type":"idle_timeout","timeout_ms":250}"#).unwrap();
        assert_eq!(config, InspectorConfig::IdleTimeout { timeout_ms: 250 });
        assert_eq!(config.tag(), "idle_timeout");
        let inspector = config.build(peer());
        assert_eq!(inspector.id(), "127.0.0.1:4000");

        let default: InspectorConfig = serde_json::from_str(r#"{"type":"pass_through"}"#).unwrap();
        assert_eq!(default, InspectorConfig::default());
    }
}
