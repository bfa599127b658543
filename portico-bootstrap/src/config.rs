use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use portico_codec::CodecConfig;
use portico_core::{Error, InspectorConfig, Result};
use portico_timer::CoreId;

/// Settings of one [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub(crate) server_id: String,
    pub(crate) bind_host: IpAddr,
    pub(crate) poll_timeout: Duration,
    pub(crate) sweep_interval: Duration,
    pub(crate) read_buffer_size: usize,
    pub(crate) max_events: usize,
    pub(crate) notify_capacity: usize,
    pub(crate) scheduler_core: Option<CoreId>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: "portico".to_owned(),
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            poll_timeout: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(1),
            read_buffer_size: 8192,
            max_events: 1024,
            notify_capacity: 1024,
            scheduler_core: None,
        }
    }
}

impl ServerConfig {
    /// Creates a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Server id handed to every connection context
    pub fn server_id(mut self, server_id: &str) -> Self {
        self.server_id = server_id.to_owned();
        self
    }

    /// Address listeners bind on, `0.0.0.0` by default
    pub fn bind_host(mut self, bind_host: IpAddr) -> Self {
        self.bind_host = bind_host;
        self
    }

    /// Longest single wait for readiness
    pub fn poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Interval between connection timeout sweeps
    pub fn sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Size of the socket read and write scratch buffers
    pub fn read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size.max(1);
        self
    }

    /// Readiness events handled per poll
    pub fn max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events.max(1);
        self
    }

    /// Capacity of the cross-thread output notification queue
    pub fn notify_capacity(mut self, notify_capacity: usize) -> Self {
        self.notify_capacity = notify_capacity.max(1);
        self
    }

    /// Pins the delay scheduler thread to a CPU core
    pub fn scheduler_core(mut self, core_id: CoreId) -> Self {
        self.scheduler_core = Some(core_id);
        self
    }
}

/// A handler entry of a listener definition: a registry tag plus opaque settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Tag the handler was registered under
    #[serde(rename = "type")]
    pub kind: String,
    /// Handler specific settings, deserialized by the registered constructor
    #[serde(default)]
    pub config: Value,
}

impl HandlerConfig {
    /// Creates a handler entry.
    pub fn new(kind: impl Into<String>, config: Value) -> Self {
        Self {
            kind: kind.into(),
            config,
        }
    }
}

/// Desired state of one listener.
///
/// ```json
/// {
///   "id": "echo",
///   "name": "Echo service",
///   "port": 7000,
///   "codec": {"type": "line"},
///   "inspector": {"type": "idle_timeout", "timeout_ms": 30000},
///   "handlers": [{"type": "echo"}]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerDefinition {
    /// Unique listener id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// TCP port; 0 binds an ephemeral port. Fixed once bound.
    pub port: u16,
    /// Codec built for every connection
    #[serde(default)]
    pub codec: CodecConfig,
    /// Inspector built for every connection
    #[serde(default)]
    pub inspector: InspectorConfig,
    /// Handlers built for every connection, in delivery order
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

impl ListenerDefinition {
    /// Creates a definition with a line codec, no inspection and no handlers.
    pub fn new(id: impl Into<String>, port: u16) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            port,
            codec: CodecConfig::default(),
            inspector: InspectorConfig::default(),
            handlers: Vec::new(),
        }
    }

    /// Sets the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the codec
    pub fn with_codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the inspector
    pub fn with_inspector(mut self, inspector: InspectorConfig) -> Self {
        self.inspector = inspector;
        self
    }

    /// Appends a handler
    pub fn with_handler(mut self, kind: impl Into<String>, config: Value) -> Self {
        self.handlers.push(HandlerConfig::new(kind, config));
        self
    }

    /// Rejects definitions no listener could be built from.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Config("listener id must not be empty".to_owned()));
        }
        if let Some(handler) = self.handlers.iter().find(|h| h.kind.is_empty()) {
            return Err(Error::Config(format!(
                "listener {}: handler type must not be empty ({:?})",
                self.id, handler.config
            )));
        }
        self.codec
            .validate()
            .map_err(|err| Error::Config(format!("listener {}: {}", self.id, err)))
    }

    /// Applies the mutable properties of `update` in place.
    ///
    /// Returns the names of the properties that changed. A port change is refused and
    /// leaves `self` untouched.
    pub fn apply_update(&mut self, update: &ListenerDefinition) -> Result<Vec<&'static str>> {
        if update.id != self.id {
            return Err(Error::Config(format!(
                "update for {} applied to listener {}",
                update.id, self.id
            )));
        }
        if update.port != self.port {
            return Err(Error::UnchangeableProperty {
                id: self.id.clone(),
                property: "port",
            });
        }

        let mut changed = Vec::new();
        if update.name != self.name {
            self.name = update.name.clone();
            changed.push("name");
        }
        if update.codec != self.codec {
            self.codec = update.codec.clone();
            changed.push("codec");
        }
        if update.inspector != self.inspector {
            self.inspector = update.inspector.clone();
            changed.push("inspector");
        }
        if update.handlers != self.handlers {
            self.handlers = update.handlers.clone();
            changed.push("handlers");
        }
        Ok(changed)
    }
}
