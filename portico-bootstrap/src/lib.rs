//! The server side of portico: a single-threaded [`Dispatcher`] that binds listeners from a
//! live [`TopologySource`], accepts clients into connections assembled by a
//! [`ComponentRegistry`] and drives their socket IO, timeouts and asynchronous output.
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use portico_bootstrap::{
//!     ComponentRegistry, Dispatcher, ListenerDefinition, ManualTopology, ServerConfig,
//! };
//!
//! let (topology, handle) = ManualTopology::new();
//! handle.add(ListenerDefinition::new("echo", 7000));
//!
//! let config = ServerConfig::new().poll_timeout(Duration::from_millis(100));
//! let mut dispatcher = Dispatcher::new(config, ComponentRegistry::new(), topology).unwrap();
//!
//! let (_stop_tx, stop_rx) = crossbeam_channel::bounded(1);
//! dispatcher.run(&stop_rx).unwrap();
//! ```
#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

mod config;
mod dispatcher;
mod listener;
mod registry;
mod topology;

pub use config::{HandlerConfig, ListenerDefinition, ServerConfig};
pub use dispatcher::Dispatcher;
pub use registry::{ComponentRegistry, ConnectionParts};
pub use topology::{
    diff, ChangeEvent, FileTopology, ManualTopology, TopologyChange, TopologyHandle,
    TopologySource,
};
