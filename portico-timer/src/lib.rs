//! # portico-timer - Delay Scheduler Worker
//!
//! `portico-timer` runs one dedicated worker thread that holds items until their deadline
//! and then hands them to a destination without blocking. It backs the output delay codec:
//! the reactor thread never sleeps on a timer, it only drains what the worker delivered.
//!
//! ## Features
//!
//! - **Deadline Sleeping**: The worker sleeps exactly until the earliest deadline or the
//!   next submission; there is no fixed tick
//! - **Bounded Hand-off**: Due items are offered with a non-blocking [`Deliver::deliver`];
//!   a full destination is retried shortly after, keeping per-destination order
//! - **CPU Pinning**: Pin the worker thread to a specific CPU core
//! - **Thread Naming**: Name the worker thread for debugging
//! - **Explicit Ownership**: [`DelayScheduler`] stops and joins the worker on
//!   [`DelayScheduler::stop`] or drop
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use portico_timer::{Deliver, Delivery, SchedulerBuilder};
//!
//! struct Print;
//!
//! impl Deliver<String> for Print {
//!     fn key(&self) -> u64 {
//!         0
//!     }
//!
//!     fn deliver(&self, item: String) -> Delivery<String> {
//!         println!("{}", item);
//!         Delivery::Delivered
//!     }
//! }
//!
//! let scheduler = SchedulerBuilder::new()
//!     .name("delay")
//!     .spawn::<String>()
//!     .unwrap();
//! scheduler
//!     .handle()
//!     .schedule_after(Duration::from_millis(100), "later".to_owned(), Arc::new(Print));
//! ```
#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

mod queue;
mod scheduler;

pub use core_affinity::CoreId;
pub use queue::{DelayQueue, Deliver, Delivery, RETRY_DELAY};
pub use scheduler::{DelayScheduler, SchedulerBuilder, SchedulerHandle};
