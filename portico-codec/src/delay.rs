use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{trace, warn};

use portico_core::{Codec, Error, NotifyCallback, Packet, Result};
use portico_timer::{Deliver, Delivery, SchedulerHandle};

/// Capacity of the hand-off channel between the scheduler and one codec.
pub const DUE_CAPACITY: usize = 256;

static NEXT_SINK_KEY: AtomicU64 = AtomicU64::new(1);

struct DueSink {
    key: u64,
    tx: Sender<Packet>,
    notify: Option<NotifyCallback>,
}

impl Deliver<Packet> for DueSink {
    fn key(&self) -> u64 {
        self.key
    }

    fn deliver(&self, packet: Packet) -> Delivery<Packet> {
        match self.tx.try_send(packet) {
            Ok(()) => {
                if let Some(notify) = &self.notify {
                    notify();
                }
                Delivery::Delivered
            }
            Err(TrySendError::Full(packet)) => Delivery::Full(packet),
            Err(TrySendError::Disconnected(_)) => Delivery::Gone,
        }
    }
}

/// Holds outbound packets back for a fixed delay before the inner codec encodes them.
///
/// Packets wait on the shared delay scheduler and come back through a bounded channel;
/// the output callback then wakes the reactor, which drains them on its next read. The
/// inbound direction is passed through untouched.
pub struct DelayCodec<C> {
    inner: C,
    delay: Duration,
    scheduler: SchedulerHandle<Packet>,
    key: u64,
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
    sink: Option<Arc<DueSink>>,
    notify: Option<NotifyCallback>,
}

impl<C: Codec> DelayCodec<C> {
    /// Wraps `inner`, delaying each encoded packet by `delay`.
    pub fn new(inner: C, delay: Duration, scheduler: SchedulerHandle<Packet>) -> Self {
        let (tx, rx) = bounded(DUE_CAPACITY);
        Self {
            inner,
            delay,
            scheduler,
            key: NEXT_SINK_KEY.fetch_add(1, Ordering::Relaxed),
            tx,
            rx,
            sink: None,
            notify: None,
        }
    }

    /// Configured delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    fn sink(&mut self) -> Arc<DueSink> {
        self.sink
            .get_or_insert_with(|| {
                Arc::new(DueSink {
                    key: self.key,
                    tx: self.tx.clone(),
                    notify: self.notify.clone(),
                })
            })
            .clone()
    }

    fn take_due(&mut self) {
        while let Ok(packet) = self.rx.try_recv() {
            if let Err(err) = self.inner.encode(packet) {
                warn!("dropping delayed packet: {}", err);
            }
        }
    }
}

impl<C: Codec> Codec for DelayCodec<C> {
    fn decode(&mut self, source_id: &str, bytes: &[u8]) -> Result<Vec<Packet>> {
        self.inner.decode(source_id, bytes)
    }

    fn encode(&mut self, packet: Packet) -> Result<()> {
        let sink = self.sink();
        trace!("delaying packet by {:?}", self.delay);
        if self.scheduler.schedule_after(self.delay, packet, sink) {
            Ok(())
        } else {
            Err(Error::Encode("delay scheduler is stopped".to_owned()))
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.take_due();
        self.inner.read(buf)
    }

    fn has_pending_output(&self) -> bool {
        !self.rx.is_empty() || self.inner.has_pending_output()
    }

    fn set_output_notify(&mut self, notify: NotifyCallback) {
        self.inner.set_output_notify(notify.clone());
        self.notify = Some(notify);
        self.sink = None;
    }

    fn close(&mut self) {
        while self.rx.try_recv().is_ok() {}
        self.inner.close();
    }
}
