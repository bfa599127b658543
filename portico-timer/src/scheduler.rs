use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use core_affinity::{set_for_current, CoreId};
use log::{debug, error, trace};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::queue::{DelayQueue, Deliver};

// Upper bound for one idle sleep; any new submission wakes the worker earlier.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

enum Command<T> {
    Schedule {
        due: Instant,
        item: T,
        sink: Arc<dyn Deliver<T>>,
    },
    Stop,
}

/// A factory that configures and spawns a [`DelayScheduler`] worker thread.
#[derive(Debug)]
pub struct SchedulerBuilder {
    core_id: Option<CoreId>,
    name: String,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            core_id: None,
            name: "portico-delay".to_owned(),
        }
    }
}

impl SchedulerBuilder {
    /// Creates a new SchedulerBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the worker thread.
    pub fn name(mut self, name: &str) -> Self {
        self.name = String::from(name);
        self
    }

    /// Pins the worker thread to the specified CPU core
    pub fn core_id(mut self, core_id: CoreId) -> Self {
        self.core_id = Some(core_id);
        self
    }

    /// Spawns the worker thread.
    pub fn spawn<T>(mut self) -> io::Result<DelayScheduler<T>>
    where
        T: Send + 'static,
    {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (tx, rx) = unbounded_channel();
        let mut core_id = self.core_id.take();
        let name = self.name.clone();

        let thread = thread::Builder::new().name(self.name).spawn(move || {
            if let Some(core_id) = core_id.take() {
                if !set_for_current(core_id) {
                    debug!("{}: could not pin to core {}", name, core_id.id);
                }
            }
            rt.block_on(run(rx));
            debug!("{} stopped", name);
        })?;

        Ok(DelayScheduler {
            handle: SchedulerHandle { tx },
            thread: Some(thread),
        })
    }
}

async fn run<T>(mut rx: UnboundedReceiver<Command<T>>) {
    let mut queue = DelayQueue::new();
    loop {
        let deadline = queue
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_SLEEP);

        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Schedule { due, item, sink }) => queue.push(due, item, sink),
                Some(Command::Stop) | None => break,
            },
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
        }

        let delivered = queue.fire(Instant::now());
        if delivered > 0 {
            trace!("delivered {} due items, {} waiting", delivered, queue.len());
        }
    }
    if !queue.is_empty() {
        debug!("dropping {} undelivered items", queue.len());
    }
}

/// Cloneable submission handle of a [`DelayScheduler`].
pub struct SchedulerHandle<T> {
    tx: UnboundedSender<Command<T>>,
}

impl<T> Clone for SchedulerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> SchedulerHandle<T> {
    /// Schedules `item` for delivery to `sink` at `due`.
    ///
    /// Returns false, dropping the item, when the scheduler has stopped.
    pub fn schedule(&self, due: Instant, item: T, sink: Arc<dyn Deliver<T>>) -> bool {
        self.tx.send(Command::Schedule { due, item, sink }).is_ok()
    }

    /// Schedules `item` for delivery to `sink` after `delay`.
    pub fn schedule_after(&self, delay: Duration, item: T, sink: Arc<dyn Deliver<T>>) -> bool {
        self.schedule(Instant::now() + delay, item, sink)
    }

    /// True while the worker accepts submissions.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Owner of the delay worker thread.
///
/// The worker sleeps until the earliest deadline or the next submission. It stops on
/// [`DelayScheduler::stop`] or when the scheduler is dropped; undelivered items are
/// dropped with it.
pub struct DelayScheduler<T> {
    handle: SchedulerHandle<T>,
    thread: Option<JoinHandle<()>>,
}

impl<T> DelayScheduler<T> {
    /// Handle for submitting items.
    pub fn handle(&self) -> SchedulerHandle<T> {
        self.handle.clone()
    }

    /// Stops the worker and waits for it to exit. Idempotent.
    pub fn stop(&mut self) {
        let _ = self.handle.tx.send(Command::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("delay scheduler worker panicked");
            }
        }
    }
}

impl<T> Drop for DelayScheduler<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Delivery;
    use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

    struct ChannelSink(Sender<(u32, Instant)>);

    impl Deliver<u32> for ChannelSink {
        fn key(&self) -> u64 {
            1
        }

        fn deliver(&self, item: u32) -> Delivery<u32> {
            match self.0.try_send((item, Instant::now())) {
                Ok(()) => Delivery::Delivered,
                Err(TrySendError::Full((item, _))) => Delivery::Full(item),
                Err(TrySendError::Disconnected(_)) => Delivery::Gone,
            }
        }
    }

    fn sink(capacity: usize) -> (Arc<dyn Deliver<u32>>, Receiver<(u32, Instant)>) {
        let (tx, rx) = bounded(capacity);
        (Arc::new(ChannelSink(tx)), rx)
    }

    #[test]
    fn delivers_after_delay_in_order() {
        let scheduler = SchedulerBuilder::new().name("test-delay").spawn::<u32>().unwrap();
        let handle = scheduler.handle();
        let (sink, rx) = sink(16);

        let start = Instant::now();
        let delay = Duration::from_millis(40);
        for i in 0..5 {
            assert!(handle.schedule(start + delay, i, sink.clone()));
        }

        for expected in 0..5 {
            let (item, at) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(item, expected);
            assert!(at.duration_since(start) >= delay);
        }
    }

    #[test]
    fn full_channel_is_retried() {
        let scheduler = SchedulerBuilder::new().spawn::<u32>().unwrap();
        let handle = scheduler.handle();
        let (sink, rx) = sink(1);

        for i in 0..4 {
            handle.schedule_after(Duration::ZERO, i, sink.clone());
        }

        let mut received = Vec::new();
        while received.len() < 4 {
            let (item, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            received.push(item);
        }
        assert_eq!(received, vec![0, 1, 2, 3]);
    }

    #[test]
    fn stop_rejects_new_items() {
        let mut scheduler = SchedulerBuilder::new().spawn::<u32>().unwrap();
        let handle = scheduler.handle();
        assert!(handle.is_running());

        scheduler.stop();
        scheduler.stop();

        let (sink, _rx) = sink(1);
        assert!(!handle.is_running());
        assert!(!handle.schedule_after(Duration::ZERO, 1, sink));
    }
}
