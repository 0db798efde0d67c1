use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_utils::Backoff;
use paumiot_core::{error::Result, ring_queue::RingQueue};
use paumiot_protocol::InternalMessage;
use tracing::{debug, error, info};

const IDLE_PARK: Duration = Duration::from_millis(1);

/// Downstream consumer of decoded messages.
///
/// Called from dispatch worker threads, never from the event loop.
pub trait MessageHandler: Send + Sync + 'static {
    /// Routes one message.
    fn handle(&self, message: InternalMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(InternalMessage) + Send + Sync + 'static,
{
    fn handle(&self, message: InternalMessage) {
        self(message)
    }
}

struct Shared {
    queue: RingQueue<InternalMessage>,
    shutdown: AtomicBool,
    handled: AtomicU64,
}

/// Worker pool draining a shared ring queue into a [`MessageHandler`].
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.workers.len())
            .field("pending", &self.pending())
            .field("handled", &self.handled())
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>, handler: Arc<dyn MessageHandler>) {
    let backoff = Backoff::new();
    loop {
        if let Some(message) = shared.queue.dequeue() {
            handler.handle(message);
            shared.handled.fetch_add(1, Ordering::Relaxed);
            backoff.reset();
            continue;
        }
        // Only leave once the queue is empty so shutdown drains it.
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        if backoff.is_completed() {
            thread::park_timeout(IDLE_PARK);
        } else {
            backoff.snooze();
        }
    }
}

impl Dispatcher {
    /// Starts `workers` threads over a queue of `capacity` slots.
    ///
    /// `capacity` must be a power of two.
    pub fn new(workers: usize, capacity: usize, handler: Arc<dyn MessageHandler>) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: RingQueue::new(capacity)?,
            shutdown: AtomicBool::new(false),
            handled: AtomicU64::new(0),
        });

        let mut dispatcher = Self { shared, workers: Vec::with_capacity(workers) };
        for index in 0..workers {
            let shared = Arc::clone(&dispatcher.shared);
            let handler = Arc::clone(&handler);
            let spawned = thread::Builder::new()
                .name(format!("paumiot-dispatch-{}", index))
                .spawn(move || worker_loop(shared, handler));
            match spawned {
                Ok(handle) => dispatcher.workers.push(handle),
                Err(err) => {
                    dispatcher.shutdown();
                    return Err(err.into());
                }
            }
        }
        info!("[DISPATCH] started {} workers, queue capacity {}", workers, capacity);
        Ok(dispatcher)
    }

    /// Queues `message`, handing it back if the queue is full or the pool stopped.
    pub fn submit(&self, message: InternalMessage) -> std::result::Result<(), InternalMessage> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(message);
        }
        self.shared.queue.enqueue(message)
    }

    /// Messages waiting in the queue.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Messages handed to the handler so far.
    pub fn handled(&self) -> u64 {
        self.shared.handled.load(Ordering::Relaxed)
    }

    /// Number of running workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops accepting messages, lets the workers drain the queue and joins them.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if self.workers.is_empty() {
            return;
        }
        for worker in self.workers.drain(..) {
            worker.thread().unpark();
            if worker.join().is_err() {
                error!("[DISPATCH] a worker panicked");
            }
        }
        debug!("[DISPATCH] stopped after {} messages", self.handled());
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
