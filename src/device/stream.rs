//! In-order work streams.
//!
//! A [`Stream`] owns one worker thread draining a FIFO of ops. Ops enqueued on
//! the same stream execute in submission order; ops on different streams are
//! ordered only through events ([`Stream::record`] / [`Stream::wait_event`]).

use crossbeam::channel::{self, Sender};
use std::panic::AssertUnwindSafe;
use std::thread::JoinHandle;

use tracing::error;

use super::Event;

type Op = Box<dyn FnOnce() + Send + 'static>;

/// A FIFO execution queue backed by a dedicated worker thread.
pub struct Stream {
    tx: Option<Sender<Op>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    /// Spawn a stream; `name` labels the worker thread for diagnostics.
    pub fn new(name: &str) -> Self {
        let (tx, rx) = channel::unbounded::<Op>();
        let label = name.to_string();
        let worker = std::thread::Builder::new()
            .name(format!("latgen-{}", name))
            .spawn(move || {
                while let Ok(op) = rx.recv() {
                    // Keep the queue draining through a panicking op, so
                    // recorded events still complete and waiters never hang.
                    if std::panic::catch_unwind(AssertUnwindSafe(op)).is_err() {
                        error!(stream = %label, "stream op panicked");
                    }
                }
            })
            .expect("failed to spawn stream worker");
        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Enqueue an op; returns immediately.
    pub fn enqueue<F>(&self, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(tx) = &self.tx {
            // The worker only exits after the sender is dropped, so this
            // cannot fail while the stream is alive.
            let _ = tx.send(Box::new(op));
        }
    }

    /// Record `event` on this stream: the event becomes ready once every op
    /// enqueued before this call has executed.
    pub fn record(&self, event: &Event) {
        let generation = event.mark_pending();
        let event = event.clone();
        self.enqueue(move || event.complete(generation));
    }

    /// Make subsequent ops on this stream wait until `event` is ready.
    pub fn wait_event(&self, event: &Event) {
        let event = event.clone();
        self.enqueue(move || event.synchronize());
    }

    /// Block the calling thread until every op enqueued so far has executed.
    pub fn synchronize(&self) {
        let event = Event::new();
        self.record(&event);
        event.synchronize();
    }

    /// Suspend until every op enqueued so far has executed.
    pub async fn drain(&self) {
        let event = Event::new();
        self.record(&event);
        event.wait().await;
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish its queue and exit.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_ops_run_in_order() {
        let stream = Stream::new("test");
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = log.clone();
            stream.enqueue(move || log.lock().push(i));
        }
        stream.synchronize();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_cross_stream_event_ordering() {
        let producer = Stream::new("producer");
        let consumer = Stream::new("consumer");
        let event = Event::new();
        let value = Arc::new(AtomicUsize::new(0));

        {
            let value = value.clone();
            producer.enqueue(move || {
                std::thread::sleep(std::time::Duration::from_millis(5));
                value.store(42, Ordering::SeqCst);
            });
        }
        producer.record(&event);

        consumer.wait_event(&event);
        let observed = Arc::new(AtomicUsize::new(0));
        {
            let value = value.clone();
            let observed = observed.clone();
            consumer.enqueue(move || {
                observed.store(value.load(Ordering::SeqCst), Ordering::SeqCst);
            });
        }
        consumer.synchronize();
        assert_eq!(observed.load(Ordering::SeqCst), 42);
    }

    #[tokio::test]
    async fn test_drain_waits_for_queue() {
        let stream = Stream::new("drain");
        let value = Arc::new(AtomicUsize::new(0));
        {
            let value = value.clone();
            stream.enqueue(move || {
                std::thread::sleep(std::time::Duration::from_millis(5));
                value.store(7, Ordering::SeqCst);
            });
        }
        stream.drain().await;
        assert_eq!(value.load(Ordering::SeqCst), 7);
    }
}
