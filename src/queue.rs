//! Bounded producer/consumer queue
//!
//! A background thread decodes records and publishes them in order; the
//! stage consumes them as an iterator. Dropping the consumer closes the
//! channel: the producer's next `publish` returns `false` and it stops
//! quietly. Nothing panics on a closed queue.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::{self, JoinHandle};

/// Default number of records in flight between producer and consumer
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Producer side handed to the background thread
pub struct Publisher<T> {
    sender: Sender<T>,
}

impl<T> Publisher<T> {
    /// Send one item, blocking while the queue is full.
    ///
    /// Returns `false` once the consumer is gone; the item is discarded.
    pub fn publish(&self, item: T) -> bool {
        self.sender.send(item).is_ok()
    }
}

/// Consumer side, iterated by the stage in FIFO order
pub struct Subscriber<T> {
    receiver: Option<Receiver<T>>,
    producer: Option<JoinHandle<()>>,
}

impl<T> Subscriber<T> {
    /// Stop consuming. The producer ends at its next publish.
    pub fn close(self) {
        drop(self);
    }
}

impl<T> Iterator for Subscriber<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.as_ref()?.recv().ok()
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        // Receiver first, so a producer blocked on a full queue wakes up and exits
        self.receiver.take();
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
    }
}

/// Run `produce` on a background thread feeding a bounded queue
pub fn spawn_producer<T, F>(capacity: usize, produce: F) -> Subscriber<T>
where
    T: Send + 'static,
    F: FnOnce(Publisher<T>) + Send + 'static,
{
    let (sender, receiver) = bounded(capacity.max(1));
    let producer = thread::spawn(move || produce(Publisher { sender }));

    Subscriber {
        receiver: Some(receiver),
        producer: Some(producer),
    }
}
