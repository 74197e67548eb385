//! Background-thread polling utilities shared by the file indexer and the
//! playback engine: both need a single worker thread that is repeatedly
//! polled for values (progress events, timer ticks) and that can be asked
//! to stop by dropping a handle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use tracing::trace;


/// Blocks on a single background producer thread and aggregates the values
/// it sends, repeatedly.
#[derive(Debug)]
pub struct ThreadPoll<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    count: AtomicUsize,
}

impl<T: Send + 'static> ThreadPoll<T> {

    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(2);
        Self {
            tx, rx, count: AtomicUsize::new(0),
        }
    }

    /// Spawn a new value producer that will be continuously polled and its
    /// result added to the internal queue retrievable with [`Self::poll`].
    /// The producer's thread terminates when it returns `None`.
    pub fn spawn<F>(&self, mut producer: F)
    where
        F: FnMut() -> Option<T>,
        F: Send + 'static,
    {
        let tx = self.tx.clone();
        let num = self.count.fetch_add(1, Ordering::Relaxed);

        thread::Builder::new()
            .name(format!("poll-worker-{num}"))
            .spawn(move || {
                trace!("spawned poll worker #{num}");
                while let Some(value) = producer() {
                    if tx.send(value).is_err() {
                        break;
                    }
                }
                trace!("terminated poll worker #{num}");
            })
            .expect("failed to spawn poll worker thread");
    }

    /// Same as [`Self::spawn`] but also returns a handle that, when
    /// dropped, requests cancellation. Unlike [`Self::spawn`], `producer`
    /// is handed a reference to the shared cancel flag directly (true once
    /// cancellation has been requested) so a single long-running producer
    /// call — such as a full file scan — can check it at its own inner loop
    /// iterations rather than only being gated between calls.
    pub fn spawn_with_handle<F>(&self, mut producer: F) -> ThreadPollHandle
    where
        F: FnMut(&AtomicBool) -> Option<T>,
        F: Send + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = Arc::clone(&cancel);
        self.spawn(move || producer(&thread_cancel));
        ThreadPollHandle(cancel)
    }

    /// Block until a new value is available.
    pub fn poll(&self) -> T {
        // Unwrap because we own both ends so it should not disconnect.
        self.rx.recv().unwrap()
    }

    /// Non-blocking poll.
    pub fn try_poll(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

}

/// A handle to a spawned poll worker. Dropping it requests cancellation;
/// it does not wait for the thread to exit. The inner flag is true once
/// cancellation has been requested, matching the `cancel: &AtomicBool`
/// convention used by [`crate::index::FileIndexer::index_file`].
#[derive(Debug, Clone)]
pub struct ThreadPollHandle(Arc<AtomicBool>);

impl ThreadPollHandle {
    /// Ask the worker to stop without waiting for it to actually do so.
    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns true if the worker has not been asked to stop (it may still
    /// have already exited on its own).
    #[inline]
    pub fn is_alive(&self) -> bool {
        !self.0.load(Ordering::Relaxed)
    }

    /// The shared cancel flag itself, for passing directly to APIs that
    /// expect a `&AtomicBool` cancel token (e.g. [`crate::index::FileIndexer::index_file`]).
    #[inline]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

impl Drop for ThreadPollHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn spawn_aggregates_values_until_none() {
        let poll: ThreadPoll<u32> = ThreadPoll::new();
        let mut next = 0u32;
        poll.spawn(move || {
            next += 1;
            if next <= 3 { Some(next) } else { None }
        });
        assert_eq!(poll.poll(), 1);
        assert_eq!(poll.poll(), 2);
        assert_eq!(poll.poll(), 3);
    }

    #[test]
    fn try_poll_does_not_block_when_empty() {
        let poll: ThreadPoll<u32> = ThreadPoll::new();
        assert_eq!(poll.try_poll(), None);
    }

    #[test]
    fn handle_starts_alive_and_flag_starts_uncancelled() {
        let poll: ThreadPoll<()> = ThreadPoll::new();
        let handle = poll.spawn_with_handle(|_cancel| None);
        assert!(handle.is_alive());
        assert!(!handle.cancel_flag().load(Ordering::Relaxed));
    }

    #[test]
    fn cancel_sets_the_shared_flag() {
        let poll: ThreadPoll<()> = ThreadPoll::new();
        let handle = poll.spawn_with_handle(|_cancel| None);
        handle.cancel();
        assert!(!handle.is_alive());
        assert!(handle.cancel_flag().load(Ordering::Relaxed));
    }

    #[test]
    fn dropping_handle_requests_cancellation() {
        let poll: ThreadPoll<()> = ThreadPoll::new();
        let handle = poll.spawn_with_handle(|_cancel| None);
        let flag = handle.cancel_flag();
        assert!(!flag.load(Ordering::Relaxed));
        drop(handle);
        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn producer_observes_cancel_flag_mid_loop() {
        let poll: ThreadPoll<u32> = ThreadPoll::new();
        let handle = poll.spawn_with_handle(|cancel| {
            let mut ticks = 0u32;
            while !cancel.load(Ordering::Relaxed) {
                ticks += 1;
                if ticks > 1000 {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            Some(ticks)
        });
        thread::sleep(Duration::from_millis(20));
        handle.cancel();
        let ticks = poll.poll();
        assert!(ticks < 1000, "producer should have observed cancellation before exhausting its loop");
    }
}
