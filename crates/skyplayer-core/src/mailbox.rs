//! Bounded single-consumer event queue.
//!
//! The [`Mailbox`] decouples the threads that *produce* control/status events (decode
//! threads, host calls, the audio engine) from the one worker thread that *consumes*
//! them:
//! - `put` never blocks; it fails fast when the queue is full or shutting down
//! - exactly one worker pops events in FIFO order and runs the handler for each
//! - handler errors and panics are logged and swallowed so the worker keeps going
//!
//! All flags live under the same mutex as the queue, so a waiter can never miss a
//! state change between checking a flag and going to sleep.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::config::MailboxConfig;
use crate::messages::{MSG_ANY, Message, message_name};

/// Callback run on the worker thread for every delivered event.
pub type MessageHandler = Box<dyn FnMut(&Message) -> Result<()> + Send>;

/// Thread-safe bounded event queue with its own consumer thread.
///
/// ## Lifecycle
/// `new` → `start(handler)` → any number of `put`/`pause`/`resume`/`flush`/`remove`
/// → `abort` and/or `destroy`. `destroy` also runs on drop.
///
/// `aborting` and `destroyed` are one-way. Once set, `put` and `start` are no-ops and
/// the worker exits at its next wake-up, even if events are still queued.
pub struct Mailbox {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<Inner>,
    cv: Condvar,
    capacity: usize,
    poll_interval: Duration,
}

struct Inner {
    queue: VecDeque<Message>,
    running: bool,
    paused: bool,
    aborting: bool,
    destroyed: bool,
    worker: Option<JoinHandle<()>>,
    worker_id: Option<ThreadId>,
}

impl Mailbox {
    /// Create an idle mailbox. Events can be queued before `start`.
    pub fn new(capacity: usize, poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    queue: VecDeque::new(),
                    running: false,
                    paused: false,
                    aborting: false,
                    destroyed: false,
                    worker: None,
                    worker_id: None,
                }),
                cv: Condvar::new(),
                capacity: capacity.max(1),
                poll_interval: poll_interval.max(Duration::from_millis(1)),
            }),
        }
    }

    pub fn with_config(config: &MailboxConfig) -> Self {
        Self::new(config.capacity, config.poll_interval)
    }

    /// Register `handler` and spawn the worker thread.
    ///
    /// Returns `false` without replacing anything if a worker is already running or the
    /// mailbox has been aborted/destroyed. Also fails if the OS refuses to spawn a thread.
    pub fn start(&self, handler: MessageHandler) -> bool {
        let mut g = self.shared.lock();
        if g.destroyed || g.aborting || g.running {
            return false;
        }

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("mailbox".to_string())
            .spawn(move || worker_loop(&shared, handler));
        match spawned {
            Ok(handle) => {
                g.running = true;
                g.worker_id = Some(handle.thread().id());
                g.worker = Some(handle);
                tracing::debug!(capacity = self.shared.capacity, "mailbox worker started");
                true
            }
            Err(e) => {
                tracing::error!("mailbox worker spawn failed: {e}");
                false
            }
        }
    }

    /// Append `msg` to the tail.
    ///
    /// Returns `false` (the event is dropped) when the mailbox is full, aborting or
    /// destroyed. Never blocks beyond the queue lock.
    pub fn put(&self, msg: Message) -> bool {
        let mut g = self.shared.lock();
        if g.destroyed || g.aborting {
            return false;
        }
        if g.queue.len() >= self.shared.capacity {
            tracing::debug!(
                what = msg.what,
                kind = message_name(msg.what),
                capacity = self.shared.capacity,
                "mailbox full"
            );
            return false;
        }
        g.queue.push_back(msg);
        drop(g);
        self.shared.cv.notify_one();
        true
    }

    /// Pop one event, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout, while paused, or once aborting/destroyed. Intended for
    /// mailboxes that are drained by the caller instead of a started worker.
    pub fn get(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut g = self.shared.lock();
        loop {
            if g.destroyed || g.aborting || g.paused {
                return None;
            }
            if let Some(msg) = g.queue.pop_front() {
                return Some(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            g = self
                .shared
                .cv
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Stop delivering events without discarding them.
    pub fn pause(&self) {
        self.set_paused(true);
    }

    /// Resume delivery of everything queued while paused, in order.
    pub fn resume(&self) {
        self.set_paused(false);
    }

    fn set_paused(&self, paused: bool) {
        let mut g = self.shared.lock();
        if g.paused == paused {
            return;
        }
        g.paused = paused;
        drop(g);
        tracing::debug!(paused, "mailbox pause toggled");
        self.shared.cv.notify_all();
    }

    /// Discard every queued event. Flags are left untouched.
    pub fn flush(&self) -> usize {
        let mut g = self.shared.lock();
        let n = g.queue.len();
        g.queue.clear();
        n
    }

    /// Remove every queued event of kind `what` ([`MSG_ANY`] matches all).
    ///
    /// The relative order of the remaining events is preserved. Returns the number removed.
    pub fn remove(&self, what: i32) -> usize {
        let mut g = self.shared.lock();
        let before = g.queue.len();
        if what == MSG_ANY {
            g.queue.clear();
        } else {
            g.queue.retain(|m| m.what != what);
        }
        before - g.queue.len()
    }

    /// Stop consumption for good and wait for the worker to exit.
    ///
    /// When called from the worker itself (inside the handler) this only raises the
    /// flag; the worker exits after the handler returns.
    pub fn abort(&self) {
        let handle = {
            let mut g = self.shared.lock();
            g.aborting = true;
            self.take_joinable(&mut g)
        };
        self.shared.cv.notify_all();
        join_worker(handle);
    }

    /// Tear down: raise `destroyed`/`aborting`, drop queued events and join the worker.
    ///
    /// Idempotent. Only the first caller does any work; later or concurrent callers
    /// return immediately.
    pub fn destroy(&self) {
        let handle = {
            let mut g = self.shared.lock();
            if g.destroyed {
                return;
            }
            g.destroyed = true;
            g.aborting = true;
            g.queue.clear();
            self.take_joinable(&mut g)
        };
        self.shared.cv.notify_all();
        join_worker(handle);
        tracing::debug!("mailbox destroyed");
    }

    /// Worker handle, unless the caller *is* the worker.
    fn take_joinable(&self, g: &mut Inner) -> Option<JoinHandle<()>> {
        if g.worker_id == Some(thread::current().id()) {
            return None;
        }
        g.worker.take()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Whether a worker thread is currently running.
    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    pub fn is_aborting(&self) -> bool {
        self.shared.lock().aborting
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.lock().destroyed
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until an event is available, or return `None` when the worker must exit.
    fn next_message(&self) -> Option<Message> {
        let mut g = self.lock();
        loop {
            if g.destroyed || g.aborting {
                return None;
            }
            if g.paused {
                // No timeout: a paused mailbox sleeps until resumed or torn down.
                g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            if let Some(msg) = g.queue.pop_front() {
                return Some(msg);
            }
            g = self
                .cv
                .wait_timeout(g, self.poll_interval)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

fn worker_loop(shared: &Shared, mut handler: MessageHandler) {
    while let Some(msg) = shared.next_message() {
        dispatch(&mut handler, &msg);
    }
    shared.lock().running = false;
    tracing::debug!("mailbox worker exited");
}

fn dispatch(handler: &mut MessageHandler, msg: &Message) {
    match panic::catch_unwind(AssertUnwindSafe(|| handler(msg))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(
                what = msg.what,
                kind = message_name(msg.what),
                "message handler failed: {e:#}"
            );
        }
        Err(payload) => {
            tracing::error!(
                what = msg.what,
                kind = message_name(msg.what),
                "message handler panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

fn join_worker(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            tracing::error!("mailbox worker terminated abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MSG_COMPLETED, MSG_ERROR, MSG_PREPARED, MSG_REQ_SEEK};
    use anyhow::anyhow;
    use std::sync::mpsc;

    fn mailbox(capacity: usize) -> Mailbox {
        Mailbox::new(capacity, Duration::from_millis(10))
    }

    fn forwarding_handler(tx: mpsc::Sender<Message>) -> MessageHandler {
        Box::new(move |m: &Message| {
            let _ = tx.send(m.clone());
            Ok(())
        })
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn delivers_in_fifo_order() {
        let mb = mailbox(1000);
        let (tx, rx) = mpsc::channel();
        assert!(mb.start(forwarding_handler(tx)));

        for i in 0..200 {
            assert!(mb.put(Message::with_args(MSG_PREPARED, i, -i)));
        }
        for i in 0..200 {
            let m = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(m.arg1, i);
            assert_eq!(m.arg2, -i);
        }
    }

    #[test]
    fn start_twice_is_noop() {
        let mb = mailbox(8);
        let (tx, _rx) = mpsc::channel();
        assert!(mb.start(forwarding_handler(tx.clone())));
        assert!(!mb.start(forwarding_handler(tx)));
        assert!(mb.is_running());
    }

    #[test]
    fn put_after_destroy_fails_and_queue_stays_empty() {
        let mb = mailbox(8);
        assert!(mb.put(Message::new(MSG_ERROR)));
        mb.destroy();
        assert_eq!(mb.len(), 0);
        assert!(!mb.put(Message::new(MSG_ERROR)));
        assert_eq!(mb.len(), 0);
        let (tx, _rx) = mpsc::channel();
        assert!(!mb.start(forwarding_handler(tx)));
    }

    #[test]
    fn overflow_drops_exactly_the_excess() {
        let mb = mailbox(1000);
        let failed = (0..1001)
            .filter(|i| !mb.put(Message::with_args(MSG_PREPARED, *i, 0)))
            .count();
        assert_eq!(failed, 1);
        assert_eq!(mb.len(), 1000);
    }

    #[test]
    fn remove_filters_kind_and_keeps_order() {
        let mb = mailbox(16);
        mb.put(Message::with_args(MSG_PREPARED, 1, 0));
        mb.put(Message::with_args(MSG_REQ_SEEK, 2, 0));
        mb.put(Message::with_args(MSG_COMPLETED, 3, 0));
        mb.put(Message::with_args(MSG_REQ_SEEK, 4, 0));
        mb.put(Message::with_args(MSG_ERROR, 5, 0));

        assert_eq!(mb.remove(MSG_REQ_SEEK), 2);
        let rest: Vec<i32> = std::iter::from_fn(|| mb.get(Duration::ZERO))
            .map(|m| m.arg1)
            .collect();
        assert_eq!(rest, vec![1, 3, 5]);
    }

    #[test]
    fn remove_wildcard_empties_queue() {
        let mb = mailbox(16);
        for i in 0..5 {
            mb.put(Message::with_args(MSG_PREPARED, i, 0));
        }
        assert_eq!(mb.remove(MSG_ANY), 5);
        assert!(mb.is_empty());
        assert_eq!(mb.remove(MSG_ANY), 0);
    }

    #[test]
    fn paused_mailbox_holds_events_until_resumed() {
        let mb = mailbox(100);
        let (tx, rx) = mpsc::channel();
        mb.pause();
        assert!(mb.start(forwarding_handler(tx)));

        for i in 0..10 {
            assert!(mb.put(Message::with_args(MSG_PREPARED, i, 0)));
        }
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(mb.len(), 10);

        mb.resume();
        for i in 0..10 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().arg1, i);
        }
    }

    #[test]
    fn flush_discards_without_touching_flags() {
        let mb = mailbox(16);
        mb.pause();
        mb.put(Message::new(MSG_PREPARED));
        mb.put(Message::new(MSG_COMPLETED));
        assert_eq!(mb.flush(), 2);
        assert!(mb.is_empty());
        assert!(mb.is_paused());
        assert!(!mb.is_destroyed());
        assert!(mb.put(Message::new(MSG_PREPARED)));
    }

    #[test]
    fn handler_failures_do_not_stop_worker() {
        let mb = mailbox(16);
        let (tx, rx) = mpsc::channel();
        mb.start(Box::new(move |m: &Message| {
            match m.arg1 {
                0 => Err(anyhow!("bad event")),
                1 => panic!("handler blew up"),
                n => {
                    let _ = tx.send(n);
                    Ok(())
                }
            }
        }));

        mb.put(Message::with_args(MSG_ERROR, 0, 0));
        mb.put(Message::with_args(MSG_ERROR, 1, 0));
        mb.put(Message::with_args(MSG_ERROR, 2, 0));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        assert!(mb.is_running());
    }

    #[test]
    fn abort_from_worker_does_not_deadlock() {
        let mb = Arc::new(mailbox(16));
        let (tx, rx) = mpsc::channel();
        let mb_handler = Arc::downgrade(&mb);
        mb.start(Box::new(move |_m: &Message| {
            if let Some(mb) = mb_handler.upgrade() {
                mb.abort();
            }
            let _ = tx.send(());
            Ok(())
        }));

        mb.put(Message::new(MSG_COMPLETED));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(wait_until(|| !mb.is_running()));
        assert!(!mb.put(Message::new(MSG_COMPLETED)));
        mb.destroy();
    }

    #[test]
    fn abort_joins_worker_and_leaves_queue_undelivered() {
        let mb = mailbox(16);
        let (tx, rx) = mpsc::channel();
        mb.pause();
        mb.start(forwarding_handler(tx));
        mb.put(Message::new(MSG_PREPARED));

        mb.abort();
        assert!(!mb.is_running());
        assert!(mb.is_aborting());
        mb.resume();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn concurrent_destroy_is_safe() {
        let mb = Arc::new(mailbox(16));
        let (tx, _rx) = mpsc::channel();
        mb.start(forwarding_handler(tx));
        let barrier = Arc::new(std::sync::Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mb = mb.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    mb.destroy();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(mb.is_destroyed());
        assert!(wait_until(|| !mb.is_running()));
    }

    #[test]
    fn get_times_out_when_empty() {
        let mb = mailbox(4);
        let start = Instant::now();
        assert!(mb.get(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
