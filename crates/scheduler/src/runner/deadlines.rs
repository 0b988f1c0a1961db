use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

/// Callback run once its deadline has passed.
pub(super) type Expiry = Box<dyn FnOnce() + Send + 'static>;

struct Deadline {
    at: Instant,
    seq: u64,
    expire: Expiry,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

/// Fires submission deadlines from a dedicated `keystone-deadlines` thread,
/// so timed futures resolve on any executor.
///
/// The thread starts on first use and exits once the watcher is dropped.
/// Pending expiries are dropped with it.
#[derive(Default)]
pub(super) struct DeadlineWatcher {
    inner: Mutex<WatcherState>,
}

#[derive(Default)]
struct WatcherState {
    tx: Option<Sender<Deadline>>,
    seq: u64,
}

impl DeadlineWatcher {
    /// Run `expire` on the watcher thread once `at` has passed.
    pub(super) fn watch(&self, at: Instant, expire: Expiry) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.seq += 1;
        let deadline = Deadline { at, seq: state.seq, expire };

        let deadline = match &state.tx {
            Some(tx) => match tx.send(deadline) {
                Ok(()) => return,
                Err(err) => err.into_inner(),
            },
            None => deadline,
        };
        // Not started yet, or the thread is gone: start a fresh one.
        match spawn_watcher() {
            Ok(tx) => {
                if let Err(err) = tx.send(deadline) {
                    warn!(error = %err, "Deadline watcher rejected a deadline");
                }
                state.tx = Some(tx);
            }
            Err(err) => {
                state.tx = None;
                warn!(error = %err, "Failed to start deadline watcher; deadline not enforced");
            }
        }
    }
}

fn spawn_watcher() -> std::io::Result<Sender<Deadline>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::Builder::new()
        .name("keystone-deadlines".to_string())
        .spawn(move || run(rx))?;
    debug!("Deadline watcher started");
    Ok(tx)
}

fn run(rx: Receiver<Deadline>) {
    let mut pending: BinaryHeap<Reverse<Deadline>> = BinaryHeap::new();
    loop {
        let next = match pending.peek() {
            Some(Reverse(first)) => rx.recv_deadline(first.at),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match next {
            Ok(deadline) => pending.push(Reverse(deadline)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        while pending.peek().is_some_and(|Reverse(first)| first.at <= now) {
            if let Some(Reverse(due)) = pending.pop() {
                (due.expire)();
            }
        }
    }
    debug!(dropped = pending.len(), "Deadline watcher stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    #[test]
    fn expiries_fire_in_deadline_order() {
        let watcher = DeadlineWatcher::default();
        let (tx, rx) = crossbeam_channel::unbounded();
        let now = Instant::now();
        for (id, ms) in [(3, 45), (1, 5), (2, 25)] {
            let tx = tx.clone();
            watcher.watch(now + Duration::from_millis(ms), Box::new(move || tx.send(id).unwrap()));
        }

        let fired: Vec<i32> = (0..3).map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap()).collect();
        assert_eq!(fired, vec![1, 2, 3]);
        assert!(Instant::now() >= now + Duration::from_millis(45));
    }

    #[test]
    fn dropping_the_watcher_drops_pending_expiries() {
        let fired = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&fired);
        let watcher = DeadlineWatcher::default();
        watcher.watch(Instant::now() + Duration::from_secs(60), Box::new(move || *flag.lock().unwrap() = true));
        drop(watcher);

        let deadline = Instant::now() + Duration::from_secs(2);
        while Arc::strong_count(&fired) > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(Arc::strong_count(&fired), 1);
        assert!(!*fired.lock().unwrap());
    }
}
