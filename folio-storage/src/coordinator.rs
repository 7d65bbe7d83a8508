//! Per-key serialization of mutations.
//!
//! Every key with pending work owns a chain of continuations: each new
//! operation awaits the tail of the chain and then becomes the tail. Work on
//! different keys never waits on each other, and the map holds an entry only
//! while a key has pending work.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;

type Link = Shared<BoxFuture<'static, ()>>;

#[derive(Clone)]
struct Tail {
    ticket: u64,
    link: Link,
    /// Set under the chains lock once the operation has released the key.
    done: Arc<AtomicBool>,
}

struct Chains<K> {
    next_ticket: u64,
    tails: HashMap<K, Tail>,
}

/// Per-key async mutual exclusion.
///
/// Operations on the same key run one at a time, in submission order.
pub struct KeyLocks<K> {
    chains: Mutex<Chains<K>>,
}

impl<K> KeyLocks<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            chains: Mutex::new(Chains {
                next_ticket: 0,
                tails: HashMap::new(),
            }),
        }
    }

    /// Run `op` once every earlier operation on `key` has finished.
    ///
    /// If the returned future is dropped before `op` completes, later
    /// operations on the key are released all the same.
    pub async fn with_key_lock<F, Fut, T>(&self, key: K, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (released_tx, released_rx) = oneshot::channel::<()>();
        let done = Arc::new(AtomicBool::new(false));

        let (ticket, previous) = {
            let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
            let ticket = chains.next_ticket;
            chains.next_ticket = chains.next_ticket.wrapping_add(1);

            let previous = chains.tails.get(&key).cloned();
            let wait_for = previous.as_ref().map(|tail| tail.link.clone());
            let link = async move {
                if let Some(prev) = wait_for {
                    prev.await;
                }
                let _ = released_rx.await;
            }
            .boxed()
            .shared();

            let tail = Tail {
                ticket,
                link,
                done: Arc::clone(&done),
            };
            chains.tails.insert(key.clone(), tail);
            (ticket, previous)
        };

        let wait_for = previous.as_ref().map(|tail| tail.link.clone());
        let mut guard = Release {
            locks: self,
            key: Some(key),
            ticket,
            done,
            previous,
            started: false,
            released: Some(released_tx),
        };

        if let Some(prev) = wait_for {
            prev.await;
        }
        guard.started = true;
        let output = op().await;
        guard.finish();
        output
    }

    /// Keys that currently have pending or running work.
    pub fn pending_keys(&self) -> usize {
        self.chains
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tails
            .len()
    }

    /// Mark `ticket` finished and drop it from the tail of `key`'s chain.
    ///
    /// A waiter cancelled before it ran hands the tail back to the operation
    /// it was waiting on, unless that one has already finished.
    fn release(&self, key: K, ticket: u64, done: &AtomicBool, restore: Option<Tail>) {
        let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        done.store(true, Ordering::Release);
        let is_tail = chains
            .tails
            .get(&key)
            .is_some_and(|tail| tail.ticket == ticket);
        if !is_tail {
            return;
        }
        match restore {
            Some(previous) if !previous.done.load(Ordering::Acquire) => {
                chains.tails.insert(key, previous);
            }
            _ => {
                chains.tails.remove(&key);
            }
        }
    }
}

impl<K> Default for KeyLocks<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Hands the key to the next waiter on completion or cancellation.
struct Release<'a, K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    locks: &'a KeyLocks<K>,
    key: Option<K>,
    ticket: u64,
    done: Arc<AtomicBool>,
    previous: Option<Tail>,
    started: bool,
    released: Option<oneshot::Sender<()>>,
}

impl<K> Release<'_, K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn finish(&mut self) {
        if let Some(key) = self.key.take() {
            // Unlink before signalling so nobody chains onto a resolving link.
            let restore = if self.started {
                None
            } else {
                self.previous.take()
            };
            self.locks.release(key, self.ticket, &self.done, restore);
        }
        if let Some(released) = self.released.take() {
            let _ = released.send(());
        }
    }
}

impl<K> Drop for Release<'_, K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_runs_in_order() {
        let locks = Arc::new(KeyLocks::<String>::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5u64 {
            let locks = Arc::clone(&locks);
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                locks
                    .with_key_lock("k".to_string(), || async move {
                        log.lock().expect("log lock").push(format!("start {i}"));
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        log.lock().expect("log lock").push(format!("end {i}"));
                    })
                    .await;
            }));
            // Give each task time to enqueue so submission order is fixed.
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for handle in handles {
            handle.await.expect("task should not panic");
        }

        let log = log.lock().expect("log lock").clone();
        let expected: Vec<String> = (0..5)
            .flat_map(|i| [format!("start {i}"), format!("end {i}")])
            .collect();
        assert_eq!(log, expected);
        assert_eq!(locks.pending_keys(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_never_overlaps() {
        let locks = Arc::new(KeyLocks::<String>::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let active = Arc::clone(&active);
                let max_seen = Arc::clone(&max_seen);
                tokio::spawn(async move {
                    locks
                        .with_key_lock("shared".to_string(), || async move {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            tokio::task::yield_now().await;
                            active.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.expect("task should not panic");
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.pending_keys(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = Arc::new(KeyLocks::<String>::new());
        let (hold_tx, hold_rx) = oneshot::channel::<()>();

        let blocker = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .with_key_lock("a".to_string(), || async move {
                        let _ = hold_rx.await;
                    })
                    .await;
            })
        };
        tokio::task::yield_now().await;

        let other = tokio::time::timeout(
            Duration::from_secs(1),
            locks.with_key_lock("b".to_string(), || async { 7 }),
        )
        .await
        .expect("key b must not wait on key a");
        assert_eq!(other, 7);

        let _ = hold_tx.send(());
        blocker.await.expect("task should not panic");
        assert_eq!(locks.pending_keys(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_holder_releases_key() {
        let locks = Arc::new(KeyLocks::<String>::new());

        let stuck = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .with_key_lock("k".to_string(), || std::future::pending::<()>())
                    .await;
            })
        };
        tokio::task::yield_now().await;
        stuck.abort();
        let _ = stuck.await;

        let value = tokio::time::timeout(
            Duration::from_secs(1),
            locks.with_key_lock("k".to_string(), || async { "ran" }),
        )
        .await
        .expect("aborted holder must release the key");
        assert_eq!(value, "ran");
        assert_eq!(locks.pending_keys(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_after_holder_finished_leaves_no_entry() {
        let locks = Arc::new(KeyLocks::<String>::new());
        let (hold_tx, hold_rx) = oneshot::channel::<()>();

        let holder = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .with_key_lock("k".to_string(), || async move {
                        let _ = hold_rx.await;
                    })
                    .await;
            })
        };
        tokio::task::yield_now().await;

        // Poll the waiter once so it queues behind the holder.
        let mut waiter = Box::pin(locks.with_key_lock("k".to_string(), || async {}));
        assert!(futures_util::poll!(waiter.as_mut()).is_pending());

        // The holder finishes while nobody polls its link.
        let _ = hold_tx.send(());
        holder.await.expect("task should not panic");

        drop(waiter);
        assert_eq!(locks.pending_keys(), 0);

        let value = tokio::time::timeout(
            Duration::from_secs(1),
            locks.with_key_lock("k".to_string(), || async { "ran" }),
        )
        .await
        .expect("key must be free");
        assert_eq!(value, "ran");
        assert_eq!(locks.pending_keys(), 0);
    }
}
