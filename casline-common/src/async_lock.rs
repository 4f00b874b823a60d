// Copyright 2025 casline Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A reader/writer lock that never blocks the calling thread.
//!
//! Acquisition either completes synchronously (the lock is free) or enqueues a [`Waiter`] whose completion fires
//! later, from the context that releases the lock. Queued waiters are served in FIFO order, a contiguous run of
//! readers is granted together and a writer is granted only after every reader ahead of it has been drained.

use std::{collections::VecDeque, fmt::Debug, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    error::{Error, Result},
    metrics::Metrics,
};

/// Completion callback of a [`Waiter`].
///
/// Receives back the waiter's private payload and the acquisition result.
pub type Completion<P> = Box<dyn FnOnce(P, Result<()>) + Send + 'static>;

/// A pending acquisition of an [`AsyncRwLock`], carrying a caller-private payload.
pub struct Waiter<P> {
    write_lock: bool,
    payload: P,
    completion: Completion<P>,
}

impl<P> Debug for Waiter<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter").field("write_lock", &self.write_lock).finish()
    }
}

impl<P> Waiter<P> {
    /// Create a waiter with the given payload and completion.
    pub fn new<F>(payload: P, completion: F) -> Self
    where
        F: FnOnce(P, Result<()>) + Send + 'static,
    {
        Self {
            write_lock: false,
            payload,
            completion: Box::new(completion),
        }
    }

    /// Caller-private payload.
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Mutable caller-private payload.
    pub fn payload_mut(&mut self) -> &mut P {
        &mut self.payload
    }

    fn complete(self, res: Result<()>) {
        (self.completion)(self.payload, res)
    }
}

#[derive(Debug)]
struct State<P> {
    readers: usize,
    writer: bool,
    waiters: VecDeque<Waiter<P>>,
}

impl<P> State<P> {
    /// Move the waiters that can be granted now out of the queue.
    ///
    /// Every queued reader up to the first queued writer is granted. The writer itself is granted only if no reader
    /// holds the lock at that point.
    fn collect(&mut self) -> Vec<Waiter<P>> {
        let mut ready = vec![];
        while let Some(waiter) = self.waiters.front() {
            if !waiter.write_lock {
                self.readers += 1;
            } else if self.readers == 0 {
                self.writer = true;
            } else {
                break;
            }
            let write_lock = waiter.write_lock;
            // The front element has just been checked.
            if let Some(waiter) = self.waiters.pop_front() {
                ready.push(waiter);
            }
            if write_lock {
                break;
            }
        }
        ready
    }
}

/// Non-blocking reader/writer lock with FIFO waiter queue and completion callbacks.
///
/// `P` is the type of the private payload every [`Waiter`] of this lock carries.
pub struct AsyncRwLock<P = ()> {
    state: Mutex<State<P>>,
    metrics: Option<Arc<Metrics>>,
}

impl<P> Debug for AsyncRwLock<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AsyncRwLock")
            .field("readers", &state.readers)
            .field("writer", &state.writer)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl<P> Default for AsyncRwLock<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> AsyncRwLock<P> {
    /// Create an unlocked lock with an empty waiter queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                readers: 0,
                writer: false,
                waiters: VecDeque::new(),
            }),
            metrics: None,
        }
    }

    /// Attach metrics to the lock.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Create a waiter for this lock.
    pub fn new_waiter<F>(&self, payload: P, completion: F) -> Waiter<P>
    where
        F: FnOnce(P, Result<()>) + Send + 'static,
    {
        Waiter::new(payload, completion)
    }

    /// Acquire the lock exclusively.
    ///
    /// If the lock is free the completion runs before this call returns, otherwise the waiter is queued and
    /// completed from the release that makes it eligible.
    pub fn acquire_write(&self, mut waiter: Waiter<P>) {
        let mut state = self.state.lock();
        if state.readers == 0 && !state.writer {
            state.writer = true;
            drop(state);
            self.on_granted();
            waiter.complete(Ok(()));
            return;
        }
        waiter.write_lock = true;
        state.waiters.push_back(waiter);
        drop(state);
        self.on_queued();
    }

    /// Acquire the lock exclusively without queuing.
    pub fn try_acquire_write(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.readers == 0 && !state.writer {
            state.writer = true;
            return Ok(());
        }
        Err(Error::no_lock())
    }

    /// Release the exclusive lock and grant the waiters that became eligible.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held exclusively.
    pub fn release_write(&self) {
        let mut state = self.state.lock();
        assert_eq!(state.readers, 0, "release_write with active readers");
        assert!(state.writer, "release_write without a writer");
        state.writer = false;
        let ready = state.collect();
        drop(state);
        self.grant(ready);
    }

    /// Acquire the lock shared.
    ///
    /// Granted immediately only if there is no writer and nobody is queued, so a queued writer is never overtaken.
    pub fn acquire_read(&self, mut waiter: Waiter<P>) {
        let mut state = self.state.lock();
        if !state.writer && state.waiters.is_empty() {
            state.readers += 1;
            drop(state);
            self.on_granted();
            waiter.complete(Ok(()));
            return;
        }
        waiter.write_lock = false;
        state.waiters.push_back(waiter);
        drop(state);
        self.on_queued();
    }

    /// Acquire the lock shared without queuing.
    pub fn try_acquire_read(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.writer && state.waiters.is_empty() {
            state.readers += 1;
            return Ok(());
        }
        Err(Error::no_lock())
    }

    /// Release a shared hold. The last reader out grants the waiters that became eligible.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held shared.
    pub fn release_read(&self) {
        let mut state = self.state.lock();
        assert!(state.readers > 0, "release_read without readers");
        assert!(!state.writer, "release_read while a writer holds the lock");
        state.readers -= 1;
        if state.readers > 0 {
            return;
        }
        let ready = state.collect();
        drop(state);
        self.grant(ready);
    }

    /// Returns true if the lock is held in any mode.
    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.readers > 0 || state.writer
    }

    /// Number of queued waiters.
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Complete every queued waiter with [`ErrorKind::NoLock`](crate::error::ErrorKind::NoLock).
    ///
    /// Called on teardown, and from `Drop`.
    pub fn deinit(&self) {
        let drained = std::mem::take(&mut self.state.lock().waiters);
        if drained.is_empty() {
            return;
        }
        tracing::debug!("[async lock]: drain {} queued waiters", drained.len());
        if let Some(metrics) = &self.metrics {
            metrics.lock_drained.increase(drained.len() as u64);
        }
        for waiter in drained {
            waiter.complete(Err(Error::no_lock()));
        }
    }

    fn grant(&self, ready: Vec<Waiter<P>>) {
        if let Some(metrics) = &self.metrics {
            metrics.lock_granted.increase(ready.len() as u64);
        }
        for waiter in ready {
            waiter.complete(Ok(()));
        }
    }

    fn on_granted(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.lock_granted.increase(1);
        }
    }

    fn on_queued(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.lock_queued.increase(1);
        }
    }
}

impl<P> Drop for AsyncRwLock<P> {
    fn drop(&mut self) {
        self.deinit();
    }
}

impl<P> AsyncRwLock<P>
where
    P: Default + Send + 'static,
{
    /// Acquire the lock shared and wait for the grant.
    ///
    /// If the returned future is dropped after the waiter has been queued, the grant is released as soon as it
    /// arrives.
    pub async fn read(self: &Arc<Self>) -> Result<AsyncRwLockReadGuard<P>> {
        let (tx, rx) = oneshot::channel();
        let lock = self.clone();
        self.acquire_read(Waiter::new(P::default(), move |_, res: Result<()>| {
            let granted = res.is_ok();
            if tx.send(res).is_err() && granted {
                lock.release_read();
            }
        }));
        match rx.await {
            Ok(Ok(())) => Ok(AsyncRwLockReadGuard { lock: self.clone() }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::no_lock()),
        }
    }

    /// Acquire the lock exclusively and wait for the grant.
    ///
    /// If the returned future is dropped after the waiter has been queued, the grant is released as soon as it
    /// arrives.
    pub async fn write(self: &Arc<Self>) -> Result<AsyncRwLockWriteGuard<P>> {
        let (tx, rx) = oneshot::channel();
        let lock = self.clone();
        self.acquire_write(Waiter::new(P::default(), move |_, res: Result<()>| {
            let granted = res.is_ok();
            if tx.send(res).is_err() && granted {
                lock.release_write();
            }
        }));
        match rx.await {
            Ok(Ok(())) => Ok(AsyncRwLockWriteGuard { lock: self.clone() }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::no_lock()),
        }
    }
}

/// Shared hold on an [`AsyncRwLock`], released on drop.
#[derive(Debug)]
pub struct AsyncRwLockReadGuard<P = ()> {
    lock: Arc<AsyncRwLock<P>>,
}

impl<P> Drop for AsyncRwLockReadGuard<P> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Exclusive hold on an [`AsyncRwLock`], released on drop.
#[derive(Debug)]
pub struct AsyncRwLockWriteGuard<P = ()> {
    lock: Arc<AsyncRwLock<P>>,
}

impl<P> Drop for AsyncRwLockWriteGuard<P> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use rand::{rngs::SmallRng, Rng, SeedableRng};

    use super::*;
    use crate::error::ErrorKind;

    type Log = Arc<Mutex<Vec<(&'static str, bool)>>>;

    fn waiter(log: &Log, name: &'static str) -> Waiter<()> {
        let log = log.clone();
        Waiter::new((), move |_, res| log.lock().push((name, res.is_ok())))
    }

    #[test]
    fn test_write_then_try_read() {
        let lock = AsyncRwLock::<()>::new();
        let log = Log::default();

        lock.acquire_write(waiter(&log, "a"));
        assert_eq!(*log.lock(), vec![("a", true)]);
        assert!(lock.is_locked());

        assert_eq!(lock.try_acquire_read().unwrap_err().kind(), ErrorKind::NoLock);
        assert_eq!(lock.try_acquire_write().unwrap_err().kind(), ErrorKind::NoLock);

        lock.release_write();
        assert!(!lock.is_locked());

        lock.try_acquire_read().unwrap();
        assert!(lock.is_locked());
        lock.release_read();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_reader_runs_and_writer_order() {
        let lock = AsyncRwLock::<()>::new();
        let log = Log::default();

        lock.acquire_write(waiter(&log, "w0"));
        lock.acquire_read(waiter(&log, "r1"));
        lock.acquire_read(waiter(&log, "r2"));
        lock.acquire_write(waiter(&log, "w1"));
        lock.acquire_read(waiter(&log, "r3"));
        assert_eq!(lock.waiters(), 4);

        // The reader run ahead of w1 is granted together.
        lock.release_write();
        assert_eq!(*log.lock(), vec![("w0", true), ("r1", true), ("r2", true)]);

        // w1 waits for every reader granted ahead of it.
        lock.release_read();
        assert_eq!(log.lock().len(), 3);
        lock.release_read();
        assert_eq!(log.lock().last(), Some(&("w1", true)));

        // r3 was queued behind w1.
        lock.release_write();
        assert_eq!(log.lock().last(), Some(&("r3", true)));
        lock.release_read();
        assert!(!lock.is_locked());
        assert_eq!(lock.waiters(), 0);
    }

    #[test]
    fn test_reader_does_not_overtake_queued_writer() {
        let lock = AsyncRwLock::<()>::new();
        let log = Log::default();

        lock.acquire_read(waiter(&log, "r0"));
        lock.acquire_write(waiter(&log, "w0"));
        assert_eq!(lock.try_acquire_read().unwrap_err().kind(), ErrorKind::NoLock);
        lock.acquire_read(waiter(&log, "r1"));

        lock.release_read();
        assert_eq!(*log.lock(), vec![("r0", true), ("w0", true)]);
        lock.release_write();
        assert_eq!(log.lock().last(), Some(&("r1", true)));
        lock.release_read();
    }

    #[test]
    fn test_deinit_drains_with_no_lock() {
        let lock = AsyncRwLock::<u32>::new();
        let seen = Arc::new(Mutex::new(vec![]));

        lock.try_acquire_write().unwrap();
        for i in 0..3 {
            let seen = seen.clone();
            lock.acquire_read(Waiter::new(i, move |payload, res: Result<()>| {
                seen.lock().push((payload, res.map_err(|e| e.kind())))
            }));
        }
        lock.deinit();

        assert_eq!(
            *seen.lock(),
            vec![
                (0, Err(ErrorKind::NoLock)),
                (1, Err(ErrorKind::NoLock)),
                (2, Err(ErrorKind::NoLock))
            ]
        );
        assert_eq!(lock.waiters(), 0);
        lock.release_write();
    }

    #[test]
    #[should_panic]
    fn test_release_write_unheld() {
        let lock = AsyncRwLock::<()>::new();
        lock.release_write();
    }

    #[test]
    #[should_panic]
    fn test_release_read_unheld() {
        let lock = AsyncRwLock::<()>::new();
        lock.try_acquire_write().unwrap();
        lock.release_read();
    }

    /// Random acquire/release sequences never grant a writer together with anything else, and never grant more
    /// readers than there are outstanding read acquisitions.
    #[test]
    fn test_random_mutual_exclusion() {
        #[derive(Debug, Default)]
        struct Held {
            readers: usize,
            writers: usize,
            pending_reads: usize,
        }

        let mut rng = SmallRng::seed_from_u64(114514);
        let lock = AsyncRwLock::<bool>::new();
        let held = Arc::new(Mutex::new(Held::default()));

        for _ in 0..10_000 {
            let (readers, writers) = {
                let h = held.lock();
                (h.readers, h.writers)
            };
            match rng.random_range(0..4) {
                0 => {
                    held.lock().pending_reads += 1;
                    let held = held.clone();
                    lock.acquire_read(Waiter::new(false, move |_, res: Result<()>| {
                        res.unwrap();
                        let mut h = held.lock();
                        h.readers += 1;
                        assert_eq!(h.writers, 0);
                        assert!(h.readers <= h.pending_reads);
                    }));
                }
                1 => {
                    let held = held.clone();
                    lock.acquire_write(Waiter::new(true, move |_, res: Result<()>| {
                        res.unwrap();
                        let mut h = held.lock();
                        h.writers += 1;
                        assert_eq!(h.writers, 1);
                        assert_eq!(h.readers, 0);
                    }));
                }
                _ if writers > 0 => {
                    held.lock().writers -= 1;
                    lock.release_write();
                }
                _ if readers > 0 => {
                    {
                        let mut h = held.lock();
                        h.readers -= 1;
                        h.pending_reads -= 1;
                    }
                    lock.release_read();
                }
                _ => {}
            }
            let h = held.lock();
            assert_eq!(lock.is_locked(), h.readers > 0 || h.writers > 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_async_guards() {
        let lock = Arc::new(AsyncRwLock::<()>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let counter = Arc::new(AtomicUsize::new(0));

        let handles = (0..64)
            .map(|i| {
                let lock = lock.clone();
                let inside = inside.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    if i % 4 == 0 {
                        let _guard = lock.write().await.unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    } else {
                        let _guard = lock.read().await.unwrap();
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 16);
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_dropped_future_releases_grant() {
        let lock = Arc::new(AsyncRwLock::<()>::new());
        let guard = lock.write().await.unwrap();

        let res = tokio::time::timeout(Duration::from_millis(10), lock.write()).await;
        assert!(res.is_err());
        assert_eq!(lock.waiters(), 1);

        drop(guard);
        assert!(!lock.is_locked());
        assert_eq!(lock.waiters(), 0);
    }
}
