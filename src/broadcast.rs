//! Single-producer, many-consumer fan-out.
//!
//! A [`Broadcaster`] pulls messages from one input channel and delivers each
//! one to every attached output channel. Delivery waits for slow consumers
//! instead of dropping messages, so a consumer that stops reading must drop
//! its receiver to get detached.
//!
//! Shutdown is driven by the input: once every input sender is dropped and
//! the input is drained, all outputs are closed, every runner task is
//! awaited, and only then does [`Broadcaster::done`] complete.

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};

/// Output channel capacity. One slot keeps consumers in lock step with
/// the producer.
pub const OUTPUT_CAPACITY: usize = 1;

struct Recipients<T> {
    senders: Vec<mpsc::Sender<T>>,
    stopped: bool,
}

/// Fan-out hub over messages of type `T`.
pub struct Broadcaster<T> {
    input: Mutex<Option<mpsc::Receiver<T>>>,
    recipients: AsyncMutex<Recipients<T>>,
    runners: TaskTracker,
    done: watch::Sender<bool>,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    /// Creates a broadcaster reading from `input`.
    #[must_use]
    pub fn new(input: mpsc::Receiver<T>) -> Self {
        Self {
            input: Mutex::new(Some(input)),
            recipients: AsyncMutex::new(Recipients {
                senders: Vec::new(),
                stopped: false,
            }),
            runners: TaskTracker::new(),
            done: watch::Sender::new(false),
        }
    }

    /// Registers a new output channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BroadcasterStopped`] once the input has closed.
    pub async fn attach(&self) -> Result<mpsc::Receiver<T>> {
        let mut recipients = self.recipients.lock().await;
        Self::register(&mut recipients)
    }

    /// Attaches a new output channel and spawns `runner` on it.
    ///
    /// The runner is awaited before [`done`](Self::done) completes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BroadcasterStopped`] once the input has closed.
    pub async fn attach_runner<F, Fut>(&self, runner: F) -> Result<()>
    where
        F: FnOnce(mpsc::Receiver<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // Spawn under the lock so shutdown cannot miss the task
        let mut recipients = self.recipients.lock().await;
        let rx = Self::register(&mut recipients)?;
        self.runners.spawn(runner(rx));
        Ok(())
    }

    fn register(recipients: &mut Recipients<T>) -> Result<mpsc::Receiver<T>> {
        if recipients.stopped {
            return Err(Error::BroadcasterStopped);
        }
        let (tx, rx) = mpsc::channel(OUTPUT_CAPACITY);
        recipients.senders.push(tx);
        Ok(rx)
    }

    /// Returns the number of attached outputs.
    pub async fn recipients(&self) -> usize {
        self.recipients.lock().await.senders.len()
    }

    /// Distributes input messages until the input closes, then shuts down.
    ///
    /// Only the first call does anything; later calls return immediately.
    pub async fn run(&self) {
        let input = self
            .input
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut input) = input else {
            tracing::warn!("broadcaster is already running");
            return;
        };

        while let Some(message) = input.recv().await {
            let mut recipients = self.recipients.lock().await;
            let mut alive = Vec::with_capacity(recipients.senders.len());
            for tx in recipients.senders.drain(..) {
                if tx.send(message.clone()).await.is_ok() {
                    alive.push(tx);
                } else {
                    tracing::debug!("detaching closed recipient");
                }
            }
            recipients.senders = alive;
        }

        {
            let mut recipients = self.recipients.lock().await;
            recipients.stopped = true;
            recipients.senders.clear();
        }

        self.runners.close();
        self.runners.wait().await;
        tracing::debug!("broadcaster stopped");
        self.done.send_replace(true);
    }

    /// Completes once the input has closed and every runner has finished.
    pub async fn done(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives in self, so this cannot fail while borrowed
        let _ = rx.wait_for(|&done| done).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn spawn_run(broadcaster: &Arc<Broadcaster<u32>>) -> tokio::task::JoinHandle<()> {
        let broadcaster = Arc::clone(broadcaster);
        tokio::spawn(async move { broadcaster.run().await })
    }

    #[tokio::test]
    async fn test_every_consumer_sees_every_message() {
        let (tx, rx) = mpsc::channel(16);
        let broadcaster = Arc::new(Broadcaster::new(rx));

        let seen: Vec<Arc<Mutex<Vec<u32>>>> = (0..3).map(|_| Arc::default()).collect();
        for sink in &seen {
            let sink = Arc::clone(sink);
            broadcaster
                .attach_runner(|mut rx| async move {
                    while let Some(n) = rx.recv().await {
                        sink.lock().unwrap().push(n);
                    }
                })
                .await
                .unwrap();
        }

        let run = spawn_run(&broadcaster);
        for n in 0..100 {
            tx.send(n).await.unwrap();
        }
        drop(tx);

        broadcaster.done().await;
        run.await.unwrap();

        let expected: Vec<u32> = (0..100).collect();
        for sink in &seen {
            assert_eq!(*sink.lock().unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_done_waits_for_runners() {
        let (tx, rx) = mpsc::channel(1);
        let broadcaster = Arc::new(Broadcaster::new(rx));
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let finished = Arc::clone(&finished);
            broadcaster
                .attach_runner(|mut rx| async move {
                    while rx.recv().await.is_some() {}
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }

        let run = spawn_run(&broadcaster);
        tx.send(1).await.unwrap();
        drop(tx);

        broadcaster.done().await;
        assert_eq!(finished.load(Ordering::SeqCst), 10);
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_after_stop_fails() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        let broadcaster = Broadcaster::new(rx);
        drop(tx);

        broadcaster.run().await;
        broadcaster.done().await;

        assert!(matches!(
            broadcaster.attach().await,
            Err(Error::BroadcasterStopped)
        ));
        assert!(broadcaster.attach_runner(|_rx| async {}).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_detached() {
        let (tx, rx) = mpsc::channel(1);
        let broadcaster = Arc::new(Broadcaster::new(rx));

        for _ in 0..50 {
            drop(broadcaster.attach().await.unwrap());
        }
        let mut live = broadcaster.attach().await.unwrap();
        assert_eq!(broadcaster.recipients().await, 51);

        let run = spawn_run(&broadcaster);
        tx.send(7).await.unwrap();
        assert_eq!(live.recv().await, Some(7));
        assert_eq!(broadcaster.recipients().await, 1);

        drop(tx);
        assert_eq!(live.recv().await, None);
        broadcaster.done().await;
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_outputs_closed_after_drain() {
        let (tx, rx) = mpsc::channel(4);
        let broadcaster = Arc::new(Broadcaster::new(rx));
        let mut out = broadcaster.attach().await.unwrap();

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        drop(tx);

        let run = spawn_run(&broadcaster);
        assert_eq!(out.recv().await, Some(1));
        assert_eq!(out.recv().await, Some(2));
        assert_eq!(out.recv().await, None);
        broadcaster.done().await;
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_second_run_returns() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        let broadcaster = Broadcaster::new(rx);
        drop(tx);

        broadcaster.run().await;
        tokio::time::timeout(Duration::from_secs(1), broadcaster.run())
            .await
            .unwrap();
    }
}
