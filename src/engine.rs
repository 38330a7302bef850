//! Top-level polling orchestration.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::handler::{Descriptors, Handler};
use crate::meters::DeviceDescriptor;
use crate::snip::{ControlSnip, QuerySnip};

/// Default minimum interval between two passes of a handler.
pub const DEFAULT_RATE: Duration = Duration::from_secs(1);

/// Runs every [`Handler`] in its own task.
///
/// Each handler polls its connection independently, so a slow bus never
/// delays another. Passes of one handler start at most once per `rate`.
pub struct QueryEngine {
    handlers: Vec<Handler>,
    descriptors: Vec<Descriptors>,
    rate: Duration,
}

impl QueryEngine {
    /// Creates an engine over the given handlers.
    #[must_use]
    pub fn new(handlers: Vec<Handler>) -> Self {
        let descriptors = handlers.iter().map(Handler::descriptors).collect();
        Self {
            handlers,
            descriptors,
            rate: DEFAULT_RATE,
        }
    }

    /// Sets the minimum interval between passes.
    #[must_use]
    pub const fn rate(mut self, rate: Duration) -> Self {
        self.rate = rate;
        self
    }

    /// Returns the number of handlers not yet started.
    #[must_use]
    pub fn handlers(&self) -> usize {
        self.handlers.len()
    }

    /// Looks up the descriptor of an initialized device.
    #[must_use]
    pub fn descriptor(&self, device: &str) -> Option<DeviceDescriptor> {
        self.descriptors.iter().find_map(|descriptors| {
            descriptors
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(device)
                .cloned()
        })
    }

    /// Polls until `cancel` fires.
    ///
    /// Returns once every handler task has stopped. Both senders are dropped
    /// on return, closing the inputs of whatever consumes them.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
        control: mpsc::Sender<ControlSnip>,
        results: mpsc::Sender<QuerySnip>,
    ) {
        let tracker = TaskTracker::new();

        for mut handler in self.handlers.drain(..) {
            let cancel = cancel.clone();
            let control = control.clone();
            let results = results.clone();
            let rate = self.rate;

            tracker.spawn(async move {
                let mut interval = tokio::time::interval(rate);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = interval.tick() => {}
                    }
                    handler.run(&cancel, &control, &results).await;
                }
                tracing::debug!("handler {} stopped", handler.id());
            });
        }

        tracker.close();
        tracker.wait().await;
        tracing::info!("query engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::broadcast::Broadcaster;
    use crate::connection::{MockClient, MockConnection};
    use crate::manager::Manager;
    use crate::meters::Rs485Device;
    use crate::meters::rs485::tests::TestProducer;

    fn mock_handler(id: usize) -> Handler {
        let client = MockClient::new().response_time(Duration::from_millis(10));
        let mut manager = Manager::new(Box::new(MockConnection::with_client(client)));
        manager
            .add(1, 0, Rs485Device::new(Box::new(TestProducer::default())))
            .unwrap();
        Handler::new(id, manager)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_passes() {
        let mut engine = QueryEngine::new(vec![mock_handler(1)]).rate(Duration::from_secs(1));
        let (control_tx, mut control_rx) = mpsc::channel(100);
        let (results_tx, mut results_rx) = mpsc::channel(100);
        let cancel = CancellationToken::new();

        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                engine.run(cancel, control_tx, results_tx).await;
                engine
            })
        };

        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        let engine = run.await.unwrap();

        // Passes at 0s, 1s, 2s and 3s
        let mut results = 0;
        while results_rx.recv().await.is_some() {
            results += 1;
        }
        assert_eq!(results, 4 * 3);

        let mut ok = 0;
        while let Some(snip) = control_rx.recv().await {
            if snip.message == "ok" {
                ok += 1;
            }
        }
        assert_eq!(ok, 4);

        assert_eq!(engine.handlers(), 0);
        assert_eq!(engine.descriptor("TEST1.1").unwrap().serial, "0042");
        assert!(engine.descriptor("TEST1.2").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cascades_to_broadcasters() {
        let mut engine = QueryEngine::new(vec![mock_handler(1), mock_handler(2)]);
        let (control_tx, control_rx) = mpsc::channel(1);
        let (results_tx, results_rx) = mpsc::channel(1);

        let control = Arc::new(Broadcaster::new(control_rx));
        let results = Arc::new(Broadcaster::new(results_rx));

        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = Arc::clone(&seen);
            results
                .attach_runner(|mut rx| async move {
                    while rx.recv().await.is_some() {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await
                .unwrap();
        }
        control
            .attach_runner(|mut rx| async move { while rx.recv().await.is_some() {} })
            .await
            .unwrap();

        let control_run = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.run().await })
        };
        let results_run = {
            let results = Arc::clone(&results);
            tokio::spawn(async move { results.run().await })
        };

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            canceller.cancel();
        });

        engine.run(cancel, control_tx, results_tx).await;
        control.done().await;
        results.done().await;
        control_run.await.unwrap();
        results_run.await.unwrap();

        // Two handlers, two passes each, three values per pass
        assert_eq!(seen.load(Ordering::SeqCst), 12);
    }
}
