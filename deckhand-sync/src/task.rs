//! Handles for background loops.

use std::future::Future;
use std::sync::Arc;

use deckhand_core::{DeckhandError, DeckhandResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Owner of a spawned background loop (poller, scheduler).
///
/// The loop receives a shutdown watch and must exit once it reads `true`.
/// Dropping the handle signals shutdown without waiting; work the loop has
/// already detached (an in-flight sync) keeps running to completion.
#[derive(Debug)]
pub struct TaskHandle<M> {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    metrics: Arc<M>,
}

impl<M> TaskHandle<M> {
    pub(crate) fn spawn<F, Fut>(name: &'static str, metrics: Arc<M>, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(body(shutdown_rx));
        Self {
            name,
            shutdown_tx,
            join: Some(join),
            metrics,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn metrics(&self) -> &Arc<M> {
        &self.metrics
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn shutdown(mut self) -> DeckhandResult<Arc<M>> {
        self.shutdown_tx.send_replace(true);
        if let Some(join) = self.join.take() {
            join.await
                .map_err(|e| DeckhandError::Task(format!("{} task: {}", self.name, e)))?;
        }
        Ok(Arc::clone(&self.metrics))
    }
}

impl<M> Drop for TaskHandle<M> {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// True once the shutdown watch says so or its sender is gone.
pub(crate) fn shutdown_requested(
    changed: Result<(), watch::error::RecvError>,
    rx: &watch::Receiver<bool>,
) -> bool {
    changed.is_err() || *rx.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let ticks = Arc::new(AtomicU64::new(0));
        let handle = TaskHandle::spawn("counter", ticks.clone(), {
            let ticks = ticks.clone();
            move |mut shutdown| async move {
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if shutdown_requested(changed, &shutdown) {
                                break;
                            }
                        }
                        _ = tokio::task::yield_now() => {
                            ticks.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        });

        tokio::task::yield_now().await;
        let metrics = handle.shutdown().await.unwrap();
        assert!(metrics.load(Ordering::Relaxed) >= 1);
    }

    #[tokio::test]
    async fn test_drop_signals_shutdown() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let handle = TaskHandle::spawn("waiter", Arc::new(()), move |mut shutdown| async move {
            let changed = shutdown.changed().await;
            assert!(shutdown_requested(changed, &shutdown));
            let _ = done_tx.send(());
        });
        assert_eq!(handle.name(), "waiter");
        drop(handle);
        done_rx.await.unwrap();
    }
}
