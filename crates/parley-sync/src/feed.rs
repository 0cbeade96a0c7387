//! Supervised live feeds.
//!
//! A [`FeedHandle`] owns one background task that keeps a live feed open:
//! it subscribes, applies every snapshot, and on a transport failure waits
//! out the retry policy's backoff before subscribing again from scratch.
//! There is no resumption token; each reconnect starts a brand-new
//! subscription whose first snapshot is complete.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use backoff::backoff::Backoff;
use futures_util::StreamExt;
use parley_backend::{BackendError, FeedStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{ConnectionState, FeedBackoff, RetryPolicy, SyncError, classify};

/// Observable status of a supervised feed.
#[derive(Debug, Clone, Default)]
pub struct FeedStatus {
    /// Subscribing or waiting to re-subscribe.
    pub loading: bool,
    /// Set when the feed stopped for good.
    pub error: Option<Arc<SyncError>>,
    /// At least one snapshot has been applied.
    pub has_data: bool,
    /// Reconnect attempts since the last snapshot.
    pub attempt: u32,
}

impl FeedStatus {
    pub fn connection(&self) -> ConnectionState {
        classify(self.loading, self.error.as_ref(), self.has_data)
    }
}

/// Handle to a running feed task. Closing (or dropping) the handle stops the
/// task and releases the subscription.
pub struct FeedHandle {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<FeedStatus>,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FeedHandle {
    /// Spawn a feed task.
    ///
    /// `open` starts a fresh subscription; `apply` receives every snapshot in
    /// order. Must be called from within a tokio runtime.
    pub fn spawn<T, O, Fut, A>(name: impl Into<String>, policy: RetryPolicy, open: O, apply: A) -> Self
    where
        T: Send + 'static,
        O: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FeedStream<T>, BackendError>> + Send + 'static,
        A: Fn(T) + Send + Sync + 'static,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(FeedStatus {
            loading: true,
            ..Default::default()
        });

        let task = tokio::spawn(supervise(
            name.clone(),
            policy.backoff(),
            open,
            apply,
            status_tx,
            shutdown_rx,
        ));

        Self {
            name,
            shutdown_tx,
            status_rx,
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status snapshot.
    pub fn status(&self) -> FeedStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver that is notified on every status change.
    pub fn watch(&self) -> watch::Receiver<FeedStatus> {
        self.status_rx.clone()
    }

    /// Signal the task to stop. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.shutdown_tx.send(true);
        info!(feed = %self.name, "live feed closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close and wait for the task to finish.
    pub async fn shutdown(&self) {
        self.close();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(feed = %self.name, error = %e, "live feed task failed");
        }
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.close();
    }
}

async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn supervise<T, O, Fut, A>(
    name: String,
    mut backoff: FeedBackoff,
    open: O,
    apply: A,
    status_tx: watch::Sender<FeedStatus>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    O: Fn() -> Fut,
    Fut: Future<Output = Result<FeedStream<T>, BackendError>>,
    A: Fn(T),
{
    loop {
        status_tx.send_modify(|s| s.loading = true);

        let failure = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
            failure = run_once(&name, &open, &apply, &status_tx, &mut backoff) => failure,
        };

        if failure.is_retryable()
            && let Some(delay) = backoff.next_backoff()
        {
            let attempt = backoff.attempt();
            warn!(
                feed = %name,
                error = %failure,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "live feed lost, reconnecting"
            );
            status_tx.send_modify(|s| {
                s.loading = true;
                s.attempt = attempt;
            });

            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
                _ = tokio::time::sleep(delay) => {}
            }
            continue;
        }

        error!(feed = %name, error = %failure, "live feed stopped");
        status_tx.send_modify(|s| {
            s.loading = false;
            s.error = Some(Arc::new(SyncError::from(failure)));
        });
        return;
    }

    status_tx.send_modify(|s| s.loading = false);
    debug!(feed = %name, "live feed task exiting");
}

/// Subscribe once and apply snapshots until the feed fails or ends. Returns
/// the reason it stopped.
async fn run_once<T, O, Fut, A>(
    name: &str,
    open: &O,
    apply: &A,
    status_tx: &watch::Sender<FeedStatus>,
    backoff: &mut FeedBackoff,
) -> BackendError
where
    O: Fn() -> Fut,
    Fut: Future<Output = Result<FeedStream<T>, BackendError>>,
    A: Fn(T),
{
    let mut stream = match open().await {
        Ok(stream) => stream,
        Err(e) => return e,
    };
    info!(feed = %name, "live feed subscribed");

    while let Some(item) = stream.next().await {
        match item {
            Ok(snapshot) => {
                backoff.reset();
                apply(snapshot);
                status_tx.send_modify(|s| {
                    s.loading = false;
                    s.has_data = true;
                    s.error = None;
                    s.attempt = 0;
                });
            }
            Err(e) => return e,
        }
    }

    BackendError::Transport("live feed ended".to_string())
}
