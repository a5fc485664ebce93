//! Network reachability monitor.
//!
//! Turns the platform connectivity signal into online/offline transitions
//! delivered to an observer. Repeated reports of the same state are not
//! transitions and are dropped.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use profilesync_storage::ReachabilitySignal;

/// Receives connectivity transitions.
#[async_trait]
pub trait ConnectivityObserver: Send + Sync {
    /// Called once per transition.
    async fn connectivity_changed(&self, online: bool);
}

/// Watches a [`ReachabilitySignal`] on a background task.
pub struct ReachabilityMonitor {
    signal: Arc<dyn ReachabilitySignal>,
    task: Mutex<Option<CancellationToken>>,
}

impl ReachabilityMonitor {
    /// Create a stopped monitor.
    pub fn new(signal: Arc<dyn ReachabilitySignal>) -> Self {
        Self {
            signal,
            task: Mutex::new(None),
        }
    }

    /// Current connectivity according to the platform.
    pub fn is_online(&self) -> bool {
        self.signal.current()
    }

    /// Start forwarding transitions to `observer`. Restarts the task if one
    /// is already running.
    pub fn start(&self, observer: Weak<dyn ConnectivityObserver>) {
        let cancel = CancellationToken::new();
        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(cancel.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let mut rx = self.signal.subscribe();
        let mut last = *rx.borrow_and_update();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            debug!("Reachability signal closed");
                            break;
                        }
                    }
                }

                // The watch keeps only the latest value, so an offline blip can
                // arrive as online == last. Online is always forwarded.
                let online = *rx.borrow_and_update();
                if online == last {
                    if !online {
                        continue;
                    }
                    debug!("Connectivity flapped; still online");
                } else {
                    last = online;
                    info!("Connectivity changed: {}", if online { "online" } else { "offline" });
                }

                let Some(observer) = observer.upgrade() else {
                    break;
                };
                observer.connectivity_changed(online).await;
            }
        });
    }

    /// Stop forwarding transitions.
    pub fn stop(&self) {
        if let Some(cancel) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }
    }

    /// Whether the background task is running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|c| !c.is_cancelled())
            .unwrap_or(false)
    }
}

impl Drop for ReachabilityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
