//! Network reachability signal.

use tokio::sync::watch;

/// The platform's connectivity signal.
///
/// `subscribe` hands out a watch receiver; dropping it unsubscribes.
pub trait ReachabilitySignal: Send + Sync {
    /// Whether the device is currently online.
    fn current(&self) -> bool;

    /// Receive online/offline transitions.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Reachability signal driven by hand.
///
/// Platform glue forwards OS connectivity events into `set_online`; tests
/// use it to flip the device between online and offline.
pub struct ManualReachability {
    tx: watch::Sender<bool>,
}

impl ManualReachability {
    /// Create a signal with the given initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    /// Report the current connectivity. Repeating the same state does not
    /// wake subscribers.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }
}

impl ReachabilitySignal for ManualReachability {
    fn current(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
