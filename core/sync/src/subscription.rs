//! Idempotent unsubscribe handles.

use std::fmt;
use std::sync::{Arc, Mutex};

type Teardown = Box<dyn FnOnce() + Send>;

/// Handle returned by every subscribe-style call.
///
/// `unsubscribe` tears the resource down the first time it is called and
/// does nothing afterwards. Dropping the handle leaves the subscription
/// running; clones share the same underlying subscription.
#[derive(Clone)]
pub struct Subscription {
    teardown: Arc<Mutex<Option<Teardown>>>,
}

impl Subscription {
    pub(crate) fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            teardown: Arc::new(Mutex::new(Some(Box::new(teardown)))),
        }
    }

    /// Tear down the subscription. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        let teardown = match self.teardown.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    /// Whether `unsubscribe` has not been called yet.
    pub fn is_active(&self) -> bool {
        match self.teardown.lock() {
            Ok(slot) => slot.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
