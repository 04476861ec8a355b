//! Update notification slot
//!
//! One callback is registered at a time; registering either variant
//! replaces whatever was there. The callback runs on the scheduler thread
//! after each completed refresh cycle.

use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::error;

/// The registered callback
#[derive(Clone)]
pub enum UpdateCallback {
    Plain(Arc<dyn Fn() + Send + Sync>),
    /// Receives the aggregated expired flag
    WithExpiry(Arc<dyn Fn(bool) + Send + Sync>),
}

impl UpdateCallback {
    fn invoke(&self, expired: bool) {
        match self {
            Self::Plain(f) => f(),
            Self::WithExpiry(f) => f(expired),
        }
    }
}

#[derive(Default)]
pub struct CallbackSlot {
    slot: Mutex<Option<UpdateCallback>>,
}

impl CallbackSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, callback: UpdateCallback) {
        *self.slot.lock() = Some(callback);
    }

    pub fn clear(&self) {
        self.slot.lock().take();
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Run the registered callback, outside the slot lock
    ///
    /// A panicking callback is logged and does not take the scheduler down.
    pub fn notify(&self, expired: bool) {
        let Some(callback) = self.slot.lock().clone() else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| callback.invoke(expired))).is_err() {
            error!("Update callback panicked");
        }
    }
}
