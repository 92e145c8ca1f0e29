//! scheduled.rs
//! Delayed, cancellable one-shot work on the tokio runtime.
//!
//! Used for policy TTL expiry. Dropping or cancelling the handle aborts the
//! pending timer; once the delay has elapsed the callback runs synchronously
//! to completion, so a callback that replaces its own handle is not cut short.

use std::time::Duration;

use log::warn;
use tokio::{runtime::Handle, task::JoinHandle};

pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Runs `f` after `delay`. Returns `None` outside a tokio runtime.
    pub fn after<F>(delay: Duration, f: F) -> Option<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let Ok(rt) = Handle::try_current() else {
            warn!("[ScheduledTask] no tokio runtime; timer of {:?} not armed", delay);
            return None;
        };
        let handle = rt.spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        Some(Self { handle })
    }

    pub fn cancel(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
