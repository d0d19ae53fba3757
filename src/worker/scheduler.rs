//! Periodic background tasks owned as a unit

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// Periodic tasks that are cancelled together. Dropping the set aborts
/// every task.
#[derive(Default)]
pub struct ScheduledTasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl ScheduledTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` every `period`, starting immediately. A tick that overruns
    /// delays the next one rather than bursting.
    pub fn every<F, Fut>(&mut self, name: &'static str, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task().await;
            }
        });
        debug!("Scheduled {} every {:?}", name, period);
        self.handles.push((name, handle));
    }

    /// Abort every task, including one mid-tick
    pub fn cancel_all(&mut self) {
        for (name, handle) in self.handles.drain(..) {
            handle.abort();
            debug!("Cancelled {}", name);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for ScheduledTasks {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
