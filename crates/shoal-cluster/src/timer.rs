//! Scoped timers
//!
//! Every scheduled event is held through a `TimerHandle`; dropping the
//! handle cancels the timer.  Replicas and nodes own their handles, so
//! destroying either frees its pending events on every exit path.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::controller::Event;

#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Deliver `event` to the controller after `delay`.  A zero delay
    /// defers to the next event-loop turn without a real deadline.
    pub fn spawn(events: mpsc::UnboundedSender<Event>, delay: Duration, event: Event) -> Self {
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = events.send(event);
        });
        Self { task }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
