use std::future::Future;
use std::time::Duration;

use log::warn;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// A local task that is aborted when its guard is dropped.
///
/// Must be created inside a `LocalSet`.
pub struct BackgroundTask {
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + 'static,
    {
        Self {
            handle: tokio::task::spawn_local(future),
        }
    }

    /// Runs `action` once after `delay`, unless cancelled first.
    pub fn delayed<F>(delay: Duration, action: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        Self::spawn(async move {
            tokio::time::sleep(delay).await;
            action();
        })
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Identity of the one repeating timer armed by a [`PollScheduler`].
pub struct PollHandle {
    task: BackgroundTask,
    interval: Duration,
}

/// Owns at most one repeating timer.
#[derive(Default)]
pub struct PollScheduler {
    handle: Option<PollHandle>,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Fires `tick` now, then once per `interval` until [`stop`](Self::stop).
    ///
    /// Ticks are interval-paced: `tick` must hand slow work off rather than block.
    pub fn start<F>(&mut self, interval: Duration, mut tick: F)
    where
        F: FnMut() + 'static,
    {
        if let Some(previous) = self.handle.take() {
            warn!(
                "Polling scheduler started while armed; replacing the {}ms timer",
                previous.interval.as_millis()
            );
        }

        tick();

        let task = BackgroundTask::spawn(async move {
            let mut timer = tokio::time::interval_at(Instant::now() + interval, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                timer.tick().await;
                tick();
            }
        });
        self.handle = Some(PollHandle { task, interval });
    }

    /// Disarms the timer. Returns whether one was armed.
    pub fn stop(&mut self) -> bool {
        self.handle.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
    }

    #[cfg(test)]
    fn interval(&self) -> Option<Duration> {
        self.handle.as_ref().map(|handle| handle.interval)
    }
}
