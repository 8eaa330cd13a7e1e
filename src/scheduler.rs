use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

type JobCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Invoke once after the delay.
    Once(Duration),
    /// Invoke repeatedly; the first run happens one period after start.
    Every(Duration),
}

/// Restartable timer driving an async callback on the tokio runtime.
///
/// With `wait_for_completion` (the default) the next tick is not taken until
/// the previous invocation has finished, so invocations of one job never
/// overlap. Ticks missed while a slow invocation runs are delayed rather than
/// replayed in a burst.
pub struct TimedJob {
    name: String,
    schedule: Schedule,
    wait_for_completion: bool,
    callback: JobCallback,
    task: Option<JoinHandle<()>>,
}

impl TimedJob {
    pub fn new<F, Fut>(name: &str, schedule: Schedule, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: JobCallback = Arc::new(move || -> BoxFuture<'static, ()> {
            Box::pin(callback())
        });
        Self {
            name: name.to_owned(),
            schedule,
            wait_for_completion: true,
            callback,
            task: None,
        }
    }

    /// Fire every tick even while an earlier invocation is still running.
    #[cfg(test)]
    pub fn allow_overlap(mut self) -> Self {
        self.wait_for_completion = false;
        self
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Start the job, restarting it if it is already running.
    pub fn start(&mut self) {
        self.stop();
        let callback = self.callback.clone();
        let wait_for_completion = self.wait_for_completion;
        let task = match self.schedule {
            Schedule::Once(delay) => tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                callback().await;
            }),
            Schedule::Every(period) => {
                let period = period.max(Duration::from_millis(1));
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        interval.tick().await;
                        if wait_for_completion {
                            callback().await;
                        } else {
                            tokio::spawn(callback());
                        }
                    }
                })
            }
        };
        debug!("timed job {} started ({:?})", self.name, self.schedule);
        self.task = Some(task);
    }

    /// Halt future invocations. Safe to call when already stopped.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("timed job {} stopped", self.name);
        }
    }
}

impl Drop for TimedJob {
    fn drop(&mut self) {
        self.stop();
    }
}
