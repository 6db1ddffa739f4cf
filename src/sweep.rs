use crate::clock::SharedClock;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle to a periodic background task. The task is aborted when the handle
/// is shut down or dropped.
pub struct SweepHandle {
    task: Option<JoinHandle<()>>,
}

impl SweepHandle {
    pub fn shutdown(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Run `tick` every `interval`, starting one interval from now. A tick is
/// awaited to completion before the next interval starts.
pub fn spawn_periodic<F, Fut>(clock: SharedClock, interval: Duration, mut tick: F) -> SweepHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(async move {
        loop {
            clock.sleep(interval).await;
            tick().await;
        }
    });
    SweepHandle { task: Some(task) }
}
