// core/task.rs

// Handle to a background loop spawned on the tokio runtime, paired with the
// token that asks it to wind down.

use log::warn;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) struct BackgroundTask {
    name: &'static str,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawns `run` on `handle`, handing it the shutdown token
    pub(crate) fn spawn<F, Fut>(handle: &Handle, name: &'static str, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let shutdown = CancellationToken::new();
        let task = handle.spawn(run(shutdown.clone()));
        BackgroundTask {
            name,
            shutdown,
            task,
        }
    }

    /// Signals shutdown and waits for the loop to return
    pub(crate) async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Err(e) = (&mut self.task).await {
            warn!("{} task ended abnormally: {}", self.name, e);
        }
    }
}

impl Drop for BackgroundTask {
    // A handle dropped without an explicit shutdown still lets the loop finish its current step
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
