// Cancellable task group owned by a trigger

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tasks sharing one cancellation token
///
/// `shutdown` cancels, aborts and awaits every task, so nothing spawned here
/// runs after it returns. Dropping the set cancels and aborts without waiting.
#[derive(Debug, Default)]
pub struct TaskSet {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(future));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub async fn shutdown(&mut self) {
        self.token.cancel();
        for handle in std::mem::take(&mut self.handles) {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.token.cancel();
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Sleep for `duration` unless cancelled first; `false` means cancelled
pub async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
