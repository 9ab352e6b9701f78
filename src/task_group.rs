//! Background task group owned by a run's execution context.
//!
//! Tasks run on the ambient tokio runtime when there is one. A group created on
//! a thread without a runtime owns a small private runtime instead.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::warn;

pub struct TaskGroup {
    handle: Handle,
    private: Option<Runtime>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskGroup {
    /// Create a group on the current runtime, or on a private one if there is none.
    pub fn new() -> std::io::Result<Self> {
        let (handle, private) = match Handle::try_current() {
            Ok(handle) => (handle, None),
            Err(_) => {
                let runtime = Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name("flowrun-background")
                    .enable_all()
                    .build()?;
                (runtime.handle().clone(), Some(runtime))
            }
        };
        Ok(Self {
            handle,
            private,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// True when the group runs on its own fallback runtime.
    pub fn is_private(&self) -> bool {
        self.private.is_some()
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.handle.spawn(task);
        self.lock().push(handle);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for every spawned task, including tasks spawned while closing.
    ///
    /// A private runtime is released when the group is dropped.
    pub async fn close(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.lock());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(err) = task.await {
                    warn!(error = %err, "background task did not complete");
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
        if let Some(runtime) = self.private.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn uses_ambient_runtime() {
        let group = TaskGroup::new().unwrap();
        assert!(!group.is_private());
    }

    #[tokio::test]
    async fn close_waits_for_tasks() {
        let group = TaskGroup::new().unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = Arc::clone(&done);
            group.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(group.len(), 3);
        group.close().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn falls_back_without_runtime() {
        let group = TaskGroup::new().unwrap();
        assert!(group.is_private());

        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        group.spawn(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let driver = Builder::new_current_thread().enable_all().build().unwrap();
        driver.block_on(group.close());
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
