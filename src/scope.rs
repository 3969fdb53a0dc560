//! Where background saves and change reconciliation run.
//!
//! Cells accept an injected [`SaveScope`] wrapping a tokio runtime handle.
//! Without one they pick up the ambient runtime on first use, or fall back to
//! a small process-wide I/O runtime when called from plain threads.

use std::future::Future;
use std::sync::OnceLock;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::{Result, SaverError};

/// Worker threads of the fallback runtime.
const FALLBACK_WORKERS: usize = 2;

static FALLBACK: OnceLock<Runtime> = OnceLock::new();

/// Context capable of running cancellable background work.
#[derive(Debug, Clone)]
pub struct SaveScope {
    handle: Handle,
}

impl SaveScope {
    /// Run background work on the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// The runtime the caller is currently inside, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// The ambient runtime, or the process-wide fallback I/O runtime.
    pub fn ambient() -> Result<Self> {
        if let Some(scope) = Self::current() {
            return Ok(scope);
        }
        if let Some(runtime) = FALLBACK.get() {
            return Ok(Self::new(runtime.handle().clone()));
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(FALLBACK_WORKERS)
            .thread_name("datasaver-io")
            .enable_all()
            .build()?;
        info!("started fallback datasaver I/O runtime");
        // Another thread may have won the race; use whichever got stored
        let runtime = FALLBACK.get_or_init(|| runtime);
        Ok(Self::new(runtime.handle().clone()))
    }

    /// The underlying runtime handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

/// Observable handle on one background save.
///
/// Dropping the handle detaches the save; it keeps running.
#[derive(Debug)]
pub struct SaveHandle {
    task: JoinHandle<Result<()>>,
}

impl SaveHandle {
    pub(crate) fn new(task: JoinHandle<Result<()>>) -> Self {
        Self { task }
    }

    /// Cancel the save. An adapter write that has not started never happens.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Whether the save has finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the save and return its outcome.
    ///
    /// A cancelled save resolves to [`SaverError::Cancelled`].
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(SaverError::Cancelled),
            Err(err) => Err(SaverError::Backend(format!("save task failed: {}", err))),
        }
    }
}
