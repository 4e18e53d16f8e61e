use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinHandle;

/// Long-running background loop owned by the daemon (cache sweeper, report
/// scheduler).
#[async_trait]
pub trait BackgroundWorker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(self: Arc<Self>) -> Result<()>;
}

/// A guard that owns the join handle of a running worker.
pub struct WorkerGuard {
    name: &'static str,
    handle: JoinHandle<Result<()>>,
}

impl WorkerGuard {
    pub fn new(name: &'static str, handle: JoinHandle<Result<()>>) -> Self {
        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn join(self) -> Result<()> {
        self.handle.await??;
        Ok(())
    }
}

/// Owns the join handles of spawned workers so the daemon can stop them on
/// shutdown and surface their errors.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<Vec<WorkerGuard>>,
}

impl WorkerRegistry {
    pub fn spawn<W>(&self, worker: Arc<W>)
    where
        W: BackgroundWorker + 'static,
    {
        let name = worker.name();
        let handle = tokio::spawn(worker.run());
        self.workers.write().push(WorkerGuard::new(name, handle));
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    pub fn abort_all(&self) {
        for guard in self.workers.read().iter() {
            guard.handle.abort();
        }
    }

    pub async fn wait_all(self) -> Result<()> {
        for guard in self.workers.into_inner() {
            guard.join().await?;
        }
        Ok(())
    }
}
