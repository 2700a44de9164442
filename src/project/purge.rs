//! Background deletion of projects and repositories marked for purge.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::project::ProjectManager;

/// Periodically runs [`ProjectManager::purge_marked`].
#[derive(Debug)]
pub struct PurgeWorker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl PurgeWorker {
    /// Spawn the worker on the current runtime. The first pass runs immediately.
    pub fn start(manager: ProjectManager, interval: Duration) -> Self {
        let (shutdown, mut stop) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => match manager.purge_marked().await {
                        Ok(0) => {}
                        Ok(purged) => info!(purged, "purge pass finished"),
                        Err(e) => warn!(error = %e, "purge pass failed"),
                    },
                }
            }
            debug!("purge worker stopped");
        });
        Self { shutdown, handle }
    }

    /// Stop the worker, waiting for a running pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            warn!(error = %e, "purge worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::{Author, ProjectName};
    use tempfile::TempDir;

    #[tokio::test]
    async fn worker_purges_marked_projects() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path());
        let manager = ProjectManager::open(&config, None).await.unwrap();
        manager
            .create(ProjectName::new("doomed").unwrap(), Author::system())
            .await
            .unwrap();
        manager.mark_for_purge("doomed").await.unwrap();

        let worker = PurgeWorker::start(manager.clone(), Duration::from_millis(10));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while std::fs::read_dir(dir.path()).unwrap().count() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "project was not purged");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.shutdown().await;
    }
}
