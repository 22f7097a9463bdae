//! Drive connection pool
//!
//! Connections are created lazily on first use and shared by every caller.
//! Two tasks racing to connect the same drive both dial, but only the first
//! one to publish its handle wins; the other drops its own and reuses it.

use crate::drive::{Drive, DriveError, DriveResult};
use async_trait::async_trait;
use keyfs_common::{DriveId, DriveRef};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Opens connections to drives
#[async_trait]
pub trait DriveConnector: Send + Sync {
    async fn connect(&self, drive: &DriveRef) -> DriveResult<Arc<dyn Drive>>;
}

/// Pool of drive connections keyed by drive identity
pub struct DrivePool {
    connector: Arc<dyn DriveConnector>,
    drives: RwLock<HashMap<DriveId, Arc<dyn Drive>>>,
    connect_timeout: Duration,
}

impl DrivePool {
    /// Create an empty pool
    pub fn new(connector: Arc<dyn DriveConnector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            drives: RwLock::new(HashMap::new()),
            connect_timeout,
        }
    }

    /// Get the shared connection for a drive, connecting if needed
    pub async fn get(&self, drive: &DriveRef) -> DriveResult<Arc<dyn Drive>> {
        let id = drive.id();
        if let Some(existing) = self.drives.read().await.get(&id) {
            return Ok(Arc::clone(existing));
        }

        // Dial without holding the lock
        let connect = self.connector.connect(drive);
        let connected = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                warn!("Failed to connect to drive {}: {}", id, e);
                return Err(e);
            }
            Err(_) => {
                warn!("Timed out connecting to drive {}", id);
                return Err(DriveError::Io(format!("connect to {id} timed out")));
            }
        };

        let mut drives = self.drives.write().await;
        let handle = drives.entry(id.clone()).or_insert_with(|| {
            debug!("Connected to drive {}", id);
            connected
        });
        Ok(Arc::clone(handle))
    }

    /// Number of pooled connections
    pub async fn len(&self) -> usize {
        self.drives.read().await.len()
    }

    /// Check if the pool holds no connections
    pub async fn is_empty(&self) -> bool {
        self.drives.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnector;
    use keyfs_common::Partition;

    #[tokio::test]
    async fn test_pool_reuses_connections() {
        let partition = Partition::new(0, vec![DriveRef::new("a", 1), DriveRef::new("b", 2)]);
        let connector = Arc::new(MemoryConnector::for_partitions(&[partition.clone()]));
        let pool = DrivePool::new(connector, Duration::from_secs(1));

        let first = pool.get(&partition.drives[0]).await.unwrap();
        let again = pool.get(&partition.drives[0]).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        pool.get(&partition.drives[1]).await.unwrap();
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_pool_unknown_drive() {
        let connector = Arc::new(MemoryConnector::default());
        let pool = DrivePool::new(connector, Duration::from_secs(1));
        let err = pool.get(&DriveRef::new("nowhere", 9)).await.err().unwrap();
        assert!(err.is_unexpected());
        assert!(pool.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connect_first_writer_wins() {
        let drive = DriveRef::new("a", 1);
        let partition = Partition::new(0, vec![drive.clone()]);
        let connector = Arc::new(MemoryConnector::for_partitions(&[partition]));
        let pool = Arc::new(DrivePool::new(connector, Duration::from_secs(1)));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let drive = drive.clone();
                tokio::spawn(async move { pool.get(&drive).await.unwrap() })
            })
            .collect();
        let handles: Vec<_> = futures::future::try_join_all(tasks).await.unwrap();
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(pool.len().await, 1);
    }
}
