use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::server::job::JobTable;
use crate::server::node::NodeTable;
use crate::Map;

/// Controller-wide configuration guarded by the config lock.
#[derive(Debug, Default)]
pub struct ConfigTable {
    pub cluster_name: String,
}

#[derive(Debug, Clone)]
pub struct PartitionRecord {
    pub name: String,
    pub node_names: Vec<String>,
}

#[derive(Debug, Default)]
pub struct PartitionTable {
    pub partitions: Map<String, PartitionRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockLevel {
    #[default]
    None,
    Read,
    Write,
}

/// Which controller tables a composite lock acquisition covers, and how.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockRequest {
    pub config: LockLevel,
    pub job: LockLevel,
    pub node: LockLevel,
    pub partition: LockLevel,
}

pub enum TableGuard<'a, T> {
    Unlocked,
    Read(RwLockReadGuard<'a, T>),
    Write(RwLockWriteGuard<'a, T>),
}

impl<'a, T> TableGuard<'a, T> {
    /// Shared access; panics when the table was not part of the request.
    pub fn get(&self) -> &T {
        match self {
            TableGuard::Unlocked => panic!("table accessed without holding its lock"),
            TableGuard::Read(guard) => guard,
            TableGuard::Write(guard) => guard,
        }
    }

    /// Exclusive access; panics unless the table was locked for writing.
    pub fn get_mut(&mut self) -> &mut T {
        match self {
            TableGuard::Write(guard) => &mut *guard,
            _ => panic!("table mutated without holding its write lock"),
        }
    }
}

/// The controller's global tables. A composite acquisition takes the
/// requested tables in the fixed order config, job, node, partition, which
/// makes lock ordering a property of the primitive rather than of each
/// call site.
#[derive(Debug, Default)]
pub struct Lockset {
    config: RwLock<ConfigTable>,
    job: RwLock<JobTable>,
    node: RwLock<NodeTable>,
    partition: RwLock<PartitionTable>,
}

pub struct LocksetGuard<'a> {
    pub config: TableGuard<'a, ConfigTable>,
    pub job: TableGuard<'a, JobTable>,
    pub node: TableGuard<'a, NodeTable>,
    pub partition: TableGuard<'a, PartitionTable>,
}

impl Lockset {
    pub async fn lock(&self, request: LockRequest) -> LocksetGuard<'_> {
        let config = Self::acquire(&self.config, request.config).await;
        let job = Self::acquire(&self.job, request.job).await;
        let node = Self::acquire(&self.node, request.node).await;
        let partition = Self::acquire(&self.partition, request.partition).await;
        LocksetGuard {
            config,
            job,
            node,
            partition,
        }
    }

    async fn acquire<T>(lock: &RwLock<T>, level: LockLevel) -> TableGuard<'_, T> {
        match level {
            LockLevel::None => TableGuard::Unlocked,
            LockLevel::Read => TableGuard::Read(lock.read().await),
            LockLevel::Write => TableGuard::Write(lock.write().await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::node::NodeRecord;

    #[tokio::test]
    async fn test_unrequested_tables_stay_free() {
        let locks = Lockset::default();
        let guard = locks
            .lock(LockRequest {
                node: LockLevel::Write,
                ..Default::default()
            })
            .await;
        // The job table was not part of the request, so it is still free.
        let job = locks
            .lock(LockRequest {
                job: LockLevel::Write,
                ..Default::default()
            })
            .await;
        drop(job);
        drop(guard);
    }

    #[tokio::test]
    async fn test_write_guard_mutates() {
        let locks = Lockset::default();
        {
            let mut guard = locks
                .lock(LockRequest {
                    node: LockLevel::Write,
                    ..Default::default()
                })
                .await;
            guard.node.get_mut().insert(NodeRecord::new(
                "n1".to_string(),
                "127.0.0.1:1".parse().unwrap(),
            ));
        }
        let guard = locks
            .lock(LockRequest {
                node: LockLevel::Read,
                ..Default::default()
            })
            .await;
        assert!(guard.node.get().find("n1").is_some());
    }

    #[tokio::test]
    #[should_panic(expected = "without holding its lock")]
    async fn test_unlocked_access_panics() {
        let locks = Lockset::default();
        let guard = locks.lock(LockRequest::default()).await;
        let _ = guard.job.get();
    }

    #[tokio::test]
    async fn test_concurrent_readers() {
        let locks = Lockset::default();
        let request = LockRequest {
            config: LockLevel::Read,
            partition: LockLevel::Read,
            ..Default::default()
        };
        let first = locks.lock(request).await;
        let second = locks.lock(request).await;
        assert_eq!(first.config.get().cluster_name, "");
        assert!(second.partition.get().partitions.is_empty());
    }
}
