//! Async SQLite backend
//!
//! Same schema and queuing as `SqliteClient`; every call runs on the
//! blocking thread pool so the runtime never waits on disk I/O.

use super::client::SqliteClient;
use crate::core_storage::client::{DbClient, DbClientAsync, DbReader, DbTransaction};
use crate::core_storage::errors::StorageResult;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct SqliteAsyncClient {
    inner: Arc<SqliteClient>,
}

impl SqliteAsyncClient {
    pub async fn open<P: AsRef<Path>>(db_path: P) -> StorageResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        let inner = tokio::task::spawn_blocking(move || SqliteClient::open(path)).await??;
        Ok(Self { inner: Arc::new(inner) })
    }

    pub async fn memory() -> StorageResult<Self> {
        let inner = tokio::task::spawn_blocking(SqliteClient::memory).await??;
        Ok(Self { inner: Arc::new(inner) })
    }
}

#[async_trait]
impl DbClientAsync for SqliteAsyncClient {
    async fn read<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&dyn DbReader) -> StorageResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.read(f)).await?
    }

    async fn transaction<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&mut dyn DbTransaction) -> StorageResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.transaction(f)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_storage::types::DeletedStatus;
    use crate::core_covalue::RawCoId;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_async_writers() {
        let dir = tempfile::tempdir().unwrap();
        let client = SqliteAsyncClient::open(dir.path().join("async.db")).await.unwrap();

        let ids: Vec<RawCoId> = (0..32).map(|i| RawCoId::parse(format!("co_zItem{i}")).unwrap()).collect();
        let mut tasks = Vec::new();
        for id in ids.clone() {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                client
                    .transaction(move |tx| tx.mark_deleted(&id, DeletedStatus::Pending))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let pending = client.read(|r| r.get_all_pending_deletes()).await.unwrap();
        assert_eq!(pending.len(), ids.len());
    }
}
