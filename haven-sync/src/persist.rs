//! Runs blocking store calls off the async executor.

use crate::error::{Result, SyncError};
use haven_store::{EncryptedStore, StorageResult};
use std::sync::Arc;

pub(crate) async fn blocking<T, F>(store: &Arc<EncryptedStore>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&EncryptedStore) -> StorageResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    let value = tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| SyncError::Task(e.to_string()))??;
    Ok(value)
}
