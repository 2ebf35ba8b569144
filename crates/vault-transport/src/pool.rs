//! Connection pool (spec §4.7): two counting semaphores (`total >= upload
//! >= 1`) plus a free-list of reusable transport sessions.
//!
//! Sessions are checked out with the lock released across the awaited
//! network call, and the pool itself is `Arc`-wrapped for cheap sharing
//! across concurrent callers.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use vault_common::{Error, Result};

use crate::service::{Service, ServiceFactory};

/// `total >= upload >= 1` (spec §4.7, §9 Open Question 1: the caller's
/// `upload` value is honored as given, not silently overridden).
#[derive(Clone, Copy, Debug)]
pub struct PoolLimits {
    pub total: u32,
    pub upload: u32,
}

impl PoolLimits {
    pub fn validate(self) -> Result<()> {
        if self.upload == 0 {
            return Err(Error::internal("upload connection count must be >= 1"));
        }
        if self.total < self.upload {
            return Err(Error::internal(format!(
                "total connections ({}) must be >= upload connections ({})",
                self.total, self.upload
            )));
        }
        Ok(())
    }
}

/// Bounded concurrent access to transport sessions. Upload acquires both
/// semaphores; download acquires only `total`, so uploads can never
/// starve downloads past `total - upload` concurrent slots.
pub struct ConnectionPool {
    factory: Arc<dyn ServiceFactory>,
    free: Mutex<Vec<Box<dyn Service>>>,
    total: Arc<Semaphore>,
    upload: Arc<Semaphore>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ServiceFactory>, limits: PoolLimits) -> Result<Arc<Self>> {
        limits.validate()?;
        Ok(Arc::new(Self {
            factory,
            free: Mutex::new(Vec::new()),
            total: Arc::new(Semaphore::new(limits.total as usize)),
            upload: Arc::new(Semaphore::new(limits.upload as usize)),
        }))
    }

    async fn take_or_create(&self) -> Result<Box<dyn Service>> {
        let existing = self.free.lock().pop();
        let mut session = match existing {
            Some(s) => s,
            None => self.factory.give().await?,
        };
        if !session.connected().await {
            let ok = session.connect().await?;
            if !ok {
                return Err(Error::transport("session refused to (re)connect"));
            }
        }
        Ok(session)
    }

    /// Acquires a session for an upload: holds both the `upload` and
    /// `total` permits for the session's lifetime.
    pub async fn acquire_upload(self: &Arc<Self>) -> Result<PooledSession> {
        let upload_permit = Arc::clone(&self.upload)
            .acquire_owned()
            .await
            .map_err(|_| Error::internal("upload semaphore closed"))?;
        let total_permit = Arc::clone(&self.total)
            .acquire_owned()
            .await
            .map_err(|_| Error::internal("total semaphore closed"))?;
        let session = self.take_or_create().await?;
        Ok(PooledSession {
            pool: Arc::clone(self),
            session: Some(session),
            _total_permit: total_permit,
            _upload_permit: Some(upload_permit),
        })
    }

    /// Acquires a session for a download: holds only the `total` permit.
    pub async fn acquire_download(self: &Arc<Self>) -> Result<PooledSession> {
        let total_permit = Arc::clone(&self.total)
            .acquire_owned()
            .await
            .map_err(|_| Error::internal("total semaphore closed"))?;
        let session = self.take_or_create().await?;
        Ok(PooledSession {
            pool: Arc::clone(self),
            session: Some(session),
            _total_permit: total_permit,
            _upload_permit: None,
        })
    }
}

/// A checked-out session. Returned to the pool's free-list on drop
/// regardless of how the borrow ends (spec §4.7: "Sessions are returned
/// to the free-list in a finally path regardless of outcome").
pub struct PooledSession {
    pool: Arc<ConnectionPool>,
    session: Option<Box<dyn Service>>,
    _total_permit: OwnedSemaphorePermit,
    _upload_permit: Option<OwnedSemaphorePermit>,
}

impl PooledSession {
    pub async fn upload(&self, chunk: crate::service::Chunk) -> Result<bool> {
        self.session
            .as_ref()
            .expect("session present for the lifetime of the borrow")
            .upload(chunk)
            .await
    }

    pub async fn get_body(&self, locator: vault_common::Locator) -> Result<Option<Vec<u8>>> {
        self.session
            .as_ref()
            .expect("session present for the lifetime of the borrow")
            .get_body(locator)
            .await
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.free.lock().push(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockServiceFactory;

    #[tokio::test]
    async fn upload_acquires_both_permits_download_acquires_total_only() {
        let factory = Arc::new(MockServiceFactory::new());
        let pool = ConnectionPool::new(factory, PoolLimits { total: 2, upload: 1 }).unwrap();

        let upload_guard = pool.acquire_upload().await.unwrap();
        // A second upload should block until the first is released: total=2
        // means one slot remains for a download concurrently.
        let download_guard = pool.acquire_download().await.unwrap();
        drop(upload_guard);
        drop(download_guard);
    }

    #[test]
    fn rejects_upload_greater_than_total() {
        assert!(PoolLimits { total: 1, upload: 2 }.validate().is_err());
    }

    #[tokio::test]
    async fn sessions_are_reused_from_the_free_list() {
        let factory = Arc::new(MockServiceFactory::new());
        let pool = ConnectionPool::new(factory, PoolLimits { total: 1, upload: 1 }).unwrap();
        {
            let _g = pool.acquire_upload().await.unwrap();
        }
        assert_eq!(pool.free.lock().len(), 1);
        let _g = pool.acquire_download().await.unwrap();
        assert_eq!(pool.free.lock().len(), 0);
    }
}
