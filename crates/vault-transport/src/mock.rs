//! In-process mock transport (spec §6: "the concrete transport driver is
//! an external collaborator"). Used by `vault-engine`'s integration
//! tests to exercise the end-to-end scenarios in §8 without a real
//! Usenet/WebDAV backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use vault_common::{Locator, Result};

use crate::service::{Chunk, Service, ServiceFactory};

#[derive(Clone, Default)]
struct MockState {
    blobs: Arc<Mutex<HashMap<Locator, Vec<u8>>>>,
    get_body_calls: Arc<AtomicUsize>,
}

/// An in-memory `Service`. Every session constructed by the same
/// [`MockServiceFactory`] shares the same backing map, the way every
/// real session shares the same remote transport.
pub struct MockService {
    state: MockState,
    connected: bool,
}

#[async_trait]
impl Service for MockService {
    async fn connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<bool> {
        self.connected = true;
        Ok(true)
    }

    async fn upload(&self, chunk: Chunk) -> Result<bool> {
        let mut blobs = self.state.blobs.lock();
        if blobs.contains_key(&chunk.locator) {
            Ok(false)
        } else {
            blobs.insert(chunk.locator, chunk.ciphertext);
            Ok(true)
        }
    }

    async fn get_body(&self, locator: Locator) -> Result<Option<Vec<u8>>> {
        self.state.get_body_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.blobs.lock().get(&locator).cloned())
    }
}

/// Factory for [`MockService`] sessions, plus test-only hooks to inspect
/// or mutate the backing store (simulating blob loss for parity-repair
/// and dedup-liveness tests, spec §8).
#[derive(Clone, Default)]
pub struct MockServiceFactory {
    state: MockState,
}

impl MockServiceFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing a blob at `locator` (spec §8 scenario 5: "delete
    /// any one data blob from the transport").
    pub fn delete(&self, locator: Locator) {
        self.state.blobs.lock().remove(&locator);
    }

    #[must_use]
    pub fn get_body_call_count(&self) -> usize {
        self.state.get_body_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn blob_count(&self) -> usize {
        self.state.blobs.lock().len()
    }
}

#[async_trait]
impl ServiceFactory for MockServiceFactory {
    async fn give(&self) -> Result<Box<dyn Service>> {
        Ok(Box::new(MockService {
            state: self.state.clone(),
            connected: true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_rejects_second_write_to_same_locator() {
        let factory = MockServiceFactory::new();
        let mut session = factory.give().await.unwrap();
        session.connect().await.unwrap();
        let locator = Locator([1u8; 32]);
        assert!(session
            .upload(Chunk::new(locator, vec![1, 2, 3]))
            .await
            .unwrap());
        assert!(!session
            .upload(Chunk::new(locator, vec![4, 5, 6]))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn deleted_blob_is_absent_on_subsequent_get() {
        let factory = MockServiceFactory::new();
        let session = factory.give().await.unwrap();
        let locator = Locator([2u8; 32]);
        session.upload(Chunk::new(locator, vec![9])).await.unwrap();
        factory.delete(locator);
        assert!(session.get_body(locator).await.unwrap().is_none());
    }
}
