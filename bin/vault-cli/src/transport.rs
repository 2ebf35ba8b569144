//! Filesystem-backed transport collaborator.
//!
//! The core engine depends only on `vault_transport::{Service,
//! ServiceFactory}` — the concrete transport driver (WebDAV/NNTP/etc)
//! is explicitly out of the core's scope (spec §1) and lives outside
//! it. This is that outside piece for the CLI: it stores each blob as
//! one file named by its locator under `<vault_dir>/blobs/`, so the
//! CLI works end-to-end against local disk without a real backend.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use vault_common::{Error, Locator, Result};
use vault_transport::{Chunk, Service, ServiceFactory};

pub struct FsServiceFactory {
    blobs_dir: PathBuf,
}

impl FsServiceFactory {
    #[must_use]
    pub fn new(blobs_dir: PathBuf) -> Self {
        Self { blobs_dir }
    }
}

#[async_trait]
impl ServiceFactory for FsServiceFactory {
    async fn give(&self) -> Result<Box<dyn Service>> {
        Ok(Box::new(FsService {
            blobs_dir: self.blobs_dir.clone(),
            connected: false,
        }))
    }
}

struct FsService {
    blobs_dir: PathBuf,
    connected: bool,
}

impl FsService {
    fn path_for(&self, locator: Locator) -> PathBuf {
        self.blobs_dir.join(hex::encode(locator.as_ref()))
    }
}

#[async_trait]
impl Service for FsService {
    async fn connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<bool> {
        tokio::fs::create_dir_all(&self.blobs_dir)
            .await
            .map_err(|e| Error::transport(e.to_string()))?;
        self.connected = true;
        Ok(true)
    }

    async fn upload(&self, chunk: Chunk) -> Result<bool> {
        let path = self.path_for(chunk.locator);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                file.write_all(&chunk.ciphertext)
                    .await
                    .map_err(|e| Error::transport(e.to_string()))?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::transport(e.to_string())),
        }
    }

    async fn get_body(&self, locator: Locator) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(locator)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::transport(e.to_string())),
        }
    }
}
