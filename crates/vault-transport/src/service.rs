//! `ServiceFactory` / `Service` — the transport collaborator (spec §6).
//!
//! The core never speaks to Usenet (or any concrete transport) directly;
//! it depends only on this trait pair. A WebDAV/NNTP driver living
//! outside the core implements it.

use async_trait::async_trait;
use vault_common::{Locator, Result};

/// One blob write: `locator` addresses it, `subject` is transport-level
/// metadata the driver may use for its own bookkeeping (e.g. an NNTP
/// message subject), `ciphertext` is the padded, encrypted segment.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub locator: Locator,
    pub subject: [u8; 16],
    pub ciphertext: Vec<u8>,
}

impl Chunk {
    #[must_use]
    pub fn new(locator: Locator, ciphertext: Vec<u8>) -> Self {
        let mut subject = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut subject);
        Self {
            locator,
            subject,
            ciphertext,
        }
    }
}

/// One transport session. `connect`/`connected` model a session that can
/// drop and must be reconnected before reuse (spec §4.7).
#[async_trait]
pub trait Service: Send + Sync {
    async fn connected(&self) -> bool;

    /// Attempts to (re)connect. Returns `Ok(true)` on success, `Ok(false)`
    /// if the transport explicitly refused, `Err` on transport failure.
    async fn connect(&mut self) -> Result<bool>;

    /// `true` if the blob was accepted at this locator (newly stored);
    /// `false` if another blob already occupies the locator. Errors are
    /// always `Error::Transport`.
    async fn upload(&self, chunk: Chunk) -> Result<bool>;

    /// `None` if no blob exists at `locator`; errors are always
    /// `Error::Transport`.
    async fn get_body(&self, locator: Locator) -> Result<Option<Vec<u8>>>;
}

/// Produces transport sessions on demand (spec §6 `ServiceFactory`).
#[async_trait]
pub trait ServiceFactory: Send + Sync {
    async fn give(&self) -> Result<Box<dyn Service>>;
}
