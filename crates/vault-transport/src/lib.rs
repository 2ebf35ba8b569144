pub mod dedup;
pub mod pool;
pub mod service;

#[cfg(any(test, feature = "mock-transport"))]
pub mod mock;

pub use dedup::DedupContext;
pub use pool::{ConnectionPool, PoolLimits, PooledSession};
pub use service::{Chunk, Service, ServiceFactory};

#[cfg(any(test, feature = "mock-transport"))]
pub use mock::{MockService, MockServiceFactory};
