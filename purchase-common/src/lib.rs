pub mod config;
pub mod decode;
pub mod health;
pub mod ingest;
pub mod loyalty;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod metrics;
pub mod pgstore;
pub mod purchase;
pub mod retry;
pub mod shutdown;
pub mod store;
