//! # Test Kit
//!
//! Purpose: An in-process RESP2 store for integration tests. It speaks enough
//! of the protocol (strings, hashes, sets, lists, pub/sub, AUTH) to exercise
//! the client and the dispatcher over real TCP without an external server.
//!
//! ## Usage
//!
//! - `FakeStore::spawn()` starts a store without a password.
//! - `FakeStore::spawn_with_password("secret")` requires AUTH.
//! - `FakeStore::publish` pushes a message to subscribers directly.

mod server;
mod store;

use std::sync::Once;

use tracing_subscriber::EnvFilter;

pub use server::FakeStore;

static TRACING: Once = Once::new();

/// Installs a test-friendly subscriber once per process, honouring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
