//! # KVBridge Client
//!
//! Purpose: Provide a lightweight, synchronous Redis-compatible client with
//! connection pooling to minimize TCP handshake overhead.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **Failure as Values**: Every operation returns `ClientResult`; no reply
//!    shape or network failure aborts the caller.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.

mod commands;
mod config;
mod connection;
mod error;
mod pool;
pub mod resp;

pub use config::{ClientConfig, DEFAULT_CONNECT_TIMEOUT_MS};
pub use connection::{Connection, SubscribeFlag};
pub use error::{ClientError, ClientResult};
pub use pool::ConnectionPool;
pub use resp::{RespValue, MAX_ARRAY_LEN, MAX_BULK_SIZE};
