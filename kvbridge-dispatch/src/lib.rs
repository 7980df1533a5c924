//! # KVBridge Dispatch
//!
//! Purpose: Non-blocking command execution and pub/sub streaming on top of
//! `kvbridge-client`, with results handed back on one consumer context.
//!
//! ## Design Principles
//! 1. **Single Consumer Drain**: Workers only enqueue; callbacks fire inside
//!    `Dispatcher::tick`, driven by the host's periodic callback.
//! 2. **Object Pool Pattern**: Result slots and connections are recycled to
//!    bound allocation churn on the hot path.
//! 3. **Cooperative Cancellation**: Subscription loops stop between blocking
//!    reads; nothing is pre-empted.
//!
//! ## Data Flow
//! caller -> `Dispatcher::async_*` -> worker (pooled connection) ->
//! completed queue -> `tick` -> callback -> slot and connection recycled.

mod config;
mod dispatcher;
mod queue;
mod slot;
mod subscription;
mod tick;

pub use config::{ConfigError, DispatcherConfig, DEFAULT_MAX_WORKERS, DEFAULT_SHUTDOWN_TIMEOUT_MS};
pub use dispatcher::{DispatchStats, Dispatcher};
pub use queue::{CompletedQueue, MpscQueue};
pub use slot::{Completion, Payload, ResultPool, ResultSlot, DEFAULT_RESULT_BATCH};
pub use subscription::{MessageFn, Subscription, SubscriptionState};
pub use tick::{IntervalTicker, TickFn, TickHost};

pub use kvbridge_client::{ClientConfig, ClientError, ClientResult, Connection, ConnectionPool};
