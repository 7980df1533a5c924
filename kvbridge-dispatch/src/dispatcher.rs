//! # Dispatcher
//!
//! Purpose: Run store commands on worker threads without blocking the caller
//! and hand typed results back on a single consumer context.
//!
//! ## Design Principles
//! 1. **Single Consumer**: Callbacks fire only inside `tick`, which a
//!    try-lock serialises. Callbacks never run concurrently with each other.
//! 2. **Object Pool Pattern**: Each result shape has its own slot pool and
//!    completed queue ("lane"); connections come from a shared pool.
//! 3. **Explicit Hand-off**: A slot and its borrowed connection move from the
//!    caller to one worker, then to the completed queue, then to the drain,
//!    which fires the callback and returns both to their pools.
//! 4. **Bounded Workers**: Blocking work runs on a tokio blocking pool capped
//!    at `max_workers`; excess submissions queue instead of spawning.
//!
//! ## Delivery Contract
//! - Every accepted call fires its callback exactly once, on a later `tick`.
//! - A call cancelled before it ran (queued when the shutdown timeout
//!   expired) or whose worker unwound reports `(false, default)`. If its
//!   worker outlives `shutdown`, the result waits for a later `tick`.
//! - With `notify_preflight_failure = false`, a call whose pooled connection
//!   could not be opened is dropped and its callback never fires.
//! - Calls submitted after `shutdown` are dropped.
//! - No ordering holds between calls, even on the same key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kvbridge_client::{ClientError, ClientResult, Connection, ConnectionPool, RespValue};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, trace, warn};

use crate::config::DispatcherConfig;
use crate::queue::CompletedQueue;
use crate::slot::{Completion, Payload, ResultPool, ResultSlot};
use crate::subscription::{Delivery, Subscription, SubscriptionState};
use crate::tick::TickHost;

/// Slot pool and completed queue for one result shape.
struct Lane<T: Payload> {
    pool: ResultPool<T>,
    completed: CompletedQueue<T>,
}

impl<T: Payload> Lane<T> {
    fn new(batch: usize) -> Arc<Self> {
        Arc::new(Lane {
            pool: ResultPool::new(batch),
            completed: CompletedQueue::new(),
        })
    }

    /// Fires callbacks for completed slots, then recycles slots and
    /// connections.
    fn drain(&self, connections: &ConnectionPool) -> usize {
        let ready = self.completed.take_all();
        let count = ready.len();
        for mut slot in ready {
            slot.complete();
            if let Some(conn) = slot.take_connection() {
                connections.release(conn);
            }
            self.pool.recycle(slot);
        }
        count
    }
}

struct Lanes {
    no_return: Arc<Lane<()>>,
    exists: Arc<Lane<bool>>,
    mget: Arc<Lane<Vec<String>>>,
    get_int: Arc<Lane<i64>>,
    get_str: Arc<Lane<String>>,
    hget: Arc<Lane<String>>,
    hmget: Arc<Lane<HashMap<String, String>>>,
    hgetall: Arc<Lane<HashMap<String, String>>>,
    smembers: Arc<Lane<Vec<String>>>,
}

impl Lanes {
    fn new(batch: usize) -> Self {
        Lanes {
            no_return: Lane::new(batch),
            exists: Lane::new(batch),
            mget: Lane::new(batch),
            get_int: Lane::new(batch),
            get_str: Lane::new(batch),
            hget: Lane::new(batch),
            hmget: Lane::new(batch),
            hgetall: Lane::new(batch),
            smembers: Lane::new(batch),
        }
    }

    fn drain(&self, connections: &ConnectionPool) -> usize {
        self.no_return.drain(connections)
            + self.exists.drain(connections)
            + self.mget.drain(connections)
            + self.get_int.drain(connections)
            + self.get_str.drain(connections)
            + self.hget.drain(connections)
            + self.hmget.drain(connections)
            + self.hgetall.drain(connections)
            + self.smembers.drain(connections)
    }

    fn capacity(&self) -> usize {
        self.no_return.pool.capacity()
            + self.exists.pool.capacity()
            + self.mget.pool.capacity()
            + self.get_int.pool.capacity()
            + self.get_str.pool.capacity()
            + self.hget.pool.capacity()
            + self.hmget.pool.capacity()
            + self.hgetall.pool.capacity()
            + self.smembers.pool.capacity()
    }
}

/// Decrements the in-flight counter when a job ends, however it ends.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Owns a checked-out slot until the worker hands it on. A job dropped
/// before that point reports failure through the completed queue.
struct Handoff<T: Payload> {
    lane: Arc<Lane<T>>,
    slot: Option<Box<ResultSlot<T>>>,
}

impl<T: Payload> Drop for Handoff<T> {
    fn drop(&mut self) {
        if let Some(mut slot) = self.slot.take() {
            debug!("async call abandoned before completion");
            slot.success = false;
            slot.payload.reset();
            self.lane.completed.push(slot);
        }
    }
}

/// Point-in-time counters for observing pool reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub in_flight: usize,
    pub idle_connections: usize,
    pub created_connections: usize,
    pub result_slots: usize,
}

/// Asynchronous command front end with a synchronous facade.
pub struct Dispatcher {
    config: DispatcherConfig,
    pool: ConnectionPool,
    lanes: Lanes,
    workers: RwLock<Option<Runtime>>,
    in_flight: Arc<AtomicUsize>,
    drain_lock: Mutex<()>,
    sync_conn: Mutex<Connection>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl Dispatcher {
    /// Builds the pools and the worker runtime. No connection is opened.
    pub fn new(config: DispatcherConfig) -> ClientResult<Self> {
        let workers = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.worker_limit())
            .thread_name("kvbridge-worker")
            .build()?;

        info!(
            host = %config.client.host,
            port = config.client.port,
            max_workers = config.worker_limit(),
            "dispatcher started"
        );

        Ok(Dispatcher {
            pool: ConnectionPool::new(config.client.clone()),
            lanes: Lanes::new(config.result_batch),
            workers: RwLock::new(Some(workers)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            drain_lock: Mutex::new(()),
            sync_conn: Mutex::new(Connection::new(config.client.clone())),
            subscriptions: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Returns true until `shutdown` runs.
    pub fn is_running(&self) -> bool {
        self.workers.read().is_some()
    }

    /// Registers the drain with a periodic host.
    ///
    /// The host keeps only a weak reference; the tick unregisters itself once
    /// the dispatcher is dropped or shut down.
    pub fn attach<H: TickHost + ?Sized>(self: &Arc<Self>, host: &H) {
        let weak = Arc::downgrade(self);
        host.register_tick(Box::new(move || match weak.upgrade() {
            Some(dispatcher) if dispatcher.is_running() => {
                dispatcher.tick();
                true
            }
            _ => false,
        }));
    }

    // ---- Drain ------------------------------------------------------------

    /// Drains every completed queue and subscription relay, firing callbacks
    /// on the calling thread. Returns how many callbacks ran.
    ///
    /// A call made while another drain is running (including from inside a
    /// callback) returns 0 immediately.
    pub fn tick(&self) -> usize {
        let Some(_guard) = self.drain_lock.try_lock() else {
            trace!("drain already in progress");
            return 0;
        };

        let mut delivered = self.lanes.drain(&self.pool);
        let relays: Vec<Delivery> = self
            .subscriptions
            .lock()
            .values_mut()
            .flat_map(Subscription::deliveries)
            .collect();
        for relay in &relays {
            delivered += relay.run();
        }

        if delivered > 0 {
            trace!(delivered, "drain");
        }
        delivered
    }

    /// Number of submitted calls whose worker has not finished.
    pub fn pending(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Waits until no call is running on a worker. Returns false on timeout.
    ///
    /// Finished calls still need a `tick` to fire their callbacks.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            in_flight: self.pending(),
            idle_connections: self.pool.idle_len(),
            created_connections: self.pool.created(),
            result_slots: self.lanes.capacity(),
        }
    }

    // ---- Lifecycle --------------------------------------------------------

    /// Stops accepting work, waits for in-flight calls, cancels every
    /// subscription, delivers what completed, then closes connections.
    ///
    /// Idempotent. Must not be called from inside an async runtime.
    pub fn shutdown(&self) {
        let Some(runtime) = self.workers.write().take() else {
            return;
        };

        let timeout = self.config.shutdown_timeout();
        let started = Instant::now();
        if !self.wait_idle(timeout) {
            warn!(pending = self.pending(), "in-flight calls outlived shutdown timeout");
        }
        runtime.shutdown_timeout(timeout.saturating_sub(started.elapsed()));

        for subscription in self.subscriptions.lock().values_mut() {
            subscription.unsubscribe();
        }

        let delivered = self.tick();
        let closed = self.pool.close_idle();
        self.sync_conn.lock().quit();
        info!(delivered, closed, "dispatcher shut down");
    }

    // ---- Synchronous facade -----------------------------------------------

    /// Locks the dedicated synchronous connection.
    ///
    /// Holding the guard blocks other synchronous callers, not async work.
    pub fn sync(&self) -> MutexGuard<'_, Connection> {
        self.sync_conn.lock()
    }

    /// Opens the synchronous connection with the configured endpoint.
    pub fn connect(&self) -> ClientResult<()> {
        self.sync_conn.lock().connect()
    }

    /// Re-opens the synchronous connection if it is not connected.
    pub fn reconnect(&self) -> ClientResult<()> {
        self.sync_conn.lock().reconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.sync_conn.lock().is_connected()
    }

    /// Sends QUIT on the synchronous connection and disconnects it.
    pub fn quit(&self) {
        self.sync_conn.lock().quit();
    }

    pub fn select_index(&self, index: u32) -> ClientResult<()> {
        self.sync_conn.lock().select_index(index)
    }

    pub fn exec_command<A: AsRef<[u8]>>(&self, args: &[A]) -> ClientResult<RespValue> {
        self.sync_conn.lock().exec_command(args)
    }

    pub fn publish(&self, channel: &str, message: &str) -> ClientResult<i64> {
        self.sync_conn.lock().publish(channel, message)
    }

    // ---- Subscriptions ----------------------------------------------------

    /// Subscribes to `channel`; `on_message` runs inside `tick` for each
    /// relayed message.
    ///
    /// A no-op when the channel is already active; the existing handler is
    /// kept. A cancelled channel is re-subscribed on a fresh connection once
    /// its previous loop has exited; until then this fails with
    /// `SubscriptionClosing`. Messages from the previous run still go to the
    /// previous handler.
    pub fn subscribe<F>(&self, channel: &str, on_message: F) -> ClientResult<()>
    where
        F: FnMut(&str, &str) + Send + 'static,
    {
        if !self.is_running() {
            return Err(ClientError::ShuttingDown);
        }

        let mut subscriptions = self.subscriptions.lock();
        let subscription = subscriptions.entry(channel.to_string()).or_insert_with(|| {
            Subscription::new(self.config.client.clone(), Box::new(|_: &str, _: &str| {}))
        });
        if subscription.state() == SubscriptionState::Unsubscribed {
            subscription.set_handler(Box::new(on_message));
        }
        subscription.subscribe(channel)
    }

    /// Requests cancellation of `channel`. Returns false when it was not
    /// subscribed.
    ///
    /// Messages already read by the loop are still delivered by later ticks.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        match self.subscriptions.lock().get_mut(channel) {
            Some(subscription) => subscription.unsubscribe(),
            None => false,
        }
    }

    pub fn subscription_state(&self, channel: &str) -> SubscriptionState {
        self.subscriptions
            .lock()
            .get(channel)
            .map(Subscription::state)
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    // ---- Asynchronous operations ------------------------------------------

    /// Checks a slot out of `lane`, then runs `op` on a worker with a pooled
    /// connection. The slot reaches the completed queue on success, on
    /// command failure, and on pre-flight failure when notification is on.
    fn submit<T, Op>(&self, lane: &Arc<Lane<T>>, callback: Completion<T>, op: Op)
    where
        T: Payload,
        Op: FnOnce(&mut Connection, &mut T) -> ClientResult<()> + Send + 'static,
    {
        let workers = self.workers.read();
        let Some(runtime) = workers.as_ref() else {
            debug!("dispatcher shut down; call dropped");
            return;
        };

        let mut slot = lane.pool.checkout();
        slot.arm(callback);
        let mut handoff = Handoff {
            lane: Arc::clone(lane),
            slot: Some(slot),
        };
        let connections = self.pool.clone();
        let notify = self.config.notify_preflight_failure;
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let done = InFlight(Arc::clone(&self.in_flight));

        runtime.spawn_blocking(move || {
            let _done = done;
            let mut conn = connections.acquire();
            if !conn.is_connected() {
                connections.release(conn);
                if !notify {
                    debug!("pre-flight connect failed; call dropped");
                    if let Some(slot) = handoff.slot.take() {
                        handoff.lane.pool.recycle(slot);
                    }
                }
                // With notification on, dropping the handoff reports failure.
                return;
            }

            let Some(slot) = handoff.slot.as_mut() else {
                return;
            };
            let outcome = op(&mut conn, &mut slot.payload);
            if let Some(mut slot) = handoff.slot.take() {
                match outcome {
                    Ok(()) => slot.success = true,
                    Err(err) => {
                        debug!(error = %err, "async command failed");
                        slot.success = false;
                        slot.payload.reset();
                    }
                }
                slot.attach(conn);
                handoff.lane.completed.push(slot);
            }
        });
    }

    fn submit_no_return<F, Op>(&self, callback: F, op: Op)
    where
        F: FnOnce(bool) + Send + 'static,
        Op: FnOnce(&mut Connection) -> ClientResult<()> + Send + 'static,
    {
        self.submit(
            &self.lanes.no_return,
            Box::new(move |ok: bool, _: &()| callback(ok)),
            move |conn, _| op(conn),
        );
    }

    /// Callback receives `(success, exists)`.
    pub fn async_exists_key<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(bool, bool) + Send + 'static,
    {
        let key = key.to_string();
        self.submit(
            &self.lanes.exists,
            Box::new(move |ok: bool, found: &bool| callback(ok, *found)),
            move |conn, out| {
                *out = conn.exists_key(&key)?;
                Ok(())
            },
        );
    }

    pub fn async_expire_key<F>(&self, key: &str, seconds: i64, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let key = key.to_string();
        self.submit_no_return(callback, move |conn| conn.expire_key(&key, seconds).map(|_| ()));
    }

    pub fn async_del_key<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let key = key.to_string();
        self.submit_no_return(callback, move |conn| conn.del_key(&key).map(|_| ()));
    }

    /// Callback receives the present values; missing keys are skipped.
    pub fn async_mget<F>(&self, keys: &[&str], callback: F)
    where
        F: FnOnce(bool, &[String]) + Send + 'static,
    {
        let keys = owned(keys);
        self.submit(
            &self.lanes.mget,
            Box::new(move |ok: bool, values: &Vec<String>| callback(ok, values)),
            move |conn, out| {
                *out = conn.mget(&borrowed(&keys))?;
                Ok(())
            },
        );
    }

    pub fn async_set_int<F>(&self, key: &str, value: i64, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let key = key.to_string();
        self.submit_no_return(callback, move |conn| conn.set_int(&key, value));
    }

    /// Callback receives `(success, value)`; the value is 0 on failure.
    pub fn async_get_int<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(bool, i64) + Send + 'static,
    {
        let key = key.to_string();
        self.submit(
            &self.lanes.get_int,
            Box::new(move |ok: bool, value: &i64| callback(ok, *value)),
            move |conn, out| {
                *out = conn.get_int(&key)?;
                Ok(())
            },
        );
    }

    pub fn async_set_str<F>(&self, key: &str, value: &str, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let key = key.to_string();
        let value = value.to_string();
        self.submit_no_return(callback, move |conn| conn.set_str(&key, &value));
    }

    /// Callback receives `(success, value)`; the value is empty on failure.
    pub fn async_get_str<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(bool, &str) + Send + 'static,
    {
        let key = key.to_string();
        self.submit(
            &self.lanes.get_str,
            Box::new(move |ok: bool, value: &String| callback(ok, value)),
            move |conn, out| {
                *out = conn.get_str(&key)?;
                Ok(())
            },
        );
    }

    pub fn async_sadd<F>(&self, key: &str, members: &[&str], callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let key = key.to_string();
        let members = owned(members);
        self.submit_no_return(callback, move |conn| {
            conn.sadd(&key, &borrowed(&members)).map(|_| ())
        });
    }

    pub fn async_srem<F>(&self, key: &str, members: &[&str], callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let key = key.to_string();
        let members = owned(members);
        self.submit_no_return(callback, move |conn| {
            conn.srem(&key, &borrowed(&members)).map(|_| ())
        });
    }

    pub fn async_smembers<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(bool, &[String]) + Send + 'static,
    {
        let key = key.to_string();
        self.submit(
            &self.lanes.smembers,
            Box::new(move |ok: bool, members: &Vec<String>| callback(ok, members)),
            move |conn, out| {
                *out = conn.smembers(&key)?;
                Ok(())
            },
        );
    }

    pub fn async_hset<F>(&self, key: &str, field: &str, value: &str, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let (key, field, value) = (key.to_string(), field.to_string(), value.to_string());
        self.submit_no_return(callback, move |conn| conn.hset(&key, &field, &value));
    }

    /// Reads one hash field. Callback receives `(success, value)`.
    pub fn async_hget<F>(&self, key: &str, field: &str, callback: F)
    where
        F: FnOnce(bool, &str) + Send + 'static,
    {
        let (key, field) = (key.to_string(), field.to_string());
        self.submit(
            &self.lanes.hget,
            Box::new(move |ok: bool, value: &String| callback(ok, value)),
            move |conn, out| {
                *out = conn.hget(&key, &field)?;
                Ok(())
            },
        );
    }

    pub fn async_hmset<F>(&self, key: &str, pairs: &[(&str, &str)], callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let key = key.to_string();
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|&(field, value)| (field.to_string(), value.to_string()))
            .collect();
        self.submit_no_return(callback, move |conn| {
            let pairs: Vec<(&str, &str)> = pairs
                .iter()
                .map(|(field, value)| (field.as_str(), value.as_str()))
                .collect();
            conn.hmset(&key, &pairs)
        });
    }

    pub fn async_hdel<F>(&self, key: &str, fields: &[&str], callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let key = key.to_string();
        let fields = owned(fields);
        self.submit_no_return(callback, move |conn| {
            conn.hdel(&key, &borrowed(&fields)).map(|_| ())
        });
    }

    /// Callback receives only the requested fields that are present.
    pub fn async_hmget<F>(&self, key: &str, fields: &[&str], callback: F)
    where
        F: FnOnce(bool, &HashMap<String, String>) + Send + 'static,
    {
        let key = key.to_string();
        let fields = owned(fields);
        self.submit(
            &self.lanes.hmget,
            Box::new(move |ok: bool, values: &HashMap<String, String>| callback(ok, values)),
            move |conn, out| {
                *out = conn.hmget(&key, &borrowed(&fields))?;
                Ok(())
            },
        );
    }

    pub fn async_hgetall<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(bool, &HashMap<String, String>) + Send + 'static,
    {
        let key = key.to_string();
        self.submit(
            &self.lanes.hgetall,
            Box::new(move |ok: bool, values: &HashMap<String, String>| callback(ok, values)),
            move |conn, out| {
                *out = conn.hgetall(&key)?;
                Ok(())
            },
        );
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn borrowed(items: &[String]) -> Vec<&str> {
    items.iter().map(String::as_str).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvbridge_client::ClientConfig;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicBool;

    fn unreachable_config(notify: bool) -> DispatcherConfig {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        DispatcherConfig {
            client: ClientConfig {
                connect_timeout_ms: 100,
                ..ClientConfig::new("127.0.0.1", port, "")
            },
            result_batch: 4,
            max_workers: 2,
            notify_preflight_failure: notify,
            shutdown_timeout_ms: 2_000,
        }
    }

    #[test]
    fn lane_drain_fires_and_recycles() {
        let lane: Arc<Lane<i64>> = Lane::new(2);
        let connections = ConnectionPool::new(ClientConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));

        for value in 0..3 {
            let mut slot = lane.pool.checkout();
            let seen = Arc::clone(&fired);
            slot.arm(Box::new(move |ok: bool, got: &i64| {
                assert!(ok);
                assert_eq!(*got, value);
                seen.fetch_add(1, Ordering::SeqCst);
            }));
            slot.success = true;
            slot.payload = value;
            lane.completed.push(slot);
        }

        assert_eq!(lane.drain(&connections), 3);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(lane.pool.capacity(), 4);
        assert_eq!(lane.pool.free_len(), 4);
        assert_eq!(lane.drain(&connections), 0);
    }

    #[test]
    fn abandoned_handoff_reports_failure() {
        let lane: Arc<Lane<String>> = Lane::new(2);
        let connections = ConnectionPool::new(ClientConfig::default());
        let outcome = Arc::new(Mutex::new(Vec::new()));

        let mut slot = lane.pool.checkout();
        let sink = Arc::clone(&outcome);
        slot.arm(Box::new(move |ok: bool, value: &String| {
            sink.lock().push((ok, value.clone()));
        }));
        slot.payload = "partial".to_string();
        drop(Handoff {
            lane: Arc::clone(&lane),
            slot: Some(slot),
        });

        assert_eq!(lane.drain(&connections), 1);
        assert_eq!(*outcome.lock(), vec![(false, String::new())]);
        assert_eq!(lane.pool.free_len(), 2);
    }

    #[test]
    fn calls_queued_past_the_shutdown_timeout_still_complete_once() {
        let store = kvbridge_testkit::FakeStore::spawn();
        let config = DispatcherConfig {
            max_workers: 1,
            shutdown_timeout_ms: 50,
            ..DispatcherConfig::new(ClientConfig::new(store.host(), store.port(), ""))
        };
        let dispatcher = Dispatcher::new(config).unwrap();
        let fired = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&fired);
        dispatcher.submit_no_return(
            move |ok| sink.lock().push(("slow".to_string(), ok)),
            |_| {
                thread::sleep(Duration::from_millis(300));
                Ok(())
            },
        );
        for idx in 0..3 {
            let sink = Arc::clone(&fired);
            dispatcher.async_set_str(&format!("k{}", idx), "v", move |ok| {
                sink.lock().push((format!("k{}", idx), ok));
            });
        }

        dispatcher.shutdown();
        let deadline = Instant::now() + Duration::from_secs(5);
        while fired.lock().len() < 4 && Instant::now() < deadline {
            dispatcher.tick();
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(50));
        dispatcher.tick();

        let mut names: Vec<String> = fired.lock().iter().map(|(name, _)| name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["k0", "k1", "k2", "slow"]);
    }

    #[test]
    fn preflight_failure_is_delivered_when_notifying() {
        let dispatcher = Dispatcher::new(unreachable_config(true)).unwrap();
        let outcome = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&outcome);
        dispatcher.async_get_str("k", move |ok, value| {
            *sink.lock() = Some((ok, value.to_string()));
        });

        assert!(dispatcher.wait_idle(Duration::from_secs(2)));
        assert_eq!(dispatcher.tick(), 1);
        assert_eq!(*outcome.lock(), Some((false, String::new())));
    }

    #[test]
    fn preflight_failure_is_dropped_when_silent() {
        let dispatcher = Dispatcher::new(unreachable_config(false)).unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&fired);
        dispatcher.async_set_int("k", 1, move |_| seen.store(true, Ordering::SeqCst));

        assert!(dispatcher.wait_idle(Duration::from_secs(2)));
        assert_eq!(dispatcher.tick(), 0);
        assert!(!fired.load(Ordering::SeqCst));
        // The slot went back to the free list.
        assert_eq!(dispatcher.lanes.no_return.pool.free_len(), 4);
    }

    #[test]
    fn calls_after_shutdown_are_dropped() {
        let dispatcher = Dispatcher::new(unreachable_config(true)).unwrap();
        dispatcher.shutdown();
        assert!(!dispatcher.is_running());

        let fired = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&fired);
        dispatcher.async_del_key("k", move |_| seen.store(true, Ordering::SeqCst));
        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(dispatcher.tick(), 0);
        assert!(!fired.load(Ordering::SeqCst));
        assert!(matches!(
            dispatcher.subscribe("news", |_, _| {}),
            Err(ClientError::ShuttingDown)
        ));
        dispatcher.shutdown();
    }

    #[test]
    fn nested_tick_is_a_no_op() {
        let dispatcher = Arc::new(Dispatcher::new(unreachable_config(true)).unwrap());
        let inner = Arc::new(AtomicUsize::new(usize::MAX));
        let handle = Arc::downgrade(&dispatcher);
        let seen = Arc::clone(&inner);
        dispatcher.async_exists_key("k", move |_, _| {
            if let Some(dispatcher) = handle.upgrade() {
                seen.store(dispatcher.tick(), Ordering::SeqCst);
            }
        });

        assert!(dispatcher.wait_idle(Duration::from_secs(2)));
        assert_eq!(dispatcher.tick(), 1);
        assert_eq!(inner.load(Ordering::SeqCst), 0);
    }
}
