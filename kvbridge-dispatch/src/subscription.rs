//! # Subscription Loop
//!
//! Purpose: Stream published messages for one channel from a dedicated
//! connection into a relay queue drained on the consumer context.
//!
//! ## Design Principles
//! 1. **Dedicated Connection**: The loop owns its connection for life; it is
//!    never pooled because it blocks until the next push reply.
//! 2. **Cooperative Cancellation**: `unsubscribe` only clears a flag. The loop
//!    observes it after its current blocking read returns, then sends the
//!    store-side UNSUBSCRIBE and closes the connection.
//! 3. **No Lost Messages**: Every message read before cancellation is
//!    observed is relayed and later delivered to the handler of its run.
//! 4. **One Live Run**: A channel is not re-subscribed until the previous
//!    loop has closed its connection, so the store never pushes a message
//!    to two loops at once.
//!
//! ## State Machine
//! `Unsubscribed -> Subscribing -> Active -> Unsubscribing -> Unsubscribed`

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use kvbridge_client::{ClientConfig, ClientError, ClientResult, Connection, SubscribeFlag};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::queue::MpscQueue;

/// Handler invoked on the consumer context with `(channel, message)`.
pub type MessageFn = Box<dyn FnMut(&str, &str) + Send>;

/// Lifecycle of one subscription run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Active,
    Unsubscribing,
}

impl SubscriptionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SubscriptionState::Subscribing,
            2 => SubscriptionState::Active,
            3 => SubscriptionState::Unsubscribing,
            _ => SubscriptionState::Unsubscribed,
        }
    }
}

#[derive(Debug, Default)]
struct StateCell(AtomicU8);

impl StateCell {
    fn get(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: SubscriptionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: SubscriptionState, to: SubscriptionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

type Relay = MpscQueue<(String, String)>;

/// Relay plus handler, detached from the registry so delivery runs unlocked.
#[derive(Clone)]
pub(crate) struct Delivery {
    relay: Arc<Relay>,
    handler: Arc<Mutex<MessageFn>>,
}

impl Delivery {
    // Nobody writes to the relay any more and it is empty.
    fn is_spent(&self) -> bool {
        Arc::strong_count(&self.relay) == 1 && self.relay.is_empty()
    }

    /// Invokes the handler for every relayed message. Returns the count.
    pub(crate) fn run(&self) -> usize {
        let ready = self.relay.take_all();
        if ready.is_empty() {
            return 0;
        }
        let count = ready.len();
        let mut guard = self.handler.lock();
        let handler = &mut *guard;
        for (channel, message) in ready {
            handler(&channel, &message);
        }
        count
    }
}

/// One channel subscription and its background loop.
pub struct Subscription {
    channel: String,
    config: ClientConfig,
    relay: Arc<Relay>,
    handler: Arc<Mutex<MessageFn>>,
    // Relays of earlier runs, paired with the handler of their run.
    retired: Vec<Delivery>,
    // Each run gets a fresh flag and state so a late-exiting loop cannot
    // clobber a newer run.
    flag: Option<SubscribeFlag>,
    state: Arc<StateCell>,
}

impl Subscription {
    /// Creates an idle subscription for `config`.
    ///
    /// Subscription connections never use a command timeout.
    pub fn new(config: ClientConfig, handler: MessageFn) -> Self {
        let config = ClientConfig {
            command_timeout_ms: None,
            ..config
        };
        Subscription {
            channel: String::new(),
            config,
            relay: Arc::new(MpscQueue::new()),
            handler: Arc::new(Mutex::new(handler)),
            retired: Vec::new(),
            flag: None,
            state: Arc::new(StateCell::default()),
        }
    }

    /// Current channel, empty when not subscribed.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> SubscriptionState {
        self.state.get()
    }

    /// Replaces the message handler for the next run.
    ///
    /// Messages relayed by earlier runs, and anything a still-running loop
    /// relays later, keep going to the handler they were read under.
    pub fn set_handler(&mut self, handler: MessageFn) {
        let previous = Delivery {
            relay: std::mem::replace(&mut self.relay, Arc::new(MpscQueue::new())),
            handler: std::mem::replace(&mut self.handler, Arc::new(Mutex::new(handler))),
        };
        if !previous.is_spent() {
            self.retired.push(previous);
        }
    }

    /// Subscribes to `channel` on a fresh connection and starts the loop.
    ///
    /// A no-op while a run is active. Fails with `SubscriptionClosing` while
    /// a cancelled loop is still parked on its connection. A channel whose
    /// loop already exited (connection lost) is released first.
    pub fn subscribe(&mut self, channel: &str) -> ClientResult<()> {
        match self.state() {
            SubscriptionState::Unsubscribed => {}
            SubscriptionState::Unsubscribing => {
                debug!(channel, "previous loop still closing");
                return Err(ClientError::SubscriptionClosing);
            }
            SubscriptionState::Subscribing | SubscriptionState::Active => {
                debug!(current = %self.channel, requested = channel, "already subscribed");
                return Ok(());
            }
        }
        self.flag = None;
        self.channel.clear();

        let state = Arc::new(StateCell::default());
        state.set(SubscriptionState::Subscribing);
        self.state = Arc::clone(&state);

        let conn = match self.open(channel) {
            Ok(conn) => conn,
            Err(err) => {
                state.set(SubscriptionState::Unsubscribed);
                return Err(err);
            }
        };

        let flag = conn.subscribe_flag();
        let relay = Arc::clone(&self.relay);
        let loop_state = Arc::clone(&state);
        let loop_channel = channel.to_string();
        state.set(SubscriptionState::Active);
        let spawned = thread::Builder::new()
            .name(format!("kvbridge-sub-{}", channel))
            .spawn(move || run_loop(conn, loop_channel, relay, loop_state));
        if let Err(err) = spawned {
            // The closure, and with it the connection, was dropped.
            state.set(SubscriptionState::Unsubscribed);
            return Err(err.into());
        }

        info!(channel, "subscribed");
        self.channel = channel.to_string();
        self.flag = Some(flag);
        Ok(())
    }

    fn open(&self, channel: &str) -> ClientResult<Connection> {
        let (mut conn, outcome) = Connection::open(self.config.clone());
        outcome?;
        conn.subscribe(channel)?;
        Ok(conn)
    }

    /// Requests cancellation. Returns false when nothing was subscribed.
    ///
    /// Messages the loop reads before it notices the request are still
    /// relayed and delivered by the drain.
    pub fn unsubscribe(&mut self) -> bool {
        match self.flag.take() {
            Some(flag) => {
                flag.clear();
                self.state
                    .transition(SubscriptionState::Active, SubscriptionState::Unsubscribing);
                info!(channel = %self.channel, "unsubscribe requested");
                self.channel.clear();
                true
            }
            None => false,
        }
    }

    /// Number of relayed messages waiting for delivery.
    pub fn pending(&self) -> usize {
        self.relay.len() + self.retired.iter().map(|old| old.relay.len()).sum::<usize>()
    }

    /// Delivers relayed messages on the calling thread, oldest run first.
    pub fn deliver(&mut self) -> usize {
        self.deliveries().iter().map(Delivery::run).sum()
    }

    /// Snapshot of every relay with its handler, oldest run first. Retired
    /// runs that are drained and whose loop has exited are dropped here.
    pub(crate) fn deliveries(&mut self) -> Vec<Delivery> {
        self.retired.retain(|old| !old.is_spent());
        let mut all = self.retired.clone();
        all.push(Delivery {
            relay: Arc::clone(&self.relay),
            handler: Arc::clone(&self.handler),
        });
        all
    }
}

fn run_loop(mut conn: Connection, channel: String, relay: Arc<Relay>, state: Arc<StateCell>) {
    while conn.is_subscribed() {
        match conn.subscribe_reply() {
            Ok(pair) => relay.push(pair),
            Err(err) if !conn.is_connected() => {
                warn!(channel = %channel, error = %err, "subscription connection lost");
                break;
            }
            Err(err) => debug!(channel = %channel, error = %err, "skipping push reply"),
        }
    }

    state.set(SubscriptionState::Unsubscribing);
    if conn.is_connected() {
        if let Err(err) = conn.unsubscribe_channel(&channel) {
            debug!(channel = %channel, error = %err, "unsubscribe exchange failed");
        }
    }
    conn.quit();
    state.set(SubscriptionState::Unsubscribed);
    info!(channel = %channel, "subscription loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn closed_port_config() -> ClientConfig {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        ClientConfig {
            connect_timeout_ms: 100,
            command_timeout_ms: Some(50),
            ..ClientConfig::new("127.0.0.1", port, "")
        }
    }

    #[test]
    fn strips_command_timeout() {
        let sub = Subscription::new(closed_port_config(), Box::new(|_: &str, _: &str| {}));
        assert_eq!(sub.config.command_timeout_ms, None);
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
    }

    #[test]
    fn failed_connect_leaves_it_unsubscribed() {
        let mut sub = Subscription::new(closed_port_config(), Box::new(|_: &str, _: &str| {}));
        assert!(sub.subscribe("news").is_err());
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
        assert!(sub.channel().is_empty());
        assert!(!sub.unsubscribe());
    }

    #[test]
    fn delivery_drains_relay_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut sub = Subscription::new(
            closed_port_config(),
            Box::new(move |channel: &str, message: &str| {
                sink.lock().push(format!("{}:{}", channel, message));
            }),
        );
        sub.relay.push(("a".into(), "1".into()));
        sub.relay.push(("a".into(), "2".into()));

        assert_eq!(sub.pending(), 2);
        assert_eq!(sub.deliver(), 2);
        assert_eq!(sub.deliver(), 0);
        assert_eq!(*seen.lock(), vec!["a:1".to_string(), "a:2".to_string()]);
    }

    #[test]
    fn replaced_handler_only_sees_its_own_run() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&seen);
        let mut sub = Subscription::new(
            closed_port_config(),
            Box::new(move |_: &str, message: &str| first.lock().push(format!("old:{}", message))),
        );
        sub.relay.push(("a".into(), "1".into()));

        let second = Arc::clone(&seen);
        sub.set_handler(Box::new(move |_: &str, message: &str| {
            second.lock().push(format!("new:{}", message));
        }));
        sub.relay.push(("a".into(), "2".into()));

        assert_eq!(sub.pending(), 2);
        assert_eq!(sub.deliver(), 2);
        assert_eq!(*seen.lock(), vec!["old:1".to_string(), "new:2".to_string()]);
        assert_eq!(sub.deliveries().len(), 1);
    }

    #[test]
    fn idle_handler_swap_retires_nothing() {
        let mut sub = Subscription::new(closed_port_config(), Box::new(|_: &str, _: &str| {}));
        sub.set_handler(Box::new(|_: &str, _: &str| {}));
        assert!(sub.retired.is_empty());
    }
}
