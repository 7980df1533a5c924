//! # Connection
//!
//! Purpose: Own one live session to the store and run synchronous
//! request/reply exchanges over it.
//!
//! ## Design Principles
//! 1. **One Session or None**: `session` is `Some` only while the socket is
//!    usable. Any IO or framing failure drops it, so later calls fail fast.
//! 2. **Buffer Reuse**: Each session keeps its own line and write buffers.
//! 3. **Cooperative Pub/Sub**: The subscribed flag is shared through
//!    `SubscribeFlag`, letting another thread request cancellation while the
//!    owning thread is blocked on the next push reply.

use std::fmt;
use std::io::{BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::resp::{encode_command, read_response, RespValue};

/// Error text older stores send for AUTH when no password is configured.
const NO_PASSWORD_SET: &str = "no password is set";
/// Error text newer stores send for the same situation.
const NO_PASSWORD_CONFIGURED: &str = "without any password configured";

/// Shared "subscribed" marker for a connection in push mode.
///
/// Clearing the flag does not touch the socket; the thread that owns the
/// connection notices it after its current blocking read returns.
#[derive(Debug, Clone, Default)]
pub struct SubscribeFlag(Arc<AtomicBool>);

impl SubscribeFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Live socket plus its reusable buffers.
struct Session {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: BytesMut,
}

impl Session {
    fn exchange<A: AsRef<[u8]>>(&mut self, args: &[A]) -> ClientResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;

        self.read()
    }

    fn read(&mut self) -> ClientResult<RespValue> {
        read_response(&mut self.reader, &mut self.line_buf)
    }
}

/// One session to the store.
///
/// A connection is never used by two operations at once: it is either idle in
/// a pool, borrowed by exactly one caller or worker, or owned for life by a
/// subscription loop.
pub struct Connection {
    config: ClientConfig,
    session: Option<Session>,
    subscribed: SubscribeFlag,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("connected", &self.is_connected())
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

impl Connection {
    /// Creates a disconnected connection for `config`.
    pub fn new(config: ClientConfig) -> Self {
        Connection {
            config,
            session: None,
            subscribed: SubscribeFlag::default(),
        }
    }

    /// Creates a connection and opens its session.
    ///
    /// The connection is returned even when connecting fails; commands on it
    /// then fail with `NotConnected`.
    pub fn open(config: ClientConfig) -> (Self, ClientResult<()>) {
        let mut conn = Connection::new(config);
        let outcome = conn.connect();
        (conn, outcome)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns true while a live session exists.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Points the connection at a new endpoint and connects.
    pub fn connect_to(&mut self, host: &str, port: u16, password: &str) -> ClientResult<()> {
        self.config.host = host.to_string();
        self.config.port = port;
        self.config.password = password.to_string();
        self.connect()
    }

    /// Opens a session with the configured endpoint.
    ///
    /// Any previous session is released first. On failure no session is
    /// left behind.
    ///
    /// **Logic**:
    /// 1. Resolve and connect with the configured timeout.
    /// 2. Send AUTH with the credential. An empty credential against a store
    ///    without a password counts as success.
    /// 3. Select the configured database when it is not the default.
    pub fn connect(&mut self) -> ClientResult<()> {
        self.disconnect();
        match self.try_connect() {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(
                    host = %self.config.host,
                    port = self.config.port,
                    error = %err,
                    "connect to store failed"
                );
                self.session = None;
                Err(err)
            }
        }
    }

    fn try_connect(&mut self) -> ClientResult<()> {
        let stream = connect_stream(&self.config)?;
        let timeout = self.config.command_timeout();
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        self.session = Some(Session {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: BytesMut::with_capacity(256),
        });

        self.authenticate()?;
        if self.config.database != 0 {
            let index = self.config.database;
            self.select_index(index)?;
        }
        Ok(())
    }

    fn authenticate(&mut self) -> ClientResult<()> {
        let password = self.config.password.clone();
        match self.request(&["AUTH", password.as_str()])? {
            RespValue::Error(message) => {
                let text = String::from_utf8_lossy(&message).into_owned();
                if password.is_empty() && is_no_password_error(&text) {
                    return Ok(());
                }
                Err(ClientError::Auth { message: text })
            }
            _ => Ok(()),
        }
    }

    /// Connects only when no live session exists.
    pub fn reconnect(&mut self) -> ClientResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.connect()
    }

    /// Releases the session. Safe to call when already disconnected.
    pub fn disconnect(&mut self) {
        self.session = None;
        self.subscribed.clear();
    }

    /// Sends QUIT, then disconnects.
    pub fn quit(&mut self) {
        if self.is_connected() {
            if let Err(err) = self.request(&["QUIT"]) {
                debug!(error = %err, "quit exchange failed");
            }
        }
        self.disconnect();
    }

    /// Switches the logical database of this session.
    pub fn select_index(&mut self, index: u32) -> ClientResult<()> {
        let index = index.to_string();
        self.call(&["SELECT", index.as_str()]).map(|_| ())
    }

    /// Runs an arbitrary command; error replies become `Err`.
    pub fn exec_command<A: AsRef<[u8]>>(&mut self, args: &[A]) -> ClientResult<RespValue> {
        self.call(args)
    }

    /// Sends one command and reads its reply, error replies included.
    ///
    /// Without a session this returns `NotConnected` without touching the
    /// network. A fatal IO or framing error drops the session.
    pub fn request<A: AsRef<[u8]>>(&mut self, args: &[A]) -> ClientResult<RespValue> {
        let session = self.session.as_mut().ok_or(ClientError::NotConnected)?;
        let reply = session.exchange(args);
        if let Err(err) = &reply {
            if err.is_fatal() {
                debug!(error = %err, "dropping broken session");
                self.session = None;
            }
        }
        reply
    }

    /// Like `request`, but maps error replies to `ClientError::Server`.
    pub(crate) fn call<A: AsRef<[u8]>>(&mut self, args: &[A]) -> ClientResult<RespValue> {
        match self.request(args)? {
            RespValue::Error(message) => Err(ClientError::server(message)),
            reply => Ok(reply),
        }
    }

    /// Subscribes to `channel` and switches the connection to push mode.
    ///
    /// Ordinary commands must not be issued on this connection until it is
    /// unsubscribed. Reads on a subscribed connection have no timeout.
    pub fn subscribe(&mut self, channel: &str) -> ClientResult<()> {
        self.call(&["SUBSCRIBE", channel])?;
        if let Some(session) = self.session.as_ref() {
            session.reader.get_ref().set_read_timeout(None)?;
        }
        self.subscribed.set();
        Ok(())
    }

    /// Blocks until the next published message and returns `(channel, message)`.
    ///
    /// Push replies that are not a `message` triple come back as
    /// `UnexpectedResponse`; the caller may simply read again.
    pub fn subscribe_reply(&mut self) -> ClientResult<(String, String)> {
        let session = self.session.as_mut().ok_or(ClientError::NotConnected)?;
        let reply = match session.read() {
            Ok(reply) => reply,
            Err(err) => {
                if err.is_fatal() {
                    self.session = None;
                }
                return Err(err);
            }
        };
        parse_message(reply)
    }

    /// Sends UNSUBSCRIBE for `channel` and leaves push mode.
    pub fn unsubscribe_channel(&mut self, channel: &str) -> ClientResult<()> {
        self.subscribed.clear();
        self.call(&["UNSUBSCRIBE", channel]).map(|_| ())
    }

    /// Clears the local subscribed flag. No command is sent.
    pub fn unsubscribe(&self) {
        self.subscribed.clear();
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.is_set()
    }

    /// Returns a handle that can clear the subscribed flag from another thread.
    pub fn subscribe_flag(&self) -> SubscribeFlag {
        self.subscribed.clone()
    }
}

fn is_no_password_error(text: &str) -> bool {
    text.contains(NO_PASSWORD_SET) || text.contains(NO_PASSWORD_CONFIGURED)
}

fn parse_message(reply: RespValue) -> ClientResult<(String, String)> {
    let items = match reply {
        RespValue::Array(items) if items.len() == 3 => items,
        RespValue::Error(message) => return Err(ClientError::server(message)),
        _ => return Err(ClientError::UnexpectedResponse),
    };
    let mut items = items.into_iter();
    let kind = items.next().and_then(|item| item.as_text());
    if kind.as_deref() != Some("message") {
        return Err(ClientError::UnexpectedResponse);
    }
    match (items.next(), items.next()) {
        (Some(RespValue::Bulk(channel)), Some(RespValue::Bulk(message))) => Ok((
            String::from_utf8_lossy(&channel).into_owned(),
            String::from_utf8_lossy(&message).into_owned(),
        )),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn connect_stream(config: &ClientConfig) -> ClientResult<TcpStream> {
    let addrs = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|_| ClientError::InvalidAddress)?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout()) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.map(ClientError::Io).unwrap_or(ClientError::InvalidAddress))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(text: &str) -> RespValue {
        RespValue::Bulk(text.as_bytes().to_vec())
    }

    #[test]
    fn commands_without_session_fail_fast() {
        let mut conn = Connection::new(ClientConfig::default());
        assert!(!conn.is_connected());
        assert!(matches!(conn.request(&["PING"]), Err(ClientError::NotConnected)));
        assert!(matches!(conn.subscribe_reply(), Err(ClientError::NotConnected)));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut conn = Connection::new(ClientConfig::default());
        conn.disconnect();
        conn.disconnect();
        conn.quit();
        assert!(!conn.is_connected());
    }

    #[test]
    fn flag_is_shared_between_handles() {
        let conn = Connection::new(ClientConfig::default());
        let flag = conn.subscribe_flag();
        flag.set();
        assert!(conn.is_subscribed());
        conn.unsubscribe();
        assert!(!flag.is_set());
    }

    #[test]
    fn recognises_both_no_password_messages() {
        assert!(is_no_password_error("ERR Client sent AUTH, but no password is set"));
        assert!(is_no_password_error(
            "ERR AUTH <password> called without any password configured for the default user."
        ));
        assert!(!is_no_password_error("WRONGPASS invalid username-password pair"));
    }

    #[test]
    fn parses_message_push_reply() {
        let reply = RespValue::Array(vec![bulk("message"), bulk("news"), bulk("hello world")]);
        let (channel, message) = parse_message(reply).unwrap();
        assert_eq!(channel, "news");
        assert_eq!(message, "hello world");
    }

    #[test]
    fn rejects_non_message_push_replies() {
        let ack = RespValue::Array(vec![bulk("subscribe"), bulk("news"), RespValue::Integer(1)]);
        assert!(matches!(parse_message(ack), Err(ClientError::UnexpectedResponse)));
        let short = RespValue::Array(vec![bulk("message"), bulk("news")]);
        assert!(matches!(parse_message(short), Err(ClientError::UnexpectedResponse)));
        assert!(matches!(
            parse_message(RespValue::Simple(b"OK".to_vec())),
            Err(ClientError::UnexpectedResponse)
        ));
    }
}
