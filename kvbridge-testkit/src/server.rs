//! TCP front end of the fake store: one thread per connection, RESP2 arrays
//! in, RESP2 replies out. Subscribed connections share their write half with
//! publishers so pushes interleave safely with command replies.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::store::{Keyspace, Reply};

type Writer = Arc<Mutex<TcpStream>>;

struct Subscriber {
    client: u64,
    writer: Writer,
}

struct Shared {
    password: Option<String>,
    keyspace: Mutex<Keyspace>,
    channels: Mutex<HashMap<String, Vec<Subscriber>>>,
    clients: Mutex<HashMap<u64, Writer>>,
    next_client: AtomicU64,
    accepted: AtomicUsize,
}

/// Handle to a running fake store.
///
/// The accept thread lives until the process exits; every test spawns its
/// own store on an ephemeral port.
#[derive(Clone)]
pub struct FakeStore {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl FakeStore {
    /// Starts a store that requires no password.
    pub fn spawn() -> FakeStore {
        Self::start(None)
    }

    /// Starts a store that rejects commands until `AUTH password` succeeds.
    pub fn spawn_with_password(password: &str) -> FakeStore {
        Self::start(Some(password.to_string()))
    }

    fn start(password: Option<String>) -> FakeStore {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake store");
        let addr = listener.local_addr().expect("fake store address");
        let shared = Arc::new(Shared {
            password,
            keyspace: Mutex::new(Keyspace::default()),
            channels: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
            accepted: AtomicUsize::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("fake-store-accept".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { continue };
                    accept_shared.accepted.fetch_add(1, Ordering::Relaxed);
                    let shared = Arc::clone(&accept_shared);
                    thread::spawn(move || {
                        if let Err(err) = serve(&shared, stream) {
                            trace!(error = %err, "fake store connection ended");
                        }
                    });
                }
            })
            .expect("spawn fake store accept thread");

        debug!(%addr, "fake store listening");
        FakeStore { addr, shared }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::Relaxed)
    }

    /// Number of connections currently subscribed to `channel`.
    pub fn subscribers(&self, channel: &str) -> usize {
        self.shared
            .channels
            .lock()
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Polls until `channel` has at least `count` subscribers.
    pub fn wait_for_subscribers(&self, channel: &str, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.subscribers(channel) >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        self.subscribers(channel) >= count
    }

    /// Pushes `message` to every subscriber of `channel`; returns receivers.
    pub fn publish(&self, channel: &str, message: &str) -> usize {
        publish(&self.shared, channel, message)
    }

    /// Shuts down every client socket, simulating a store restart.
    pub fn drop_clients(&self) {
        let clients: Vec<Writer> = self.shared.clients.lock().drain().map(|(_, w)| w).collect();
        for writer in clients {
            let _ = writer.lock().shutdown(Shutdown::Both);
        }
    }

    /// Stores a string value without going through a client.
    pub fn seed(&self, key: &str, value: &str) {
        self.shared
            .keyspace
            .lock()
            .execute("SET", &[key.to_string(), value.to_string()]);
    }
}

fn publish(shared: &Shared, channel: &str, message: &str) -> usize {
    let push = Reply::Array(vec![
        Reply::bulk("message"),
        Reply::bulk(channel),
        Reply::bulk(message),
    ]);
    let mut buf = BytesMut::new();
    push.encode(&mut buf);

    let mut channels = shared.channels.lock();
    let Some(subscribers) = channels.get_mut(channel) else {
        return 0;
    };
    subscribers.retain(|sub| sub.writer.lock().write_all(&buf).is_ok());
    subscribers.len()
}

fn write_reply(writer: &Writer, reply: &Reply) -> io::Result<()> {
    let mut buf = BytesMut::new();
    reply.encode(&mut buf);
    let mut stream = writer.lock();
    stream.write_all(&buf)?;
    stream.flush()
}

fn serve(shared: &Shared, stream: TcpStream) -> io::Result<()> {
    let client = shared.next_client.fetch_add(1, Ordering::Relaxed);
    let writer: Writer = Arc::new(Mutex::new(stream.try_clone()?));
    shared.clients.lock().insert(client, Arc::clone(&writer));
    let mut reader = BufReader::new(stream);

    let outcome = session(shared, client, &writer, &mut reader);

    shared.clients.lock().remove(&client);
    let mut channels = shared.channels.lock();
    for subscribers in channels.values_mut() {
        subscribers.retain(|sub| sub.client != client);
    }
    outcome
}

fn session(
    shared: &Shared,
    client: u64,
    writer: &Writer,
    reader: &mut BufReader<TcpStream>,
) -> io::Result<()> {
    let mut authed = shared.password.is_none();
    let mut subscribed: Vec<String> = Vec::new();

    while let Some(args) = read_command(reader)? {
        let Some((name, rest)) = args.split_first() else {
            continue;
        };
        let name = name.to_ascii_uppercase();
        let reply = match name.as_str() {
            "AUTH" => match (&shared.password, rest) {
                (_, []) => Reply::Error("ERR wrong number of arguments for 'auth' command".into()),
                (None, _) => Reply::Error("ERR Client sent AUTH, but no password is set".into()),
                (Some(expected), [given]) if given == expected => {
                    authed = true;
                    Reply::Status("OK")
                }
                (Some(_), _) => Reply::Error("WRONGPASS invalid username-password pair".into()),
            },
            "QUIT" => {
                write_reply(writer, &Reply::Status("OK"))?;
                return Ok(());
            }
            _ if !authed => Reply::Error("NOAUTH Authentication required.".into()),
            "PING" => Reply::Status("PONG"),
            "SELECT" => match rest {
                [index] if index.parse::<u32>().is_ok() => Reply::Status("OK"),
                _ => Reply::Error("ERR invalid DB index".into()),
            },
            "SUBSCRIBE" => {
                for channel in rest {
                    if !subscribed.contains(channel) {
                        subscribed.push(channel.clone());
                        shared
                            .channels
                            .lock()
                            .entry(channel.clone())
                            .or_default()
                            .push(Subscriber {
                                client,
                                writer: Arc::clone(writer),
                            });
                    }
                    write_reply(
                        writer,
                        &Reply::Array(vec![
                            Reply::bulk("subscribe"),
                            Reply::bulk(channel.clone()),
                            Reply::Integer(subscribed.len() as i64),
                        ]),
                    )?;
                }
                continue;
            }
            "UNSUBSCRIBE" => {
                let targets: Vec<String> = if rest.is_empty() {
                    subscribed.clone()
                } else {
                    rest.to_vec()
                };
                for channel in targets {
                    subscribed.retain(|c| c != &channel);
                    if let Some(subs) = shared.channels.lock().get_mut(&channel) {
                        subs.retain(|sub| sub.client != client);
                    }
                    write_reply(
                        writer,
                        &Reply::Array(vec![
                            Reply::bulk("unsubscribe"),
                            Reply::bulk(channel),
                            Reply::Integer(subscribed.len() as i64),
                        ]),
                    )?;
                }
                continue;
            }
            "PUBLISH" => match rest {
                [channel, message] => Reply::Integer(publish(shared, channel, message) as i64),
                _ => Reply::Error("ERR wrong number of arguments for 'publish' command".into()),
            },
            _ => shared.keyspace.lock().execute(&name, rest),
        };
        write_reply(writer, &reply)?;
    }
    Ok(())
}

/// Reads one RESP2 array of bulk strings. Returns `None` on clean EOF.
fn read_command<R: BufRead>(reader: &mut R) -> io::Result<Option<Vec<String>>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let header = line.trim_end();
    let count: usize = header
        .strip_prefix('*')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| invalid("expected array header"))?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line)?;
        let len: usize = line
            .trim_end()
            .strip_prefix('$')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| invalid("expected bulk header"))?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data)?;
        data.truncate(len);
        args.push(String::from_utf8(data).map_err(|_| invalid("non-utf8 argument"))?);
    }
    Ok(Some(args))
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_bulk_array_commands() {
        let mut input = Cursor::new(b"*2\r\n$3\r\nGET\r\n$5\r\na b\r\n\r\n".to_vec());
        let args = read_command(&mut input).unwrap().unwrap();
        assert_eq!(args, vec!["GET".to_string(), "a b\r\n".to_string()]);
        assert!(read_command(&mut input).unwrap().is_none());
    }

    #[test]
    fn rejects_inline_commands() {
        let mut input = Cursor::new(b"PING\r\n".to_vec());
        assert!(read_command(&mut input).is_err());
    }
}
