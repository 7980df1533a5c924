use std::collections::HashMap;
use std::thread;

use kvbridge_client::{ClientConfig, ClientError, Connection, ConnectionPool, RespValue};
use kvbridge_testkit::{init_tracing, FakeStore};

fn config_for(store: &FakeStore, password: &str) -> ClientConfig {
    ClientConfig {
        command_timeout_ms: Some(2_000),
        ..ClientConfig::new(store.host(), store.port(), password)
    }
}

fn connected(store: &FakeStore) -> Connection {
    init_tracing();
    let (conn, outcome) = Connection::open(config_for(store, ""));
    outcome.expect("connect");
    conn
}

#[test]
fn string_round_trip_then_delete() {
    let store = FakeStore::spawn();
    let mut conn = connected(&store);

    conn.set_str("k", "v").expect("set");
    assert_eq!(conn.get_str("k").expect("get"), "v");
    assert!(conn.del_key("k").expect("del"));
    assert!(!conn.exists_key("k").expect("exists"));
    assert!(matches!(conn.get_str("k"), Err(ClientError::Missing)));
}

#[test]
fn empty_password_is_accepted_without_auth() {
    let store = FakeStore::spawn();
    let (conn, outcome) = Connection::open(config_for(&store, ""));
    assert!(outcome.is_ok());
    assert!(conn.is_connected());
}

#[test]
fn password_is_checked_when_required() {
    init_tracing();
    let store = FakeStore::spawn_with_password("secret");

    let (mut good, outcome) = Connection::open(config_for(&store, "secret"));
    outcome.expect("auth");
    good.set_int("n", 7).expect("set");
    assert_eq!(good.get_int("n").expect("get"), 7);

    let (bad, outcome) = Connection::open(config_for(&store, "nope"));
    assert!(matches!(outcome, Err(ClientError::Auth { .. })));
    assert!(!bad.is_connected());
}

#[test]
fn connect_to_unreachable_port_fails() {
    init_tracing();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let mut conn = Connection::new(ClientConfig::default());
    assert!(conn.connect_to("127.0.0.1", port, "").is_err());
    assert!(matches!(conn.exists_key("k"), Err(ClientError::NotConnected)));
}

#[test]
fn mget_skips_absent_keys() {
    let store = FakeStore::spawn();
    let mut conn = connected(&store);

    conn.mset(&[("a", "1"), ("c", "3")]).expect("mset");
    let values = conn.mget(&["a", "b", "c"]).expect("mget");
    assert_eq!(values, vec!["1".to_string(), "3".to_string()]);
}

#[test]
fn numeric_getters_reject_text() {
    let store = FakeStore::spawn();
    let mut conn = connected(&store);

    conn.set_str("word", "hello").expect("set");
    assert!(matches!(conn.get_int("word"), Err(ClientError::UnexpectedResponse)));
    assert!(matches!(conn.get_int("unset"), Err(ClientError::Missing)));
    assert_eq!(conn.append("word", " world").expect("append"), 11);
}

#[test]
fn key_ttl_rename_and_type() {
    let store = FakeStore::spawn();
    let mut conn = connected(&store);

    conn.set_str("old", "v").expect("set");
    assert!(conn.expire_key("old", 60).expect("expire"));
    conn.rename_key("old", "new").expect("rename");
    assert!(conn.persist_key("new").expect("persist"));
    assert!(!conn.persist_key("new").expect("persist again"));
    assert_eq!(conn.type_key("new").expect("type"), "string");
    assert_eq!(conn.type_key("old").expect("type"), "none");
    assert!(!conn.expire_key("old", 60).expect("expire missing"));
}

#[test]
fn hash_operations() {
    let store = FakeStore::spawn();
    let mut conn = connected(&store);

    conn.hset("h", "f", "v").expect("hset");
    assert_eq!(conn.hget("h", "f").expect("hget"), "v");
    conn.hmset("h", &[("a", "1"), ("b", "2")]).expect("hmset");
    assert!(conn.hexists("h", "a").expect("hexists"));
    assert_eq!(conn.hincrby("h", "a", 5).expect("hincrby"), 6);

    let picked = conn.hmget("h", &["a", "missing", "b"]).expect("hmget");
    assert_eq!(picked.len(), 2);
    assert_eq!(picked.get("a").map(String::as_str), Some("6"));
    assert_eq!(picked.get("b").map(String::as_str), Some("2"));

    assert_eq!(conn.hdel("h", &["f", "nope"]).expect("hdel"), 1);
    let all = conn.hgetall("h").expect("hgetall");
    let expected: HashMap<String, String> = [("a", "6"), ("b", "2")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    assert_eq!(all, expected);
    assert!(matches!(conn.hget("h", "f"), Err(ClientError::Missing)));
}

#[test]
fn set_operations() {
    let store = FakeStore::spawn();
    let mut conn = connected(&store);

    assert_eq!(conn.sadd("s", &["x", "y", "x"]).expect("sadd"), 2);
    assert_eq!(conn.scard("s").expect("scard"), 2);
    assert_eq!(conn.srem("s", &["y", "z"]).expect("srem"), 1);
    assert_eq!(conn.smembers("s").expect("smembers"), vec!["x".to_string()]);
}

#[test]
fn list_operations() {
    let store = FakeStore::spawn();
    let mut conn = connected(&store);

    assert_eq!(conn.rpush("l", &["b", "c"]).expect("rpush"), 2);
    assert_eq!(conn.lpush("l", &["a"]).expect("lpush"), 3);
    assert_eq!(conn.linsert_after("l", "c", "d").expect("linsert"), 4);
    assert_eq!(conn.linsert_before("l", "a", "z").expect("linsert"), 5);
    assert_eq!(conn.lindex("l", 0).expect("lindex"), "z");
    assert_eq!(conn.llen("l").expect("llen"), 5);

    conn.lset("l", 0, "a").expect("lset");
    assert_eq!(conn.lrem("l", "a", 0).expect("lrem"), 2);
    assert_eq!(
        conn.lrange("l", 0, -1).expect("lrange"),
        vec!["b".to_string(), "c".to_string(), "d".to_string()]
    );
    conn.ltrim("l", 0, 1).expect("ltrim");
    assert_eq!(conn.rpop("l").expect("rpop"), "c");
    assert_eq!(conn.lpop("l").expect("lpop"), "b");
    assert!(matches!(conn.lpop("l"), Err(ClientError::Missing)));
}

#[test]
fn wrong_type_surfaces_server_error() {
    let store = FakeStore::spawn();
    let mut conn = connected(&store);

    conn.set_str("k", "v").expect("set");
    match conn.sadd("k", &["m"]) {
        Err(ClientError::Server { message }) => {
            assert!(String::from_utf8_lossy(&message).starts_with("WRONGTYPE"));
        }
        other => panic!("expected server error, got {:?}", other),
    }
    // A command error leaves the session usable.
    assert!(conn.is_connected());
    assert_eq!(conn.get_str("k").expect("get"), "v");
}

#[test]
fn exec_command_and_select() {
    let store = FakeStore::spawn();
    let mut conn = connected(&store);

    conn.select_index(3).expect("select");
    let reply = conn.exec_command(&["PING"]).expect("ping");
    assert_eq!(reply, RespValue::Simple(b"PONG".to_vec()));
    assert!(conn.exec_command(&["NOSUCHCMD"]).is_err());
}

#[test]
fn dropped_session_reconnects() {
    let store = FakeStore::spawn();
    let mut conn = connected(&store);
    conn.set_str("k", "v").expect("set");

    store.drop_clients();
    assert!(conn.get_str("k").is_err());
    assert!(!conn.is_connected());

    conn.reconnect().expect("reconnect");
    assert_eq!(conn.get_str("k").expect("get"), "v");

    conn.quit();
    assert!(!conn.is_connected());
}

#[test]
fn publish_reaches_subscriber() {
    let store = FakeStore::spawn();
    let mut subscriber = Connection::open(ClientConfig::new(store.host(), store.port(), "")).0;
    subscriber.subscribe("news").expect("subscribe");
    assert!(subscriber.is_subscribed());
    assert_eq!(store.subscribers("news"), 1);

    let mut publisher = connected(&store);
    assert_eq!(publisher.publish("news", "hello").expect("publish"), 1);
    let (channel, message) = subscriber.subscribe_reply().expect("reply");
    assert_eq!(channel, "news");
    assert_eq!(message, "hello");

    subscriber.unsubscribe_channel("news").expect("unsubscribe");
    assert!(!subscriber.is_subscribed());
    assert_eq!(store.subscribers("news"), 0);
}

#[test]
fn pool_reuses_live_connections() {
    let store = FakeStore::spawn();
    let pool = ConnectionPool::new(config_for(&store, ""));

    let mut conn = pool.acquire();
    conn.set_str("shared", "1").expect("set");
    pool.release(conn);

    let threads: Vec<_> = (0..4)
        .map(|idx| {
            let pool = pool.clone();
            thread::spawn(move || {
                let mut conn = pool.acquire();
                let key = format!("k{}", idx);
                conn.set_int(&key, idx).expect("set");
                let value = conn.get_int(&key).expect("get");
                pool.release(conn);
                value
            })
        })
        .collect();
    for (idx, handle) in threads.into_iter().enumerate() {
        assert_eq!(handle.join().expect("join"), idx as i64);
    }

    assert_eq!(pool.idle_len(), pool.created());
    assert_eq!(store.accepted(), pool.created());
    assert_eq!(pool.close_idle(), pool.created());
}
