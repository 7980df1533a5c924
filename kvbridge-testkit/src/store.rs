//! In-memory data model and command evaluation for the fake store.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use bytes::{BufMut, BytesMut};

/// Reply produced by a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(&'static str),
    Error(String),
    Integer(i64),
    Bulk(String),
    Nil,
    Array(Vec<Reply>),
}

impl Reply {
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Reply::Status(text) => {
                out.put_u8(b'+');
                out.put_slice(text.as_bytes());
                out.put_slice(b"\r\n");
            }
            Reply::Error(text) => {
                out.put_u8(b'-');
                out.put_slice(text.as_bytes());
                out.put_slice(b"\r\n");
            }
            Reply::Integer(value) => {
                out.put_u8(b':');
                out.put_slice(value.to_string().as_bytes());
                out.put_slice(b"\r\n");
            }
            Reply::Bulk(text) => {
                out.put_u8(b'$');
                out.put_slice(text.len().to_string().as_bytes());
                out.put_slice(b"\r\n");
                out.put_slice(text.as_bytes());
                out.put_slice(b"\r\n");
            }
            Reply::Nil => out.put_slice(b"$-1\r\n"),
            Reply::Array(items) => {
                out.put_u8(b'*');
                out.put_slice(items.len().to_string().as_bytes());
                out.put_slice(b"\r\n");
                for item in items {
                    item.encode(out);
                }
            }
        }
    }

    pub fn bulk(text: impl Into<String>) -> Reply {
        Reply::Bulk(text.into())
    }

    fn ok() -> Reply {
        Reply::Status("OK")
    }

    fn wrong_type() -> Reply {
        Reply::Error("WRONGTYPE Operation against a key holding the wrong kind of value".into())
    }

    fn syntax() -> Reply {
        Reply::Error("ERR syntax error".into())
    }

    fn arity(name: &str) -> Reply {
        Reply::Error(format!(
            "ERR wrong number of arguments for '{}' command",
            name.to_ascii_lowercase()
        ))
    }

    fn not_integer() -> Reply {
        Reply::Error("ERR value is not an integer or out of range".into())
    }
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
    List(VecDeque<String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
            Value::List(_) => "list",
        }
    }
}

/// Keyspace of the fake store.
#[derive(Debug, Default)]
pub struct Keyspace {
    data: HashMap<String, Value>,
    volatile: HashSet<String>,
}

fn parse_int(text: &str) -> Option<i64> {
    text.parse().ok()
}

/// Resolves a possibly negative list index against `len`.
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let index = if index < 0 { len + index } else { index };
    if index < 0 || index >= len {
        None
    } else {
        Some(index as usize)
    }
}

/// Clamps an inclusive `[start, stop]` range the way LRANGE does.
fn resolve_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len {
        stop = len - 1;
    }
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

macro_rules! typed {
    ($self:ident, $key:expr, $variant:ident, $ctor:expr) => {{
        let entry = $self
            .data
            .entry($key.to_string())
            .or_insert_with(|| Value::$variant($ctor));
        match entry {
            Value::$variant(inner) => inner,
            _ => return Reply::wrong_type(),
        }
    }};
}

macro_rules! existing {
    ($self:ident, $key:expr, $variant:ident, $missing:expr) => {{
        match $self.data.get_mut($key) {
            Some(Value::$variant(inner)) => inner,
            Some(_) => return Reply::wrong_type(),
            None => return $missing,
        }
    }};
}

impl Keyspace {
    /// Evaluates one data command. `args[0]` is the upper-cased name.
    pub fn execute(&mut self, name: &str, args: &[String]) -> Reply {
        let reply = self.dispatch(name, args);
        self.drop_empty();
        reply
    }

    fn drop_empty(&mut self) {
        let volatile = &mut self.volatile;
        self.data.retain(|key, value| {
            let keep = match value {
                Value::Str(_) => true,
                Value::Hash(map) => !map.is_empty(),
                Value::Set(set) => !set.is_empty(),
                Value::List(list) => !list.is_empty(),
            };
            if !keep {
                volatile.remove(key);
            }
            keep
        });
    }

    fn dispatch(&mut self, name: &str, args: &[String]) -> Reply {
        let argc = args.len();
        match (name, argc) {
            ("EXISTS", n) if n >= 1 => {
                Reply::Integer(args.iter().filter(|key| self.data.contains_key(*key)).count() as i64)
            }
            ("EXPIRE", 2) => {
                if parse_int(&args[1]).is_none() {
                    return Reply::not_integer();
                }
                if self.data.contains_key(&args[0]) {
                    self.volatile.insert(args[0].clone());
                    Reply::Integer(1)
                } else {
                    Reply::Integer(0)
                }
            }
            ("PERSIST", 1) => Reply::Integer(self.volatile.remove(&args[0]) as i64),
            ("RENAME", 2) => match self.data.remove(&args[0]) {
                Some(value) => {
                    let was_volatile = self.volatile.remove(&args[0]);
                    self.volatile.remove(&args[1]);
                    if was_volatile {
                        self.volatile.insert(args[1].clone());
                    }
                    self.data.insert(args[1].clone(), value);
                    Reply::ok()
                }
                None => Reply::Error("ERR no such key".into()),
            },
            ("DEL", n) if n >= 1 => {
                let mut removed = 0;
                for key in args {
                    if self.data.remove(key).is_some() {
                        removed += 1;
                    }
                    self.volatile.remove(key);
                }
                Reply::Integer(removed)
            }
            ("TYPE", 1) => match self.data.get(&args[0]) {
                Some(value) => Reply::Status(value.type_name()),
                None => Reply::Status("none"),
            },
            ("SET", 2) => {
                self.volatile.remove(&args[0]);
                self.data.insert(args[0].clone(), Value::Str(args[1].clone()));
                Reply::ok()
            }
            ("GET", 1) => match self.data.get(&args[0]) {
                Some(Value::Str(text)) => Reply::bulk(text.clone()),
                Some(_) => Reply::wrong_type(),
                None => Reply::Nil,
            },
            ("MSET", n) if n >= 2 && n % 2 == 0 => {
                for pair in args.chunks_exact(2) {
                    self.volatile.remove(&pair[0]);
                    self.data.insert(pair[0].clone(), Value::Str(pair[1].clone()));
                }
                Reply::ok()
            }
            ("MGET", n) if n >= 1 => Reply::Array(
                args.iter()
                    .map(|key| match self.data.get(key) {
                        Some(Value::Str(text)) => Reply::bulk(text.clone()),
                        _ => Reply::Nil,
                    })
                    .collect(),
            ),
            ("APPEND", 2) => {
                let text = typed!(self, &args[0], Str, String::new());
                text.push_str(&args[1]);
                Reply::Integer(text.len() as i64)
            }
            ("SADD", n) if n >= 2 => {
                let set = typed!(self, &args[0], Set, BTreeSet::new());
                let added = args[1..].iter().filter(|m| set.insert((*m).clone())).count();
                Reply::Integer(added as i64)
            }
            ("SREM", n) if n >= 2 => {
                let set = existing!(self, &args[0], Set, Reply::Integer(0));
                let removed = args[1..].iter().filter(|m| set.remove(*m)).count();
                Reply::Integer(removed as i64)
            }
            ("SCARD", 1) => {
                let set = existing!(self, &args[0], Set, Reply::Integer(0));
                Reply::Integer(set.len() as i64)
            }
            ("SMEMBERS", 1) => {
                let set = existing!(self, &args[0], Set, Reply::Array(Vec::new()));
                Reply::Array(set.iter().cloned().map(Reply::Bulk).collect())
            }
            ("HSET", n) if n >= 3 && n % 2 == 1 => {
                let hash = typed!(self, &args[0], Hash, HashMap::new());
                let mut created = 0;
                for pair in args[1..].chunks_exact(2) {
                    if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
                        created += 1;
                    }
                }
                Reply::Integer(created)
            }
            ("HMSET", n) if n >= 3 && n % 2 == 1 => {
                let hash = typed!(self, &args[0], Hash, HashMap::new());
                for pair in args[1..].chunks_exact(2) {
                    hash.insert(pair[0].clone(), pair[1].clone());
                }
                Reply::ok()
            }
            ("HGET", 2) => {
                let hash = existing!(self, &args[0], Hash, Reply::Nil);
                hash.get(&args[1]).cloned().map(Reply::Bulk).unwrap_or(Reply::Nil)
            }
            ("HEXISTS", 2) => {
                let hash = existing!(self, &args[0], Hash, Reply::Integer(0));
                Reply::Integer(hash.contains_key(&args[1]) as i64)
            }
            ("HDEL", n) if n >= 2 => {
                let hash = existing!(self, &args[0], Hash, Reply::Integer(0));
                let removed = args[1..].iter().filter(|f| hash.remove(*f).is_some()).count();
                Reply::Integer(removed as i64)
            }
            ("HINCRBY", 3) => {
                let increment = match parse_int(&args[2]) {
                    Some(value) => value,
                    None => return Reply::not_integer(),
                };
                let hash = typed!(self, &args[0], Hash, HashMap::new());
                let current = match hash.get(&args[1]) {
                    Some(text) => match parse_int(text) {
                        Some(value) => value,
                        None => return Reply::Error("ERR hash value is not an integer".into()),
                    },
                    None => 0,
                };
                let next = current + increment;
                hash.insert(args[1].clone(), next.to_string());
                Reply::Integer(next)
            }
            ("HMGET", n) if n >= 2 => match self.data.get(&args[0]) {
                Some(Value::Hash(hash)) => Reply::Array(
                    args[1..]
                        .iter()
                        .map(|f| hash.get(f).cloned().map(Reply::Bulk).unwrap_or(Reply::Nil))
                        .collect(),
                ),
                Some(_) => Reply::wrong_type(),
                None => Reply::Array(args[1..].iter().map(|_| Reply::Nil).collect()),
            },
            ("HGETALL", 1) => {
                let hash = existing!(self, &args[0], Hash, Reply::Array(Vec::new()));
                let mut fields: Vec<_> = hash.iter().collect();
                fields.sort();
                Reply::Array(
                    fields
                        .into_iter()
                        .flat_map(|(f, v)| [Reply::bulk(f.clone()), Reply::bulk(v.clone())])
                        .collect(),
                )
            }
            ("LPUSH", n) | ("RPUSH", n) if n >= 2 => {
                let head = name == "LPUSH";
                let list = typed!(self, &args[0], List, VecDeque::new());
                for value in &args[1..] {
                    if head {
                        list.push_front(value.clone());
                    } else {
                        list.push_back(value.clone());
                    }
                }
                Reply::Integer(list.len() as i64)
            }
            ("LPOP", 1) => {
                let list = existing!(self, &args[0], List, Reply::Nil);
                list.pop_front().map(Reply::Bulk).unwrap_or(Reply::Nil)
            }
            ("RPOP", 1) => {
                let list = existing!(self, &args[0], List, Reply::Nil);
                list.pop_back().map(Reply::Bulk).unwrap_or(Reply::Nil)
            }
            ("LLEN", 1) => {
                let list = existing!(self, &args[0], List, Reply::Integer(0));
                Reply::Integer(list.len() as i64)
            }
            ("LINDEX", 2) => {
                let index = match parse_int(&args[1]) {
                    Some(value) => value,
                    None => return Reply::not_integer(),
                };
                let list = existing!(self, &args[0], List, Reply::Nil);
                resolve_index(index, list.len())
                    .map(|idx| Reply::bulk(list[idx].clone()))
                    .unwrap_or(Reply::Nil)
            }
            ("LRANGE", 3) => {
                let (start, stop) = match (parse_int(&args[1]), parse_int(&args[2])) {
                    (Some(start), Some(stop)) => (start, stop),
                    _ => return Reply::not_integer(),
                };
                let list = existing!(self, &args[0], List, Reply::Array(Vec::new()));
                match resolve_range(start, stop, list.len()) {
                    Some((from, to)) => Reply::Array(
                        list.range(from..=to).cloned().map(Reply::Bulk).collect(),
                    ),
                    None => Reply::Array(Vec::new()),
                }
            }
            ("LINSERT", 4) => {
                let before = match args[1].to_ascii_uppercase().as_str() {
                    "BEFORE" => true,
                    "AFTER" => false,
                    _ => return Reply::syntax(),
                };
                let list = existing!(self, &args[0], List, Reply::Integer(0));
                match list.iter().position(|item| item == &args[2]) {
                    Some(pos) => {
                        let at = if before { pos } else { pos + 1 };
                        list.insert(at, args[3].clone());
                        Reply::Integer(list.len() as i64)
                    }
                    None => Reply::Integer(-1),
                }
            }
            ("LREM", 3) => {
                let count = match parse_int(&args[1]) {
                    Some(value) => value,
                    None => return Reply::not_integer(),
                };
                let list = existing!(self, &args[0], List, Reply::Integer(0));
                let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() as usize };
                let mut removed = 0usize;
                if count >= 0 {
                    let mut idx = 0;
                    while idx < list.len() && removed < limit {
                        if list[idx] == args[2] {
                            list.remove(idx);
                            removed += 1;
                        } else {
                            idx += 1;
                        }
                    }
                } else {
                    let mut idx = list.len();
                    while idx > 0 && removed < limit {
                        idx -= 1;
                        if list[idx] == args[2] {
                            list.remove(idx);
                            removed += 1;
                        }
                    }
                }
                Reply::Integer(removed as i64)
            }
            ("LSET", 3) => {
                let index = match parse_int(&args[1]) {
                    Some(value) => value,
                    None => return Reply::not_integer(),
                };
                let list = existing!(self, &args[0], List, Reply::Error("ERR no such key".into()));
                match resolve_index(index, list.len()) {
                    Some(idx) => {
                        list[idx] = args[2].clone();
                        Reply::ok()
                    }
                    None => Reply::Error("ERR index out of range".into()),
                }
            }
            ("LTRIM", 3) => {
                let (start, stop) = match (parse_int(&args[1]), parse_int(&args[2])) {
                    (Some(start), Some(stop)) => (start, stop),
                    _ => return Reply::not_integer(),
                };
                let list = existing!(self, &args[0], List, Reply::ok());
                match resolve_range(start, stop, list.len()) {
                    Some((from, to)) => {
                        list.truncate(to + 1);
                        list.drain(..from);
                    }
                    None => list.clear(),
                }
                Reply::ok()
            }
            (
                "EXISTS" | "EXPIRE" | "PERSIST" | "RENAME" | "DEL" | "TYPE" | "SET" | "GET"
                | "MSET" | "MGET" | "APPEND" | "SADD" | "SREM" | "SCARD" | "SMEMBERS" | "HSET"
                | "HMSET" | "HGET" | "HEXISTS" | "HDEL" | "HINCRBY" | "HMGET" | "HGETALL"
                | "LPUSH" | "RPUSH" | "LPOP" | "RPOP" | "LLEN" | "LINDEX" | "LRANGE" | "LINSERT"
                | "LREM" | "LSET" | "LTRIM",
                _,
            ) => Reply::arity(name),
            _ => Reply::Error(format!("ERR unknown command '{}'", name)),
        }
    }
}
