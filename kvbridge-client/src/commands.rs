//! # Store Commands
//!
//! Purpose: Typed wrappers over `Connection::call` for the key, string, set,
//! hash, list and publish commands.
//!
//! ## Reply Mapping
//! - Error replies become `ClientError::Server`.
//! - Integer replies map to counts, or to `bool` (non-zero) for checks.
//! - Numeric getters accept both integer and bulk-string replies.
//! - Array replies keep only present elements; nil entries are skipped.
//! - Flattened pair arrays are folded two elements at a time into a map.

use std::collections::HashMap;

use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use crate::resp::RespValue;

impl Connection {
    // ---- Keys -------------------------------------------------------------

    /// Returns true when `key` exists.
    pub fn exists_key(&mut self, key: &str) -> ClientResult<bool> {
        self.call(&["EXISTS", key]).and_then(expect_flag)
    }

    /// Sets a time-to-live in seconds. Returns true when the TTL was set.
    pub fn expire_key(&mut self, key: &str, seconds: i64) -> ClientResult<bool> {
        let seconds = IntArg::new(seconds);
        self.call(&["EXPIRE", key, seconds.as_str()]).and_then(expect_flag)
    }

    /// Removes the time-to-live. Returns true when one was removed.
    pub fn persist_key(&mut self, key: &str) -> ClientResult<bool> {
        self.call(&["PERSIST", key]).and_then(expect_flag)
    }

    pub fn rename_key(&mut self, current: &str, new_key: &str) -> ClientResult<()> {
        self.call(&["RENAME", current, new_key]).map(|_| ())
    }

    /// Deletes a key. Returns true when a key was removed.
    pub fn del_key(&mut self, key: &str) -> ClientResult<bool> {
        self.call(&["DEL", key]).and_then(expect_flag)
    }

    /// Returns the type name of a key (`none`, `string`, `list`, ...).
    pub fn type_key(&mut self, key: &str) -> ClientResult<String> {
        match self.call(&["TYPE", key])? {
            RespValue::Simple(name) => Ok(String::from_utf8_lossy(&name).into_owned()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    // ---- Strings ----------------------------------------------------------

    pub fn mset(&mut self, pairs: &[(&str, &str)]) -> ClientResult<()> {
        let mut args = Vec::with_capacity(1 + pairs.len() * 2);
        args.push("MSET");
        for &(key, value) in pairs {
            args.push(key);
            args.push(value);
        }
        self.call(&args).map(|_| ())
    }

    /// Fetches several keys. Missing keys are skipped, not padded.
    pub fn mget(&mut self, keys: &[&str]) -> ClientResult<Vec<String>> {
        let mut args = Vec::with_capacity(1 + keys.len());
        args.push("MGET");
        args.extend_from_slice(keys);
        self.call(&args).and_then(expect_list)
    }

    pub fn set_int(&mut self, key: &str, value: i64) -> ClientResult<()> {
        let value = IntArg::new(value);
        self.call(&["SET", key, value.as_str()]).map(|_| ())
    }

    /// Reads a numeric value stored under `key`.
    pub fn get_int(&mut self, key: &str) -> ClientResult<i64> {
        self.call(&["GET", key]).and_then(expect_number)
    }

    pub fn set_str(&mut self, key: &str, value: &str) -> ClientResult<()> {
        self.call(&["SET", key, value]).map(|_| ())
    }

    pub fn get_str(&mut self, key: &str) -> ClientResult<String> {
        self.call(&["GET", key]).and_then(expect_text)
    }

    /// Appends to a string. Returns the new length.
    pub fn append(&mut self, key: &str, value: &str) -> ClientResult<i64> {
        self.call(&["APPEND", key, value]).and_then(expect_integer)
    }

    // ---- Sets -------------------------------------------------------------

    /// Adds members. Returns how many were new.
    pub fn sadd(&mut self, key: &str, members: &[&str]) -> ClientResult<i64> {
        self.call(&keyed("SADD", key, members)).and_then(expect_integer)
    }

    pub fn scard(&mut self, key: &str) -> ClientResult<i64> {
        self.call(&["SCARD", key]).and_then(expect_integer)
    }

    /// Removes members. Returns how many were present.
    pub fn srem(&mut self, key: &str, members: &[&str]) -> ClientResult<i64> {
        self.call(&keyed("SREM", key, members)).and_then(expect_integer)
    }

    pub fn smembers(&mut self, key: &str) -> ClientResult<Vec<String>> {
        self.call(&["SMEMBERS", key]).and_then(expect_list)
    }

    // ---- Hashes -----------------------------------------------------------

    pub fn hset(&mut self, key: &str, field: &str, value: &str) -> ClientResult<()> {
        self.call(&["HSET", key, field, value]).map(|_| ())
    }

    pub fn hget(&mut self, key: &str, field: &str) -> ClientResult<String> {
        self.call(&["HGET", key, field]).and_then(expect_text)
    }

    /// Increments a hash field. Returns the value after the increment.
    pub fn hincrby(&mut self, key: &str, field: &str, increment: i64) -> ClientResult<i64> {
        let increment = IntArg::new(increment);
        self.call(&["HINCRBY", key, field, increment.as_str()])
            .and_then(expect_integer)
    }

    pub fn hmset(&mut self, key: &str, pairs: &[(&str, &str)]) -> ClientResult<()> {
        let mut args = Vec::with_capacity(2 + pairs.len() * 2);
        args.push("HMSET");
        args.push(key);
        for &(field, value) in pairs {
            args.push(field);
            args.push(value);
        }
        self.call(&args).map(|_| ())
    }

    /// Deletes fields. Returns how many were removed.
    pub fn hdel(&mut self, key: &str, fields: &[&str]) -> ClientResult<i64> {
        self.call(&keyed("HDEL", key, fields)).and_then(expect_integer)
    }

    pub fn hexists(&mut self, key: &str, field: &str) -> ClientResult<bool> {
        self.call(&["HEXISTS", key, field]).and_then(expect_flag)
    }

    /// Fetches several fields. Only fields with a value appear in the map.
    pub fn hmget(&mut self, key: &str, fields: &[&str]) -> ClientResult<HashMap<String, String>> {
        let items = match self.call(&keyed("HMGET", key, fields))? {
            RespValue::Array(items) => items,
            _ => return Err(ClientError::UnexpectedResponse),
        };
        let mut map = HashMap::with_capacity(items.len());
        for (field, item) in fields.iter().zip(items) {
            if let Some(value) = item.as_text() {
                map.insert((*field).to_string(), value);
            }
        }
        Ok(map)
    }

    pub fn hgetall(&mut self, key: &str) -> ClientResult<HashMap<String, String>> {
        self.call(&["HGETALL", key]).and_then(expect_pairs)
    }

    // ---- Lists ------------------------------------------------------------

    pub fn lindex(&mut self, key: &str, index: i64) -> ClientResult<String> {
        let index = IntArg::new(index);
        self.call(&["LINDEX", key, index.as_str()]).and_then(expect_text)
    }

    /// Inserts before `pivot`. Returns the new length, or -1 without a pivot.
    pub fn linsert_before(&mut self, key: &str, pivot: &str, value: &str) -> ClientResult<i64> {
        self.call(&["LINSERT", key, "BEFORE", pivot, value])
            .and_then(expect_integer)
    }

    /// Inserts after `pivot`. Returns the new length, or -1 without a pivot.
    pub fn linsert_after(&mut self, key: &str, pivot: &str, value: &str) -> ClientResult<i64> {
        self.call(&["LINSERT", key, "AFTER", pivot, value])
            .and_then(expect_integer)
    }

    pub fn llen(&mut self, key: &str) -> ClientResult<i64> {
        self.call(&["LLEN", key]).and_then(expect_number)
    }

    pub fn lpop(&mut self, key: &str) -> ClientResult<String> {
        self.call(&["LPOP", key]).and_then(expect_text)
    }

    pub fn rpop(&mut self, key: &str) -> ClientResult<String> {
        self.call(&["RPOP", key]).and_then(expect_text)
    }

    /// Pushes values at the head. Returns the new length.
    pub fn lpush(&mut self, key: &str, values: &[&str]) -> ClientResult<i64> {
        self.call(&keyed("LPUSH", key, values)).and_then(expect_integer)
    }

    /// Pushes values at the tail. Returns the new length.
    pub fn rpush(&mut self, key: &str, values: &[&str]) -> ClientResult<i64> {
        self.call(&keyed("RPUSH", key, values)).and_then(expect_integer)
    }

    pub fn lrange(&mut self, key: &str, start: i64, stop: i64) -> ClientResult<Vec<String>> {
        let start = IntArg::new(start);
        let stop = IntArg::new(stop);
        self.call(&["LRANGE", key, start.as_str(), stop.as_str()])
            .and_then(expect_list)
    }

    /// Removes up to `count` occurrences of `value` (0 removes all).
    pub fn lrem(&mut self, key: &str, value: &str, count: i64) -> ClientResult<i64> {
        let count = IntArg::new(count);
        self.call(&["LREM", key, count.as_str(), value])
            .and_then(expect_integer)
    }

    pub fn lset(&mut self, key: &str, index: i64, value: &str) -> ClientResult<()> {
        let index = IntArg::new(index);
        self.call(&["LSET", key, index.as_str(), value]).map(|_| ())
    }

    pub fn ltrim(&mut self, key: &str, start: i64, stop: i64) -> ClientResult<()> {
        let start = IntArg::new(start);
        let stop = IntArg::new(stop);
        self.call(&["LTRIM", key, start.as_str(), stop.as_str()])
            .map(|_| ())
    }

    // ---- Pub/Sub ----------------------------------------------------------

    /// Publishes a message. Returns how many subscribers received it.
    pub fn publish(&mut self, channel: &str, message: &str) -> ClientResult<i64> {
        self.call(&["PUBLISH", channel, message]).and_then(expect_integer)
    }
}

fn keyed<'a>(command: &'a str, key: &'a str, rest: &[&'a str]) -> Vec<&'a str> {
    let mut args = Vec::with_capacity(2 + rest.len());
    args.push(command);
    args.push(key);
    args.extend_from_slice(rest);
    args
}

fn expect_integer(reply: RespValue) -> ClientResult<i64> {
    match reply {
        RespValue::Integer(value) => Ok(value),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn expect_flag(reply: RespValue) -> ClientResult<bool> {
    expect_integer(reply).map(|value| value != 0)
}

fn expect_number(reply: RespValue) -> ClientResult<i64> {
    match reply {
        RespValue::Integer(value) => Ok(value),
        RespValue::Bulk(data) => std::str::from_utf8(&data)
            .ok()
            .and_then(|text| text.trim().parse().ok())
            .ok_or(ClientError::UnexpectedResponse),
        RespValue::Nil => Err(ClientError::Missing),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn expect_text(reply: RespValue) -> ClientResult<String> {
    match reply {
        RespValue::Bulk(data) => Ok(String::from_utf8_lossy(&data).into_owned()),
        RespValue::Nil => Err(ClientError::Missing),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn expect_list(reply: RespValue) -> ClientResult<Vec<String>> {
    match reply {
        RespValue::Array(items) => Ok(items.iter().filter_map(RespValue::as_text).collect()),
        RespValue::Nil => Ok(Vec::new()),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn expect_pairs(reply: RespValue) -> ClientResult<HashMap<String, String>> {
    let items = match reply {
        RespValue::Array(items) => items,
        RespValue::Nil => return Ok(HashMap::new()),
        _ => return Err(ClientError::UnexpectedResponse),
    };
    let mut map = HashMap::with_capacity(items.len() / 2);
    for pair in items.chunks_exact(2) {
        if let (Some(field), Some(value)) = (pair[0].as_text(), pair[1].as_text()) {
            map.insert(field, value);
        }
    }
    Ok(map)
}

/// Integer argument formatted on the stack.
struct IntArg {
    buf: [u8; 20],
    len: usize,
}

impl IntArg {
    fn new(value: i64) -> Self {
        let mut buf = [0u8; 20];
        let mut len = 0;
        let mut magnitude = value.unsigned_abs();
        if magnitude == 0 {
            buf[0] = b'0';
            len = 1;
        }
        while magnitude > 0 {
            buf[len] = b'0' + (magnitude % 10) as u8;
            magnitude /= 10;
            len += 1;
        }
        if value < 0 {
            buf[len] = b'-';
            len += 1;
        }
        buf[..len].reverse();
        IntArg { buf, len }
    }

    fn as_str(&self) -> &str {
        // Only ASCII digits and '-' are ever written.
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or("0")
    }
}
