//! Command table
//!
//! Commands are descriptors in an immutable name-keyed map: name, arity
//! (positive = exact, negative = minimum), a write marker for read-only
//! enforcement, and the handler. Parsed per-invocation state lives in the
//! handler frame, so a descriptor is shared by every connection.

mod bitmap;
mod hash;
mod key;
mod list;
mod pubsub;
mod server;
mod set;
mod slot;
mod sortedint;
mod string;
mod zset;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use storage::Error;

use crate::connection::Connection;
use crate::server::Server;

pub type CommandResult = Result<Vec<u8>, Error>;
pub type CommandHandler = fn(&Arc<Server>, &mut Connection, &[Bytes]) -> CommandResult;

pub struct CommandAttributes {
    pub name: &'static str,
    pub arity: i32,
    pub is_write: bool,
    pub handler: CommandHandler,
}

pub struct CommandTable {
    commands: HashMap<&'static str, CommandAttributes>,
}

impl CommandTable {
    pub fn new() -> Self {
        const W: bool = true;
        const R: bool = false;
        let entries: &[(&'static str, i32, bool, CommandHandler)] = &[
            // connection and administration
            ("auth", 2, R, server::auth),
            ("quit", 1, R, server::quit),
            ("ping", -1, R, server::ping),
            ("echo", 2, R, server::echo),
            ("info", -1, R, server::info),
            ("dbsize", 1, R, server::dbsize),
            ("flushdb", 1, W, server::flushdb),
            ("flushall", 1, W, server::flushall),
            ("compact", 1, R, server::compact),
            ("bgsave", 1, R, server::bgsave),
            ("monitor", 1, R, server::monitor),
            ("slowlog", -2, R, server::slowlog),
            ("perflog", -2, R, server::perflog),
            // generic key space
            ("del", -2, W, key::del),
            ("exists", -2, R, key::exists),
            ("expire", 3, W, key::expire),
            ("ttl", 2, R, key::ttl),
            ("type", 2, R, key::key_type),
            ("keys", 2, R, key::keys),
            ("scan", -2, R, key::scan),
            ("randomkey", 1, R, key::randomkey),
            // strings
            ("get", 2, R, string::get),
            ("set", -3, W, string::set),
            ("setex", 4, W, string::setex),
            ("setnx", 3, W, string::setnx),
            ("getset", 3, W, string::getset),
            ("mget", -2, R, string::mget),
            ("mset", -3, W, string::mset),
            ("incr", 2, W, string::incr),
            ("decr", 2, W, string::decr),
            ("incrby", 3, W, string::incrby),
            ("decrby", 3, W, string::decrby),
            ("strlen", 2, R, string::strlen),
            ("append", 3, W, string::append),
            // bitmaps
            ("getbit", 3, R, bitmap::getbit),
            ("setbit", 4, W, bitmap::setbit),
            ("bitcount", -2, R, bitmap::bitcount),
            ("bitpos", -3, R, bitmap::bitpos),
            // hashes
            ("hget", 3, R, hash::hget),
            ("hmget", -3, R, hash::hmget),
            ("hset", -4, W, hash::hset),
            ("hsetnx", 4, W, hash::hsetnx),
            ("hmset", -4, W, hash::hmset),
            ("hdel", -3, W, hash::hdel),
            ("hgetall", 2, R, hash::hgetall),
            ("hkeys", 2, R, hash::hkeys),
            ("hvals", 2, R, hash::hvals),
            ("hlen", 2, R, hash::hlen),
            ("hexists", 3, R, hash::hexists),
            ("hincrby", 4, W, hash::hincrby),
            // sets
            ("sadd", -3, W, set::sadd),
            ("srem", -3, W, set::srem),
            ("scard", 2, R, set::scard),
            ("sismember", 3, R, set::sismember),
            ("smembers", 2, R, set::smembers),
            // sorted sets
            ("zadd", -4, W, zset::zadd),
            ("zcard", 2, R, zset::zcard),
            ("zscore", 3, R, zset::zscore),
            ("zincrby", 4, W, zset::zincrby),
            ("zrem", -3, W, zset::zrem),
            ("zrange", -4, R, zset::zrange),
            ("zrangebyscore", -4, R, zset::zrangebyscore),
            // lists
            ("lpush", -3, W, list::lpush),
            ("rpush", -3, W, list::rpush),
            ("lpop", 2, W, list::lpop),
            ("rpop", 2, W, list::rpop),
            ("llen", 2, R, list::llen),
            ("lindex", 3, R, list::lindex),
            ("lrange", 4, R, list::lrange),
            // sorted integers
            ("siadd", -3, W, sortedint::siadd),
            ("sirem", -3, W, sortedint::sirem),
            ("sicard", 2, R, sortedint::sicard),
            // pub/sub
            ("publish", 3, W, pubsub::publish),
            // slots (sharded front-end)
            ("slotsinfo", -1, R, slot::slotsinfo),
            ("slotshashkey", -2, R, slot::slotshashkey),
            ("slotsscan", -3, R, slot::slotsscan),
            ("slotsdel", -2, W, slot::slotsdel),
            ("slotscheck", 1, R, slot::slotscheck),
        ];
        let commands = entries
            .iter()
            .map(|&(name, arity, is_write, handler)| {
                (
                    name,
                    CommandAttributes {
                        name,
                        arity,
                        is_write,
                        handler,
                    },
                )
            })
            .collect();
        Self { commands }
    }

    pub fn get(&self, name: &str) -> Option<&CommandAttributes> {
        self.commands.get(name)
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn parse_i64(arg: &[u8]) -> Result<i64, Error> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::NotOk("value is not an integer or out of range".into()))
}

pub(crate) fn parse_u64(arg: &[u8]) -> Result<u64, Error> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::NotOk("value is not an integer or out of range".into()))
}

pub(crate) fn parse_f64(arg: &[u8]) -> Result<f64, Error> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::NotOk("value is not a valid float".into()))
}

pub(crate) fn format_score(score: f64) -> String {
    format!("{score}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_lowercase_exact() {
        let table = CommandTable::new();
        assert!(table.get("get").is_some());
        assert!(table.get("GET").is_none());
        assert!(table.get("nosuch").is_none());
    }

    #[test]
    fn test_write_markers() {
        let table = CommandTable::new();
        assert!(table.get("set").map(|c| c.is_write).unwrap_or_default());
        assert!(!table.get("get").map(|c| c.is_write).unwrap_or_default());
        assert!(table.get("lpush").map(|c| c.is_write).unwrap_or_default());
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_i64(b"-12").unwrap(), -12);
        assert!(parse_i64(b"twelve").is_err());
        assert_eq!(parse_u64(b"12").unwrap(), 12);
        assert!(parse_u64(b"-1").is_err());
        assert_eq!(parse_f64(b"1.5").unwrap(), 1.5);
        assert_eq!(parse_f64(b"-inf").unwrap(), f64::NEG_INFINITY);
        assert_eq!(format_score(1.0), "1");
        assert_eq!(format_score(2.5), "2.5");
    }
}
