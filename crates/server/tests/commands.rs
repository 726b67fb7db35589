//! End-to-end tests driving the command pipeline the way a connection does:
//! argv in, reply bytes out.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use sediment::config::Config;
use sediment::connection::Connection;
use sediment::request;
use sediment::server::Server;
use storage::Storage;

struct TestServer {
    server: Arc<Server>,
    dir: PathBuf,
}

impl TestServer {
    fn start() -> Self {
        Self::start_with(|_| {})
    }

    fn start_with(mutate: impl FnOnce(&mut Config)) -> Self {
        let dir = PathBuf::from(format!("/tmp/sediment_srv_{}", rand::random::<u64>()));
        let mut config = Config::default();
        config.storage.db_dir = dir.join("db");
        config.storage.backup_dir = dir.join("backup");
        config.storage.rocksdb.metadata_block_cache_size = 16 << 20;
        config.storage.rocksdb.subkey_block_cache_size = 16 << 20;
        config.storage.rocksdb.write_buffer_size = 16 << 20;
        mutate(&mut config);

        let config = Arc::new(config);
        let storage = Arc::new(Storage::new(Arc::new(config.storage.clone())));
        storage.open().unwrap();
        Self {
            server: Arc::new(Server::new(config, storage)),
            dir,
        }
    }

    fn conn(&self) -> Connection {
        Connection::new("127.0.0.1:12345")
    }

    fn exec(&self, conn: &mut Connection, parts: &[&str]) -> String {
        let args: Vec<Bytes> = parts
            .iter()
            .map(|part| Bytes::copy_from_slice(part.as_bytes()))
            .collect();
        let out = request::execute_commands(&self.server, conn, vec![args]);
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.storage.close();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[test]
fn test_authentication_gate() {
    let t = TestServer::start_with(|config| {
        config.security.requirepass = "secret".to_string();
    });
    let mut conn = t.conn();

    assert_eq!(
        t.exec(&mut conn, &["get", "foo"]),
        "-NOAUTH Authentication required.\r\n"
    );
    assert_eq!(
        t.exec(&mut conn, &["auth", "wrong"]),
        "-ERR invalid password\r\n"
    );
    assert_eq!(t.exec(&mut conn, &["auth", "secret"]), "+OK\r\n");
    assert_eq!(t.exec(&mut conn, &["get", "foo"]), "$-1\r\n");
}

#[test]
fn test_namespace_tokens_partition_the_keyspace() {
    let t = TestServer::start_with(|config| {
        config.security.requirepass = "adminpass".to_string();
        config
            .security
            .tokens
            .insert("token1".to_string(), "ns1".to_string());
    });

    let mut tenant = t.conn();
    assert_eq!(t.exec(&mut tenant, &["auth", "token1"]), "+OK\r\n");
    assert_eq!(t.exec(&mut tenant, &["set", "k", "tenant-value"]), "+OK\r\n");

    let mut admin = t.conn();
    assert_eq!(t.exec(&mut admin, &["auth", "adminpass"]), "+OK\r\n");
    // same user key, different namespace: invisible to the admin namespace
    assert_eq!(t.exec(&mut admin, &["get", "k"]), "$-1\r\n");
    assert_eq!(
        t.exec(&mut tenant, &["get", "k"]),
        "$12\r\ntenant-value\r\n"
    );
}

#[test]
fn test_type_collision() {
    let t = TestServer::start();
    let mut conn = t.conn();

    assert_eq!(t.exec(&mut conn, &["set", "x", "hello"]), "+OK\r\n");
    assert!(t.exec(&mut conn, &["lpush", "x", "a"]).starts_with("-WRONGTYPE"));
    assert_eq!(t.exec(&mut conn, &["del", "x"]), ":1\r\n");
    assert_eq!(t.exec(&mut conn, &["lpush", "x", "a"]), ":1\r\n");
}

#[test]
fn test_bitmap_segment_boundary() {
    let t = TestServer::start();
    let mut conn = t.conn();

    assert_eq!(t.exec(&mut conn, &["setbit", "b", "8191", "1"]), ":0\r\n");
    assert_eq!(t.exec(&mut conn, &["getbit", "b", "8191"]), ":1\r\n");
    assert_eq!(t.exec(&mut conn, &["bitcount", "b"]), ":1\r\n");

    assert_eq!(t.exec(&mut conn, &["setbit", "b", "8192", "1"]), ":0\r\n");
    assert_eq!(t.exec(&mut conn, &["bitcount", "b"]), ":2\r\n");

    assert_eq!(t.exec(&mut conn, &["setbit", "b", "8191", "0"]), ":1\r\n");
    assert_eq!(t.exec(&mut conn, &["getbit", "b", "8191"]), ":0\r\n");
}

#[test]
fn test_ttl_expiry_visibility() {
    let t = TestServer::start();
    let mut conn = t.conn();

    assert_eq!(t.exec(&mut conn, &["set", "k", "v"]), "+OK\r\n");
    // expire in the past: the next read must miss
    assert_eq!(t.exec(&mut conn, &["expire", "k", "-1"]), ":1\r\n");
    assert_eq!(t.exec(&mut conn, &["get", "k"]), "$-1\r\n");
    assert_eq!(t.exec(&mut conn, &["ttl", "k"]), ":-2\r\n");
    assert_eq!(t.exec(&mut conn, &["exists", "k"]), ":0\r\n");
}

#[test]
fn test_follower_read_only() {
    let t = TestServer::start();
    t.server.set_slave(true);
    let mut conn = t.conn();

    assert!(t.exec(&mut conn, &["set", "k", "v"]).starts_with("-READONLY"));
    assert_eq!(t.exec(&mut conn, &["get", "k"]), "$-1\r\n");

    t.server.set_slave(false);
    assert_eq!(t.exec(&mut conn, &["set", "k", "v"]), "+OK\r\n");
}

#[test]
fn test_unknown_command_and_arity() {
    let t = TestServer::start();
    let mut conn = t.conn();

    assert_eq!(
        t.exec(&mut conn, &["nosuchcommand"]),
        "-ERR unknown command\r\n"
    );
    assert_eq!(
        t.exec(&mut conn, &["get"]),
        "-ERR wrong number of arguments\r\n"
    );
    assert_eq!(
        t.exec(&mut conn, &["get", "a", "b"]),
        "-ERR wrong number of arguments\r\n"
    );
    // negative arity is a minimum
    assert_eq!(
        t.exec(&mut conn, &["mset", "k"]),
        "-ERR wrong number of arguments\r\n"
    );
}

#[test]
fn test_loading_state_whitelist() {
    let t = TestServer::start();
    t.server.set_loading(true);
    let mut conn = t.conn();

    assert!(t.exec(&mut conn, &["get", "k"]).starts_with("-LOADING"));

    t.server.set_loading(false);
    assert_eq!(t.exec(&mut conn, &["get", "k"]), "$-1\r\n");
}

#[test]
fn test_pipeline_replies_in_order() {
    let t = TestServer::start();
    let mut conn = t.conn();
    let commands = vec![
        vec![Bytes::from_static(b"set"), Bytes::from_static(b"a"), Bytes::from_static(b"1")],
        vec![Bytes::from_static(b"incr"), Bytes::from_static(b"a")],
        vec![Bytes::from_static(b"get"), Bytes::from_static(b"a")],
    ];
    let out = request::execute_commands(&t.server, &mut conn, commands);
    assert_eq!(String::from_utf8_lossy(&out), "+OK\r\n:2\r\n$1\r\n2\r\n");
}

#[test]
fn test_string_commands() {
    let t = TestServer::start();
    let mut conn = t.conn();

    assert_eq!(
        t.exec(&mut conn, &["mset", "a", "1", "b", "2"]),
        "+OK\r\n"
    );
    assert_eq!(
        t.exec(&mut conn, &["mget", "a", "missing", "b"]),
        "*3\r\n$1\r\n1\r\n$-1\r\n$1\r\n2\r\n"
    );
    assert_eq!(t.exec(&mut conn, &["incrby", "a", "9"]), ":10\r\n");
    assert_eq!(t.exec(&mut conn, &["decrby", "a", "3"]), ":7\r\n");
    assert_eq!(t.exec(&mut conn, &["append", "b", "34"]), ":3\r\n");
    assert_eq!(t.exec(&mut conn, &["strlen", "b"]), ":3\r\n");
    assert_eq!(t.exec(&mut conn, &["setnx", "a", "x"]), ":0\r\n");
    assert_eq!(t.exec(&mut conn, &["set", "a", "x", "xx"]), "+OK\r\n");
    assert_eq!(t.exec(&mut conn, &["set", "c", "y", "nx"]), "+OK\r\n");
    assert_eq!(t.exec(&mut conn, &["set", "c", "z", "nx"]), "$-1\r\n");
    assert_eq!(t.exec(&mut conn, &["set", "s", "abc"]), "+OK\r\n");
    assert_eq!(
        t.exec(&mut conn, &["incr", "s"]),
        "-ERR value is not an integer or out of range\r\n"
    );
}

#[test]
fn test_hash_commands() {
    let t = TestServer::start();
    let mut conn = t.conn();

    assert_eq!(
        t.exec(&mut conn, &["hset", "h", "f1", "v1", "f2", "v2"]),
        ":2\r\n"
    );
    assert_eq!(t.exec(&mut conn, &["hget", "h", "f1"]), "$2\r\nv1\r\n");
    assert_eq!(t.exec(&mut conn, &["hlen", "h"]), ":2\r\n");
    assert_eq!(t.exec(&mut conn, &["hexists", "h", "f2"]), ":1\r\n");
    assert_eq!(t.exec(&mut conn, &["hdel", "h", "f1", "nope"]), ":1\r\n");
    assert_eq!(t.exec(&mut conn, &["hincrby", "h", "n", "5"]), ":5\r\n");
    assert_eq!(t.exec(&mut conn, &["type", "h"]), "+hash\r\n");
}

#[test]
fn test_zset_commands() {
    let t = TestServer::start();
    let mut conn = t.conn();

    assert_eq!(
        t.exec(&mut conn, &["zadd", "z", "2", "b", "1", "a", "3", "c"]),
        ":3\r\n"
    );
    assert_eq!(
        t.exec(&mut conn, &["zrange", "z", "0", "-1"]),
        "*3\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n"
    );
    assert_eq!(t.exec(&mut conn, &["zscore", "z", "b"]), "$1\r\n2\r\n");
    assert_eq!(
        t.exec(&mut conn, &["zrangebyscore", "z", "(1", "+inf"]),
        "*2\r\n$1\r\nb\r\n$1\r\nc\r\n"
    );
    assert_eq!(t.exec(&mut conn, &["zrem", "z", "a", "x"]), ":1\r\n");
    assert_eq!(t.exec(&mut conn, &["zcard", "z"]), ":2\r\n");
}

#[test]
fn test_list_and_set_commands() {
    let t = TestServer::start();
    let mut conn = t.conn();

    assert_eq!(t.exec(&mut conn, &["rpush", "l", "a", "b"]), ":2\r\n");
    assert_eq!(t.exec(&mut conn, &["lpush", "l", "z"]), ":3\r\n");
    assert_eq!(
        t.exec(&mut conn, &["lrange", "l", "0", "-1"]),
        "*3\r\n$1\r\nz\r\n$1\r\na\r\n$1\r\nb\r\n"
    );
    assert_eq!(t.exec(&mut conn, &["lindex", "l", "1"]), "$1\r\na\r\n");
    assert_eq!(t.exec(&mut conn, &["lpop", "l"]), "$1\r\nz\r\n");
    assert_eq!(t.exec(&mut conn, &["llen", "l"]), ":2\r\n");

    assert_eq!(t.exec(&mut conn, &["sadd", "s", "x", "y", "x"]), ":2\r\n");
    assert_eq!(t.exec(&mut conn, &["sismember", "s", "y"]), ":1\r\n");
    assert_eq!(t.exec(&mut conn, &["scard", "s"]), ":2\r\n");
    assert_eq!(t.exec(&mut conn, &["srem", "s", "x"]), ":1\r\n");
}

#[test]
fn test_keys_scan_and_flushdb() {
    let t = TestServer::start();
    let mut conn = t.conn();

    for key in ["user:1", "user:2", "other"] {
        t.exec(&mut conn, &["set", key, "v"]);
    }
    assert_eq!(
        t.exec(&mut conn, &["keys", "user:*"]),
        "*2\r\n$6\r\nuser:1\r\n$6\r\nuser:2\r\n"
    );
    let scan = t.exec(&mut conn, &["scan", "0", "count", "2"]);
    assert!(scan.starts_with("*2\r\n"));

    assert_eq!(t.exec(&mut conn, &["dbsize"]), ":3\r\n");
    assert_eq!(t.exec(&mut conn, &["flushdb"]), "+OK\r\n");
    assert_eq!(t.exec(&mut conn, &["dbsize"]), ":0\r\n");
}

#[test]
fn test_slowlog_records_and_resets() {
    let t = TestServer::start_with(|config| {
        config.slowlog.log_slower_than_us = 0;
    });
    let mut conn = t.conn();

    t.exec(&mut conn, &["set", "k", "v"]);
    t.exec(&mut conn, &["get", "k"]);
    // the slowlog commands themselves are recorded too, so just lower-bound
    let len_reply = t.exec(&mut conn, &["slowlog", "len"]);
    let len: i64 = len_reply
        .trim_start_matches(':')
        .trim_end()
        .parse()
        .unwrap();
    assert!(len >= 2);

    let get_reply = t.exec(&mut conn, &["slowlog", "get", "1"]);
    assert!(get_reply.starts_with("*1\r\n"));

    assert_eq!(t.exec(&mut conn, &["slowlog", "reset"]), "+OK\r\n");
}

#[test]
fn test_monitor_fan_out() {
    let t = TestServer::start();
    let mut watcher = t.conn();
    assert_eq!(t.exec(&mut watcher, &["monitor"]), "+OK\r\n");
    let mut rx = watcher.take_monitor_rx().unwrap();

    let mut client = t.conn();
    t.exec(&mut client, &["set", "k", "v"]);

    let line = rx.try_recv().unwrap();
    let line = String::from_utf8_lossy(&line).to_string();
    assert!(line.contains("\"set\" \"k\" \"v\""));
}

#[test]
fn test_slot_commands() {
    let t = TestServer::start_with(|config| {
        config.storage.codis_enabled = true;
    });
    let mut conn = t.conn();

    assert_eq!(t.exec(&mut conn, &["set", "k1", "v"]), "+OK\r\n");
    assert_eq!(t.exec(&mut conn, &["set", "k2", "v"]), "+OK\r\n");
    assert_eq!(t.exec(&mut conn, &["slotscheck"]), "+OK\r\n");

    let info = t.exec(&mut conn, &["slotsinfo"]);
    assert!(info.starts_with('*'));
    let hashed = t.exec(&mut conn, &["slotshashkey", "k1"]);
    assert!(hashed.starts_with("*1\r\n:"));

    // deleting a key keeps the index consistent
    assert_eq!(t.exec(&mut conn, &["del", "k1"]), ":1\r\n");
    assert_eq!(t.exec(&mut conn, &["slotscheck"]), "+OK\r\n");
}

#[test]
fn test_slot_commands_require_codis_mode() {
    let t = TestServer::start();
    let mut conn = t.conn();
    assert_eq!(
        t.exec(&mut conn, &["slotsinfo"]),
        "-ERR codis mode is not enabled\r\n"
    );
}

#[test]
fn test_publish_persists_messages() {
    let t = TestServer::start();
    let mut conn = t.conn();

    // no in-core subscriber registry, so the receiver count is zero
    assert_eq!(t.exec(&mut conn, &["publish", "news", "hello"]), ":0\r\n");
    assert_eq!(t.exec(&mut conn, &["publish", "news:extra", "other"]), ":0\r\n");

    let pubsub = storage::types::PubSubDb::new(t.server.storage.clone()).unwrap();
    assert_eq!(pubsub.pending(b"news").unwrap(), vec![b"hello".to_vec()]);
}

#[test]
fn test_backup_commands_roundtrip() {
    let t = TestServer::start();
    let mut conn = t.conn();

    assert_eq!(t.exec(&mut conn, &["set", "k", "v"]), "+OK\r\n");
    assert_eq!(t.exec(&mut conn, &["bgsave"]), "+OK\r\n");
    assert_eq!(t.exec(&mut conn, &["set", "later", "v"]), "+OK\r\n");

    t.server.storage.restore_from_backup().unwrap();
    assert_eq!(t.exec(&mut conn, &["get", "k"]), "$1\r\nv\r\n");
    assert_eq!(t.exec(&mut conn, &["get", "later"]), "$-1\r\n");
}
