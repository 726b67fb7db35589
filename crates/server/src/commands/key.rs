//! Generic key-space commands.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use storage::types::Database;
use storage::Error;

use resp::reply;

use super::{parse_i64, parse_u64, CommandResult};
use crate::connection::Connection;
use crate::server::Server;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

pub fn del(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let db = Database::new(srv.storage.clone(), conn.namespace())?;
    let mut deleted = 0;
    for key in &args[1..] {
        match db.del(key) {
            Ok(()) => deleted += 1,
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(reply::integer(deleted))
}

pub fn exists(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let db = Database::new(srv.storage.clone(), conn.namespace())?;
    let keys: Vec<&[u8]> = args[1..].iter().map(|k| k.as_ref()).collect();
    Ok(reply::integer(db.exists(&keys)?))
}

pub fn expire(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let seconds = parse_i64(&args[2])?;
    // a non-positive ttl leaves a timestamp in the past, which the read path
    // treats as missing and compaction reclaims
    let timestamp = (now_secs() + seconds).max(1) as u32;
    let db = Database::new(srv.storage.clone(), conn.namespace())?;
    match db.expire(&args[1], timestamp) {
        Ok(()) => Ok(reply::integer(1)),
        Err(Error::NotFound) => Ok(reply::integer(0)),
        Err(e) => Err(e),
    }
}

pub fn ttl(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let db = Database::new(srv.storage.clone(), conn.namespace())?;
    Ok(reply::integer(db.ttl(&args[1])?))
}

pub fn key_type(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let db = Database::new(srv.storage.clone(), conn.namespace())?;
    Ok(reply::simple_string(db.key_type(&args[1])?.name()))
}

pub fn keys(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let pattern = &args[1];
    let db = Database::new(srv.storage.clone(), conn.namespace())?;
    // prefix matching only: `*` or `prefix*`, anything else is an exact key
    let keys = if pattern.ends_with(b"*") {
        db.keys(&pattern[..pattern.len() - 1])?
    } else {
        db.keys(pattern)?
            .into_iter()
            .filter(|key| key.as_slice() == pattern.as_ref())
            .collect()
    };
    Ok(reply::multi_bulk(
        keys.iter().map(|key| Some(key.as_slice())),
    ))
}

pub fn scan(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let cursor = if args[1].as_ref() == b"0" {
        None
    } else {
        Some(args[1].as_ref())
    };
    let mut limit = 20;
    let mut prefix: &[u8] = b"";
    let mut i = 2;
    while i < args.len() {
        match String::from_utf8_lossy(&args[i]).to_lowercase().as_str() {
            "count" if i + 1 < args.len() => {
                limit = parse_u64(&args[i + 1])?;
                i += 2;
            }
            "match" if i + 1 < args.len() => {
                prefix = args[i + 1].as_ref();
                i += 2;
            }
            _ => return Err(Error::NotOk("syntax error".into())),
        }
    }
    let prefix = prefix.strip_suffix(b"*").unwrap_or(prefix);

    let db = Database::new(srv.storage.clone(), conn.namespace())?;
    let keys = db.scan(cursor, limit, prefix)?;
    let next_cursor: &[u8] = if (keys.len() as u64) < limit {
        b"0"
    } else {
        keys.last().map(|key| key.as_slice()).unwrap_or(b"0")
    };
    Ok(reply::array(&[
        reply::bulk_string(next_cursor),
        reply::multi_bulk(keys.iter().map(|key| Some(key.as_slice()))),
    ]))
}

pub fn randomkey(srv: &Arc<Server>, conn: &mut Connection, _args: &[Bytes]) -> CommandResult {
    let db = Database::new(srv.storage.clone(), conn.namespace())?;
    match db.random_key(None)? {
        Some(key) => Ok(reply::bulk_string(&key)),
        None => Ok(reply::nil_string()),
    }
}
