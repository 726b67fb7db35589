//! String commands.

use std::sync::Arc;

use bytes::Bytes;
use storage::types::StringDb;
use storage::Error;

use resp::reply;

use super::{parse_i64, CommandResult};
use crate::connection::Connection;
use crate::server::Server;

fn string_db(srv: &Arc<Server>, conn: &Connection) -> Result<StringDb, Error> {
    StringDb::new(srv.storage.clone(), conn.namespace())
}

pub fn get(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    match string_db(srv, conn)?.get(&args[1]) {
        Ok(value) => Ok(reply::bulk_string(&value)),
        Err(Error::NotFound) => Ok(reply::nil_string()),
        Err(e) => Err(e),
    }
}

pub fn set(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let mut ttl_secs = 0;
    let mut nx = false;
    let mut xx = false;
    let mut i = 3;
    while i < args.len() {
        match String::from_utf8_lossy(&args[i]).to_lowercase().as_str() {
            "ex" if i + 1 < args.len() => {
                let secs = parse_i64(&args[i + 1])?;
                if secs <= 0 {
                    return Err(Error::NotOk("invalid expire time".into()));
                }
                ttl_secs = secs as u64;
                i += 2;
            }
            "px" if i + 1 < args.len() => {
                let ms = parse_i64(&args[i + 1])?;
                if ms <= 0 {
                    return Err(Error::NotOk("invalid expire time".into()));
                }
                // second granularity on disk, round up
                ttl_secs = (ms as u64).div_ceil(1000);
                i += 2;
            }
            "nx" => {
                nx = true;
                i += 1;
            }
            "xx" => {
                xx = true;
                i += 1;
            }
            _ => return Err(Error::NotOk("syntax error".into())),
        }
    }
    if nx && xx {
        return Err(Error::NotOk("syntax error".into()));
    }
    if string_db(srv, conn)?.set_with_options(&args[1], &args[2], ttl_secs, nx, xx)? {
        Ok(reply::simple_string("OK"))
    } else {
        Ok(reply::nil_string())
    }
}

pub fn setex(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let seconds = parse_i64(&args[2])?;
    if seconds <= 0 {
        return Err(Error::NotOk("invalid expire time".into()));
    }
    string_db(srv, conn)?.setex(&args[1], &args[3], seconds as u64)?;
    Ok(reply::simple_string("OK"))
}

pub fn setnx(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let written = string_db(srv, conn)?.setnx(&args[1], &args[2])?;
    Ok(reply::integer(written as i64))
}

pub fn getset(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    match string_db(srv, conn)?.getset(&args[1], &args[2])? {
        Some(old) => Ok(reply::bulk_string(&old)),
        None => Ok(reply::nil_string()),
    }
}

pub fn mget(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let keys: Vec<&[u8]> = args[1..].iter().map(|k| k.as_ref()).collect();
    let values = string_db(srv, conn)?.mget(&keys)?;
    Ok(reply::multi_bulk(
        values.iter().map(|value| value.as_deref()),
    ))
}

pub fn mset(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    if (args.len() - 1) % 2 != 0 {
        return Err(Error::NotOk("wrong number of arguments for MSET".into()));
    }
    let pairs: Vec<(&[u8], &[u8])> = args[1..]
        .chunks_exact(2)
        .map(|pair| (pair[0].as_ref(), pair[1].as_ref()))
        .collect();
    string_db(srv, conn)?.mset(&pairs)?;
    Ok(reply::simple_string("OK"))
}

pub fn incr(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    Ok(reply::integer(string_db(srv, conn)?.incr_by(&args[1], 1)?))
}

pub fn decr(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    Ok(reply::integer(string_db(srv, conn)?.incr_by(&args[1], -1)?))
}

pub fn incrby(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let delta = parse_i64(&args[2])?;
    Ok(reply::integer(
        string_db(srv, conn)?.incr_by(&args[1], delta)?,
    ))
}

pub fn decrby(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let delta = parse_i64(&args[2])?;
    let delta = delta
        .checked_neg()
        .ok_or_else(|| Error::NotOk("increment or decrement would overflow".into()))?;
    Ok(reply::integer(
        string_db(srv, conn)?.incr_by(&args[1], delta)?,
    ))
}

pub fn strlen(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    match string_db(srv, conn)?.strlen(&args[1]) {
        Ok(len) => Ok(reply::integer(len as i64)),
        Err(Error::NotFound) => Ok(reply::integer(0)),
        Err(e) => Err(e),
    }
}

pub fn append(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let len = string_db(srv, conn)?.append(&args[1], &args[2])?;
    Ok(reply::integer(len as i64))
}
