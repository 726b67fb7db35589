//! Hash commands.

use std::sync::Arc;

use bytes::Bytes;
use storage::types::HashDb;
use storage::Error;

use resp::reply;

use super::{parse_i64, CommandResult};
use crate::connection::Connection;
use crate::server::Server;

fn hash_db(srv: &Arc<Server>, conn: &Connection) -> Result<HashDb, Error> {
    HashDb::new(srv.storage.clone(), conn.namespace())
}

fn field_value_pairs(args: &[Bytes]) -> Result<Vec<(&[u8], &[u8])>, Error> {
    if args.len() % 2 != 0 {
        return Err(Error::NotOk("wrong number of arguments".into()));
    }
    Ok(args
        .chunks_exact(2)
        .map(|pair| (pair[0].as_ref(), pair[1].as_ref()))
        .collect())
}

pub fn hget(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    match hash_db(srv, conn)?.get(&args[1], &args[2]) {
        Ok(value) => Ok(reply::bulk_string(&value)),
        Err(Error::NotFound) => Ok(reply::nil_string()),
        Err(e) => Err(e),
    }
}

pub fn hmget(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let fields: Vec<&[u8]> = args[2..].iter().map(|f| f.as_ref()).collect();
    let values = hash_db(srv, conn)?.mget(&args[1], &fields)?;
    Ok(reply::multi_bulk(
        values.iter().map(|value| value.as_deref()),
    ))
}

pub fn hset(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let pairs = field_value_pairs(&args[2..])?;
    let added = hash_db(srv, conn)?.mset(&args[1], &pairs, false)?;
    Ok(reply::integer(added as i64))
}

pub fn hsetnx(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let written = hash_db(srv, conn)?.setnx(&args[1], &args[2], &args[3])?;
    Ok(reply::integer(written as i64))
}

pub fn hmset(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let pairs = field_value_pairs(&args[2..])?;
    hash_db(srv, conn)?.mset(&args[1], &pairs, false)?;
    Ok(reply::simple_string("OK"))
}

pub fn hdel(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let fields: Vec<&[u8]> = args[2..].iter().map(|f| f.as_ref()).collect();
    let deleted = hash_db(srv, conn)?.delete(&args[1], &fields)?;
    Ok(reply::integer(deleted as i64))
}

pub fn hgetall(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let pairs = hash_db(srv, conn)?.get_all(&args[1])?;
    let mut flat = Vec::with_capacity(pairs.len() * 2);
    for (field, value) in &pairs {
        flat.push(Some(field.as_slice()));
        flat.push(Some(value.as_slice()));
    }
    Ok(reply::multi_bulk(flat))
}

pub fn hkeys(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let pairs = hash_db(srv, conn)?.get_all(&args[1])?;
    Ok(reply::multi_bulk(
        pairs.iter().map(|(field, _)| Some(field.as_slice())),
    ))
}

pub fn hvals(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let pairs = hash_db(srv, conn)?.get_all(&args[1])?;
    Ok(reply::multi_bulk(
        pairs.iter().map(|(_, value)| Some(value.as_slice())),
    ))
}

pub fn hlen(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    Ok(reply::integer(hash_db(srv, conn)?.size(&args[1])? as i64))
}

pub fn hexists(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let exists = hash_db(srv, conn)?.exists(&args[1], &args[2])?;
    Ok(reply::integer(exists as i64))
}

pub fn hincrby(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let delta = parse_i64(&args[3])?;
    let value = hash_db(srv, conn)?.incr_by(&args[1], &args[2], delta)?;
    Ok(reply::integer(value))
}
