//! List commands.

use std::sync::Arc;

use bytes::Bytes;
use storage::types::ListDb;
use storage::Error;

use resp::reply;

use super::{parse_i64, CommandResult};
use crate::connection::Connection;
use crate::server::Server;

fn list_db(srv: &Arc<Server>, conn: &Connection) -> Result<ListDb, Error> {
    ListDb::new(srv.storage.clone(), conn.namespace())
}

fn push(srv: &Arc<Server>, conn: &Connection, args: &[Bytes], left: bool) -> CommandResult {
    let values: Vec<&[u8]> = args[2..].iter().map(|v| v.as_ref()).collect();
    let size = list_db(srv, conn)?.push(&args[1], &values, left)?;
    Ok(reply::integer(size as i64))
}

fn pop(srv: &Arc<Server>, conn: &Connection, args: &[Bytes], left: bool) -> CommandResult {
    match list_db(srv, conn)?.pop(&args[1], left) {
        Ok(value) => Ok(reply::bulk_string(&value)),
        Err(Error::NotFound) => Ok(reply::nil_string()),
        Err(e) => Err(e),
    }
}

pub fn lpush(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    push(srv, conn, args, true)
}

pub fn rpush(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    push(srv, conn, args, false)
}

pub fn lpop(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    pop(srv, conn, args, true)
}

pub fn rpop(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    pop(srv, conn, args, false)
}

pub fn llen(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    Ok(reply::integer(list_db(srv, conn)?.size(&args[1])? as i64))
}

pub fn lindex(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let index = parse_i64(&args[2])?;
    match list_db(srv, conn)?.index(&args[1], index) {
        Ok(value) => Ok(reply::bulk_string(&value)),
        Err(Error::NotFound) => Ok(reply::nil_string()),
        Err(e) => Err(e),
    }
}

pub fn lrange(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let start = parse_i64(&args[2])?;
    let stop = parse_i64(&args[3])?;
    let values = list_db(srv, conn)?.range(&args[1], start, stop)?;
    Ok(reply::multi_bulk(
        values.iter().map(|value| Some(value.as_slice())),
    ))
}
