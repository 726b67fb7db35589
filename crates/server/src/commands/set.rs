//! Set commands.

use std::sync::Arc;

use bytes::Bytes;
use storage::types::SetDb;
use storage::Error;

use resp::reply;

use super::CommandResult;
use crate::connection::Connection;
use crate::server::Server;

fn set_db(srv: &Arc<Server>, conn: &Connection) -> Result<SetDb, Error> {
    SetDb::new(srv.storage.clone(), conn.namespace())
}

pub fn sadd(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let members: Vec<&[u8]> = args[2..].iter().map(|m| m.as_ref()).collect();
    let added = set_db(srv, conn)?.add(&args[1], &members)?;
    Ok(reply::integer(added as i64))
}

pub fn srem(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let members: Vec<&[u8]> = args[2..].iter().map(|m| m.as_ref()).collect();
    let removed = set_db(srv, conn)?.remove(&args[1], &members)?;
    Ok(reply::integer(removed as i64))
}

pub fn scard(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    Ok(reply::integer(set_db(srv, conn)?.card(&args[1])? as i64))
}

pub fn sismember(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let member = set_db(srv, conn)?.is_member(&args[1], &args[2])?;
    Ok(reply::integer(member as i64))
}

pub fn smembers(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let members = set_db(srv, conn)?.members(&args[1])?;
    Ok(reply::multi_bulk(
        members.iter().map(|member| Some(member.as_slice())),
    ))
}
