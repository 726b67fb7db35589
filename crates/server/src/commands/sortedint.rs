//! Sorted-integer commands.

use std::sync::Arc;

use bytes::Bytes;
use storage::types::SortedIntDb;
use storage::Error;

use resp::reply;

use super::{parse_u64, CommandResult};
use crate::connection::Connection;
use crate::server::Server;

fn sortedint_db(srv: &Arc<Server>, conn: &Connection) -> Result<SortedIntDb, Error> {
    SortedIntDb::new(srv.storage.clone(), conn.namespace())
}

fn parse_ids(args: &[Bytes]) -> Result<Vec<u64>, Error> {
    args.iter().map(|arg| parse_u64(arg)).collect()
}

pub fn siadd(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let ids = parse_ids(&args[2..])?;
    let added = sortedint_db(srv, conn)?.add(&args[1], &ids)?;
    Ok(reply::integer(added as i64))
}

pub fn sirem(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let ids = parse_ids(&args[2..])?;
    let removed = sortedint_db(srv, conn)?.remove(&args[1], &ids)?;
    Ok(reply::integer(removed as i64))
}

pub fn sicard(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    Ok(reply::integer(
        sortedint_db(srv, conn)?.card(&args[1])? as i64
    ))
}
