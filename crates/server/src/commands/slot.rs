//! Slot commands for the sharded front-end. Only meaningful with
//! `codis_enabled`, and only for administrators: the reverse index is keyed
//! on raw user keys in the default namespace.

use std::sync::Arc;

use bytes::Bytes;
use storage::slot::{slot_num_for_key, SlotIndex, HASH_SLOTS_SIZE};
use storage::{Error, DEFAULT_NAMESPACE};

use resp::reply;

use super::{parse_u64, CommandResult};
use crate::connection::Connection;
use crate::server::Server;

fn ensure_slot_access(srv: &Server, conn: &Connection) -> Result<(), Error> {
    if !srv.config.storage.codis_enabled {
        return Err(Error::NotOk("codis mode is not enabled".into()));
    }
    if !conn.is_admin() {
        return Err(Error::NotOk(
            "only administrator can use slot commands".into(),
        ));
    }
    Ok(())
}

pub fn slotsinfo(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    ensure_slot_access(srv, conn)?;
    let start = match args.get(1) {
        Some(arg) => parse_u64(arg)? as u32,
        None => 0,
    };
    let count = match args.get(2) {
        Some(arg) => parse_u64(arg)? as u32,
        None => HASH_SLOTS_SIZE,
    };
    let counts = SlotIndex::new(&srv.storage)?.get_info(start, count)?;
    let entries: Vec<Vec<u8>> = counts
        .into_iter()
        .map(|(slot_num, size)| {
            reply::array(&[
                reply::integer(i64::from(slot_num)),
                reply::integer(i64::from(size)),
            ])
        })
        .collect();
    Ok(reply::array(&entries))
}

pub fn slotshashkey(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    ensure_slot_access(srv, conn)?;
    let slots: Vec<Vec<u8>> = args[1..]
        .iter()
        .map(|key| reply::integer(i64::from(slot_num_for_key(key))))
        .collect();
    Ok(reply::array(&slots))
}

pub fn slotsscan(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    ensure_slot_access(srv, conn)?;
    let slot_num = parse_u64(&args[1])? as u32;
    let cursor = if args[2].as_ref() == b"0" {
        None
    } else {
        Some(args[2].as_ref())
    };
    let limit = match args.get(3) {
        Some(arg) => parse_u64(arg)?,
        None => 20,
    };
    let keys = match SlotIndex::new(&srv.storage)?.scan(slot_num, cursor, limit) {
        Ok(keys) => keys,
        Err(Error::NotFound) => Vec::new(),
        Err(e) => return Err(e),
    };
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

pub fn slotsdel(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    ensure_slot_access(srv, conn)?;
    let index = SlotIndex::new(&srv.storage)?;
    let mut deleted = 0;
    for arg in &args[1..] {
        let slot_num = parse_u64(arg)? as u32;
        match index.del(slot_num) {
            Ok(()) => deleted += 1,
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(reply::integer(deleted))
}

pub fn slotscheck(srv: &Arc<Server>, conn: &mut Connection, _args: &[Bytes]) -> CommandResult {
    ensure_slot_access(srv, conn)?;
    SlotIndex::new(&srv.storage)?.check(DEFAULT_NAMESPACE)?;
    Ok(reply::simple_string("OK"))
}
