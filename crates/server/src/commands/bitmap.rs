//! Bitmap commands.

use std::sync::Arc;

use bytes::Bytes;
use storage::types::BitmapDb;
use storage::Error;

use resp::reply;

use super::{parse_i64, CommandResult};
use crate::connection::Connection;
use crate::server::Server;

fn bitmap_db(srv: &Arc<Server>, conn: &Connection) -> Result<BitmapDb, Error> {
    BitmapDb::new(srv.storage.clone(), conn.namespace())
}

fn parse_offset(arg: &[u8]) -> Result<u32, Error> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::NotOk("bit offset is not an integer or out of range".into()))
}

pub fn getbit(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let offset = parse_offset(&args[2])?;
    let bit = bitmap_db(srv, conn)?.get_bit(&args[1], offset)?;
    Ok(reply::integer(bit as i64))
}

pub fn setbit(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let offset = parse_offset(&args[2])?;
    let bit = match args[3].as_ref() {
        b"0" => false,
        b"1" => true,
        _ => return Err(Error::NotOk("bit is not an integer or out of range".into())),
    };
    let old_bit = bitmap_db(srv, conn)?.set_bit(&args[1], offset, bit)?;
    Ok(reply::integer(old_bit as i64))
}

pub fn bitcount(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let (start, stop) = match args.len() {
        2 => (0, -1),
        4 => (parse_i64(&args[2])?, parse_i64(&args[3])?),
        _ => return Err(Error::NotOk("syntax error".into())),
    };
    let count = bitmap_db(srv, conn)?.bit_count(&args[1], start, stop)?;
    Ok(reply::integer(count as i64))
}

pub fn bitpos(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let bit = match args[2].as_ref() {
        b"0" => false,
        b"1" => true,
        _ => return Err(Error::NotOk("bit is not an integer or out of range".into())),
    };
    let (start, stop) = match args.len() {
        3 => (0, None),
        4 => (parse_i64(&args[3])?, None),
        5 => (parse_i64(&args[3])?, Some(parse_i64(&args[4])?)),
        _ => return Err(Error::NotOk("syntax error".into())),
    };
    let pos = bitmap_db(srv, conn)?.bit_pos(&args[1], bit, start, stop)?;
    Ok(reply::integer(pos))
}
