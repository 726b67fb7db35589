//! Sorted-set commands.

use std::sync::Arc;

use bytes::Bytes;
use storage::types::zset::ScoreBound;
use storage::types::ZSetDb;
use storage::Error;

use resp::reply;

use super::{format_score, parse_f64, parse_i64, CommandResult};
use crate::connection::Connection;
use crate::server::Server;

fn zset_db(srv: &Arc<Server>, conn: &Connection) -> Result<ZSetDb, Error> {
    ZSetDb::new(srv.storage.clone(), conn.namespace())
}

fn parse_bound(arg: &[u8]) -> Result<ScoreBound, Error> {
    let (digits, exclusive) = match arg.strip_prefix(b"(") {
        Some(rest) => (rest, true),
        None => (arg, false),
    };
    let value = match digits {
        b"-inf" => f64::NEG_INFINITY,
        b"+inf" | b"inf" => f64::INFINITY,
        other => parse_f64(other).map_err(|_| Error::NotOk("min or max is not a float".into()))?,
    };
    Ok(ScoreBound { value, exclusive })
}

fn entries_reply(entries: &[(Vec<u8>, f64)], withscores: bool) -> Vec<u8> {
    if !withscores {
        return reply::multi_bulk(entries.iter().map(|(member, _)| Some(member.as_slice())));
    }
    let mut out = reply::multi_len(entries.len() * 2);
    for (member, score) in entries {
        out.extend(reply::bulk_string(member));
        out.extend(reply::bulk_string(format_score(*score).as_bytes()));
    }
    out
}

fn parse_withscores(args: &[Bytes]) -> Result<bool, Error> {
    match args {
        [] => Ok(false),
        [flag] if flag.eq_ignore_ascii_case(b"withscores") => Ok(true),
        _ => Err(Error::NotOk("syntax error".into())),
    }
}

pub fn zadd(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    if args.len() % 2 != 0 {
        return Err(Error::NotOk("syntax error".into()));
    }
    let mut entries: Vec<(f64, &[u8])> = Vec::with_capacity((args.len() - 2) / 2);
    for pair in args[2..].chunks_exact(2) {
        entries.push((parse_f64(&pair[0])?, pair[1].as_ref()));
    }
    let added = zset_db(srv, conn)?.add(&args[1], &entries)?;
    Ok(reply::integer(added as i64))
}

pub fn zcard(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    Ok(reply::integer(zset_db(srv, conn)?.card(&args[1])? as i64))
}

pub fn zscore(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    match zset_db(srv, conn)?.score(&args[1], &args[2]) {
        Ok(score) => Ok(reply::bulk_string(format_score(score).as_bytes())),
        Err(Error::NotFound) => Ok(reply::nil_string()),
        Err(e) => Err(e),
    }
}

pub fn zincrby(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let delta = parse_f64(&args[2])?;
    let score = zset_db(srv, conn)?.incr_by(&args[1], &args[3], delta)?;
    Ok(reply::bulk_string(format_score(score).as_bytes()))
}

pub fn zrem(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let members: Vec<&[u8]> = args[2..].iter().map(|m| m.as_ref()).collect();
    let removed = zset_db(srv, conn)?.remove(&args[1], &members)?;
    Ok(reply::integer(removed as i64))
}

pub fn zrange(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let start = parse_i64(&args[2])?;
    let stop = parse_i64(&args[3])?;
    let withscores = parse_withscores(&args[4..])?;
    let entries = zset_db(srv, conn)?.range_by_rank(&args[1], start, stop)?;
    Ok(entries_reply(&entries, withscores))
}

pub fn zrangebyscore(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let min = parse_bound(&args[2])?;
    let max = parse_bound(&args[3])?;
    let withscores = parse_withscores(&args[4..])?;
    let entries = zset_db(srv, conn)?.range_by_score(&args[1], min, max)?;
    Ok(entries_reply(&entries, withscores))
}
