//! Connection and administration commands.

use std::sync::Arc;

use bytes::Bytes;
use storage::types::Database;
use storage::{Error, DEFAULT_NAMESPACE};

use resp::reply;

use super::{parse_u64, CommandResult};
use crate::connection::Connection;
use crate::server::Server;

pub fn auth(srv: &Arc<Server>, conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    let password = String::from_utf8_lossy(&args[1]).to_string();
    let security = &srv.config.security;
    if security.requirepass.is_empty() && security.tokens.is_empty() {
        return Err(Error::Auth(
            "Client sent AUTH, but no password is set".into(),
        ));
    }
    if !security.requirepass.is_empty() && password == security.requirepass {
        conn.become_admin();
        conn.set_namespace(DEFAULT_NAMESPACE);
        return Ok(reply::simple_string("OK"));
    }
    if let Some(namespace) = security.tokens.get(&password) {
        conn.revoke_admin();
        conn.set_namespace(namespace.as_bytes());
        return Ok(reply::simple_string("OK"));
    }
    Err(Error::Auth("invalid password".into()))
}

pub fn quit(_srv: &Arc<Server>, conn: &mut Connection, _args: &[Bytes]) -> CommandResult {
    conn.enable_close_after_reply();
    Ok(reply::simple_string("OK"))
}

pub fn ping(_srv: &Arc<Server>, _conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    match args.len() {
        1 => Ok(reply::simple_string("PONG")),
        2 => Ok(reply::bulk_string(&args[1])),
        _ => Err(Error::NotOk("wrong number of arguments".into())),
    }
}

pub fn echo(_srv: &Arc<Server>, _conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    Ok(reply::bulk_string(&args[1]))
}

pub fn info(srv: &Arc<Server>, _conn: &mut Connection, _args: &[Bytes]) -> CommandResult {
    let mut sections = String::new();
    sections.push_str("# Server\r\n");
    sections.push_str(&format!("version:{}\r\n", env!("CARGO_PKG_VERSION")));
    sections.push_str(&format!("uptime_in_seconds:{}\r\n", srv.uptime_secs()));
    sections.push_str("\r\n# Replication\r\n");
    sections.push_str(&format!(
        "role:{}\r\n",
        if srv.is_slave() { "slave" } else { "master" }
    ));
    sections.push_str("\r\n# Stats\r\n");
    sections.push_str(&format!(
        "total_net_input_bytes:{}\r\n",
        srv.stats.inbound_bytes()
    ));
    sections.push_str(&format!(
        "total_commands_processed:{}\r\n",
        srv.stats.total_calls()
    ));
    sections.push_str("\r\n# Commandstats\r\n");
    for (name, calls, latency_us) in srv.stats.command_stats() {
        sections.push_str(&format!(
            "cmdstat_{name}:calls={calls},usec={latency_us}\r\n"
        ));
    }
    Ok(reply::bulk_string(sections.as_bytes()))
}

pub fn dbsize(srv: &Arc<Server>, conn: &mut Connection, _args: &[Bytes]) -> CommandResult {
    let db = Database::new(srv.storage.clone(), conn.namespace())?;
    Ok(reply::integer(db.keys(b"")?.len() as i64))
}

pub fn flushdb(srv: &Arc<Server>, conn: &mut Connection, _args: &[Bytes]) -> CommandResult {
    Database::new(srv.storage.clone(), conn.namespace())?.flush_db()?;
    Ok(reply::simple_string("OK"))
}

pub fn flushall(srv: &Arc<Server>, conn: &mut Connection, _args: &[Bytes]) -> CommandResult {
    if !conn.is_admin() {
        return Err(Error::NotOk(
            "only administrator can use flushall command".into(),
        ));
    }
    Database::new(srv.storage.clone(), conn.namespace())?.flush_all()?;
    Ok(reply::simple_string("OK"))
}

pub fn compact(srv: &Arc<Server>, _conn: &mut Connection, _args: &[Bytes]) -> CommandResult {
    srv.storage.compact(None, None)?;
    Ok(reply::simple_string("OK"))
}

pub fn bgsave(srv: &Arc<Server>, _conn: &mut Connection, _args: &[Bytes]) -> CommandResult {
    srv.storage.create_backup()?;
    let backup = &srv.config.backup;
    srv.storage
        .purge_old_backups(backup.num_backups_to_keep, backup.backup_max_keep_hours)?;
    Ok(reply::simple_string("OK"))
}

pub fn monitor(srv: &Arc<Server>, conn: &mut Connection, _args: &[Bytes]) -> CommandResult {
    conn.set_monitor_rx(srv.subscribe_monitor());
    Ok(reply::simple_string("OK"))
}

pub fn slowlog(srv: &Arc<Server>, _conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    match String::from_utf8_lossy(&args[1]).to_lowercase().as_str() {
        "get" => {
            let count = match args.get(2) {
                Some(arg) => parse_u64(arg)? as usize,
                None => 10,
            };
            let entries: Vec<Vec<u8>> = srv
                .slowlog
                .entries(count)
                .into_iter()
                .map(|entry| {
                    let args: Vec<Option<&[u8]>> =
                        entry.args.iter().map(|arg| Some(arg.as_slice())).collect();
                    reply::array(&[
                        reply::integer(entry.id as i64),
                        reply::integer(entry.timestamp as i64),
                        reply::integer(entry.duration_us as i64),
                        reply::multi_bulk(args),
                    ])
                })
                .collect();
            Ok(reply::array(&entries))
        }
        "reset" => {
            srv.slowlog.reset();
            Ok(reply::simple_string("OK"))
        }
        "len" => Ok(reply::integer(srv.slowlog.len() as i64)),
        _ => Err(Error::NotOk(
            "unknown SLOWLOG subcommand, try GET, RESET or LEN".into(),
        )),
    }
}

pub fn perflog(srv: &Arc<Server>, _conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    match String::from_utf8_lossy(&args[1]).to_lowercase().as_str() {
        "get" => {
            let count = match args.get(2) {
                Some(arg) => parse_u64(arg)? as usize,
                None => 10,
            };
            let entries: Vec<Vec<u8>> = srv
                .perflog
                .entries(count)
                .into_iter()
                .map(|entry| {
                    reply::array(&[
                        reply::bulk_string(entry.cmd_name.as_bytes()),
                        reply::integer(entry.duration_us as i64),
                        reply::bulk_string(entry.perf_context.as_bytes()),
                    ])
                })
                .collect();
            Ok(reply::array(&entries))
        }
        "reset" => {
            srv.perflog.reset();
            Ok(reply::simple_string("OK"))
        }
        "len" => Ok(reply::integer(srv.perflog.len() as i64)),
        _ => Err(Error::NotOk(
            "unknown PERFLOG subcommand, try GET, RESET or LEN".into(),
        )),
    }
}
