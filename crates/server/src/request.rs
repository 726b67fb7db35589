//! Command execution pipeline: authentication gating, command lookup, arity
//! checks, read-only enforcement, profiling sampling, slow-query accounting,
//! and monitor fan-out around every call.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rand::Rng;
use rocksdb::perf::{set_perf_stats, PerfContext, PerfStatsLevel};
use storage::{Error, DEFAULT_NAMESPACE};
use tracing::error;

use resp::reply;

use crate::connection::Connection;
use crate::perflog::PerfEntry;
use crate::server::Server;

/// Commands a loading server still answers.
fn in_command_whitelist(command: &str) -> bool {
    command == "auth"
}

/// Execute a pipeline of parsed commands, returning the concatenated replies.
/// Failures of one command turn into an error reply and processing continues
/// with the next command.
pub fn execute_commands(
    server: &Arc<Server>,
    conn: &mut Connection,
    commands: Vec<Vec<Bytes>>,
) -> Vec<u8> {
    let config = &server.config;
    let mut out = Vec::new();
    for args in commands {
        if conn.should_close() {
            break;
        }
        let Some(first) = args.first() else {
            continue;
        };
        let cmd_name = String::from_utf8_lossy(first).to_lowercase();

        if !conn.is_authenticated() {
            if !config.security.requirepass.is_empty() && cmd_name != "auth" {
                out.extend(reply::error("NOAUTH Authentication required."));
                continue;
            }
            conn.become_admin();
            conn.set_namespace(DEFAULT_NAMESPACE);
        }

        let Some(attributes) = server.lookup_command(&cmd_name) else {
            out.extend(reply::error("ERR unknown command"));
            continue;
        };
        if server.is_loading() && !in_command_whitelist(&cmd_name) {
            out.extend(reply::error("LOADING restoring the db from backup"));
            break;
        }

        let arity = attributes.arity;
        let argc = args.len() as i32;
        if (arity > 0 && argc != arity) || (arity < 0 && argc < -arity) {
            out.extend(reply::error("ERR wrong number of arguments"));
            continue;
        }
        if config.replication.slave_readonly && server.is_slave() && attributes.is_write {
            out.extend(reply::error(
                "READONLY You can't write against a read only slave.",
            ));
            continue;
        }

        conn.set_last_cmd(attributes.name);
        server.stats.incr_calls(attributes.name);
        let start = Instant::now();
        let is_profiling = turn_on_profiling_if_needed(server, attributes.name);
        server.incr_executing_command_num();
        let result = (attributes.handler)(server, conn, &args);
        server.decr_executing_command_num();
        let duration_us = start.elapsed().as_micros() as u64;
        if is_profiling {
            record_profiling_sample_if_needed(server, attributes.name, duration_us);
        }
        server.slowlog.push_entry_if_needed(&args, duration_us);
        server.stats.incr_latency(duration_us, attributes.name);
        server.feed_monitors(conn, &args);

        match result {
            Ok(bytes) => out.extend(bytes),
            Err(e) => {
                error!(command = attributes.name, "failed to execute command: {e}");
                out.extend(reply::error(&error_message(&e)));
            }
        }
    }
    out
}

/// Map an execution error onto its wire class.
pub fn error_message(e: &Error) -> String {
    match e {
        Error::WrongType => format!("WRONGTYPE {e}"),
        Error::ReadOnly => format!("READONLY {e}"),
        Error::Auth(msg) => format!("ERR {msg}"),
        Error::Protocol(msg) => format!("ERR Protocol error: {msg}"),
        _ => format!("ERR {e}"),
    }
}

fn turn_on_profiling_if_needed(server: &Server, command: &str) -> bool {
    let config = &server.config.profiling;
    if config.sample_ratio == 0 {
        return false;
    }
    if !config.sample_all_commands && !config.sample_commands.contains(command) {
        return false;
    }
    if config.sample_ratio >= 100 || rand::thread_rng().gen_range(0..100) <= config.sample_ratio {
        set_perf_stats(PerfStatsLevel::EnableTimeExceptForMutex);
        let mut context = PerfContext::default();
        context.reset();
        return true;
    }
    false
}

fn record_profiling_sample_if_needed(server: &Server, command: &str, duration_us: u64) {
    let threshold_ms = server.config.profiling.sample_record_threshold_ms;
    if threshold_ms > 0 && duration_us / 1000 < threshold_ms {
        set_perf_stats(PerfStatsLevel::Disable);
        return;
    }
    let context = PerfContext::default();
    let report = context.report(true);
    set_perf_stats(PerfStatsLevel::Disable);
    if report.is_empty() {
        // request without a db operation
        return;
    }
    server.perflog.push_entry(PerfEntry {
        cmd_name: command.to_string(),
        duration_us,
        perf_context: report,
    });
}
