//! Pub/sub commands. Messages are persisted into the pubsub column family so
//! replicas pick them up through WAL tailing; connection-level subscriptions
//! live in the outer connection layer.

use std::sync::Arc;

use bytes::Bytes;
use storage::types::PubSubDb;

use resp::reply;

use super::CommandResult;
use crate::connection::Connection;
use crate::server::Server;

pub fn publish(srv: &Arc<Server>, _conn: &mut Connection, args: &[Bytes]) -> CommandResult {
    PubSubDb::new(srv.storage.clone())?.publish(&args[1], &args[2])?;
    // no in-core subscriber registry, so the receiver count is always zero
    Ok(reply::integer(0))
}
