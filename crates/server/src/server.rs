//! Server state and the connection front-end.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use storage::Storage;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{error, info, warn};

use resp::{reply, Tokenizer, TokenizerOptions};

use crate::commands::{CommandAttributes, CommandTable};
use crate::config::Config;
use crate::connection::Connection;
use crate::perflog::PerfLog;
use crate::request;
use crate::slowlog::SlowLog;
use crate::stats::Stats;

pub struct Server {
    pub config: Arc<Config>,
    pub storage: Arc<Storage>,
    pub stats: Stats,
    pub slowlog: SlowLog,
    pub perflog: PerfLog,
    command_table: CommandTable,
    monitors: Mutex<Vec<UnboundedSender<Vec<u8>>>>,
    executing_command_num: AtomicU64,
    loading: AtomicBool,
    slave: AtomicBool,
    start_time: SystemTime,
}

impl Server {
    pub fn new(config: Arc<Config>, storage: Arc<Storage>) -> Self {
        let slave = config.replication.master_host.is_some();
        Self {
            slowlog: SlowLog::new(config.slowlog.log_slower_than_us, config.slowlog.max_len),
            perflog: PerfLog::new(config.profiling.sample_record_max_len),
            config,
            storage,
            stats: Stats::default(),
            command_table: CommandTable::new(),
            monitors: Mutex::new(Vec::new()),
            executing_command_num: AtomicU64::new(0),
            loading: AtomicBool::new(false),
            slave: AtomicBool::new(slave),
            start_time: SystemTime::now(),
        }
    }

    pub fn lookup_command(&self, name: &str) -> Option<&CommandAttributes> {
        self.command_table.get(name)
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Relaxed)
    }

    pub fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::Relaxed);
    }

    pub fn is_slave(&self) -> bool {
        self.slave.load(Ordering::Relaxed)
    }

    pub fn set_slave(&self, slave: bool) {
        self.slave.store(slave, Ordering::Relaxed);
    }

    pub fn incr_executing_command_num(&self) {
        self.executing_command_num.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_executing_command_num(&self) {
        self.executing_command_num.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn executing_command_num(&self) -> u64 {
        self.executing_command_num.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn subscribe_monitor(&self) -> UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.monitors.lock().push(tx);
        rx
    }

    /// Fan the executed argv out to every MONITOR subscriber; dead receivers
    /// drop out on the way.
    pub fn feed_monitors(&self, conn: &Connection, args: &[Bytes]) {
        let mut monitors = self.monitors.lock();
        if monitors.is_empty() {
            return;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut line = format!(
            "+{}.{:06} [{} {}]",
            now.as_secs(),
            now.subsec_micros(),
            String::from_utf8_lossy(conn.namespace()),
            conn.addr(),
        );
        for arg in args {
            line.push_str(&format!(" \"{}\"", String::from_utf8_lossy(arg)));
        }
        line.push_str("\r\n");
        let line = line.into_bytes();
        monitors.retain(|tx| tx.send(line.clone()).is_ok());
    }

    /// Wait for in-flight commands to settle, then close the engine.
    pub fn graceful_shutdown(&self) {
        while self.executing_command_num() > 0 {
            std::thread::sleep(Duration::from_millis(10));
        }
        self.storage.close();
    }

    /// Periodic housekeeping: flip the size gate on its transitions and trim
    /// old backups.
    pub fn start_cron(self: &Arc<Self>) {
        let server = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                if let Err(e) = server.storage.check_db_size_limit() {
                    warn!("failed to check db size limit: {e}");
                }
                let backup = &server.config.backup;
                if backup.backup_max_keep_hours > 0 {
                    if let Err(e) = server
                        .storage
                        .purge_old_backups(backup.num_backups_to_keep, backup.backup_max_keep_hours)
                    {
                        warn!("failed to purge old backups: {e}");
                    }
                }
            }
        });
    }

    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.server.bind, self.config.server.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("ready to accept connections at {addr}");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(server, stream, peer.to_string()).await {
                            warn!("connection {peer} closed: {e}");
                        }
                    });
                }
                Err(e) => error!("failed to accept connection: {e}"),
            }
        }
    }
}

async fn handle_connection(
    server: Arc<Server>,
    stream: TcpStream,
    peer: String,
) -> anyhow::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut conn = Connection::new(peer);
    let mut tokenizer = Tokenizer::new(TokenizerOptions {
        unlimited_multi_bulk: server.config.storage.codis_enabled,
    });
    let mut buf = BytesMut::with_capacity(16 * 1024);

    loop {
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let tokenize_result = tokenizer.tokenize(&mut buf);
        server.stats.incr_inbound_bytes(tokenizer.take_consumed());
        if let Err(e) = tokenize_result {
            // protocol violations are fatal for the connection
            writer.write_all(&reply::error(&format!("ERR {e}"))).await?;
            return Ok(());
        }

        let commands = tokenizer.take_commands();
        if commands.is_empty() {
            continue;
        }
        let out = request::execute_commands(&server, &mut conn, commands);
        if !out.is_empty() {
            writer.write_all(&out).await?;
        }
        if conn.should_close() {
            return Ok(());
        }
        if let Some(rx) = conn.take_monitor_rx() {
            return monitor_loop(rx, writer).await;
        }
    }
}

async fn monitor_loop(
    mut rx: UnboundedReceiver<Vec<u8>>,
    mut writer: OwnedWriteHalf,
) -> anyhow::Result<()> {
    while let Some(line) = rx.recv().await {
        writer.write_all(&line).await?;
    }
    Ok(())
}
