//! Per-connection state owned by the worker driving the socket.

use tokio::sync::mpsc::UnboundedReceiver;

pub struct Connection {
    addr: String,
    /// Empty until the connection authenticates (or the server runs without
    /// a password and the first command promotes it to admin).
    namespace: Vec<u8>,
    admin: bool,
    close_after_reply: bool,
    last_cmd: String,
    monitor_rx: Option<UnboundedReceiver<Vec<u8>>>,
}

impl Connection {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            namespace: Vec::new(),
            admin: false,
            close_after_reply: false,
            last_cmd: String::new(),
            monitor_rx: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_authenticated(&self) -> bool {
        !self.namespace.is_empty()
    }

    pub fn namespace(&self) -> &[u8] {
        &self.namespace
    }

    pub fn set_namespace(&mut self, namespace: &[u8]) {
        self.namespace = namespace.to_vec();
    }

    pub fn become_admin(&mut self) {
        self.admin = true;
    }

    pub fn revoke_admin(&mut self) {
        self.admin = false;
    }

    pub fn is_admin(&self) -> bool {
        self.admin
    }

    pub fn enable_close_after_reply(&mut self) {
        self.close_after_reply = true;
    }

    pub fn should_close(&self) -> bool {
        self.close_after_reply
    }

    pub fn set_last_cmd(&mut self, cmd: &str) {
        self.last_cmd = cmd.to_string();
    }

    pub fn last_cmd(&self) -> &str {
        &self.last_cmd
    }

    pub fn set_monitor_rx(&mut self, rx: UnboundedReceiver<Vec<u8>>) {
        self.monitor_rx = Some(rx);
    }

    pub fn take_monitor_rx(&mut self) -> Option<UnboundedReceiver<Vec<u8>>> {
        self.monitor_rx.take()
    }
}
