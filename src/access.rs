use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// AccessRecord describes one completed HTTP-layer request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub remote_addr: SocketAddr,
    pub method: String,
    pub proto: String,
    pub host: String,
    pub uri: String,
    pub status: u16,
    pub user_agent: String,
    pub content_length: Option<u64>,
    /// Bytes forwarded from the client to the origin
    pub bytes_sent: u64,
    /// Bytes returned from the origin to the client
    pub bytes_received: u64,
    pub elapsed: Duration,
}

impl AccessRecord {
    /// new starts a record for a peer whose request has not been parsed yet
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            method: String::new(),
            proto: String::new(),
            host: String::new(),
            uri: String::new(),
            status: 0,
            user_agent: String::new(),
            content_length: None,
            bytes_sent: 0,
            bytes_received: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// AccessLog emits access records under the `access` tracing target. It is
/// handed to the HTTP proxy at startup instead of being reached globally
#[derive(Debug, Clone, Copy)]
pub struct AccessLog {
    enabled: bool,
}

/// AccessLog implementation block
impl AccessLog {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// record writes one structured access event
    pub fn record(&self, record: &AccessRecord) {
        if !self.enabled {
            return;
        }

        info!(
            target: "access",
            remote_addr = %record.remote_addr,
            method = %record.method,
            proto = %record.proto,
            host = %record.host,
            uri = %record.uri,
            status = record.status,
            user_agent = %record.user_agent,
            content_length = record.content_length,
            bytes_sent = record.bytes_sent,
            bytes_received = record.bytes_received,
            request_time_ms = record.elapsed.as_millis() as u64,
            "{} {} {}",
            record.method,
            record.uri,
            record.status
        );
    }
}
