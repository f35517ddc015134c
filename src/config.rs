use crate::auth::Credentials;
use crate::relay::RelayConfig;
use std::time::Duration;

/// ProxyConfig holds everything the listeners need, built once at startup
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// SOCKS5 listener address
    pub socks5_listen: String,
    /// HTTP proxy listener address, None disables it
    pub http_listen: Option<String>,
    /// Users allowed in; empty means no authentication
    pub credentials: Credentials,
    /// Bound on outbound dials, DNS lookup included
    pub connect_timeout: Duration,
    pub relay: RelayConfig,
    /// Emit one access record per HTTP request
    pub access_log: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            socks5_listen: "127.0.0.1:1080".to_string(),
            http_listen: Some("127.0.0.1:8080".to_string()),
            credentials: Credentials::new(),
            connect_timeout: Duration::from_secs(10),
            relay: RelayConfig::default(),
            access_log: true,
        }
    }
}

/// ProxyConfig implementation block
impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_socks5_listen(mut self, addr: impl Into<String>) -> Self {
        self.socks5_listen = addr.into();
        self
    }

    pub fn with_http_listen(mut self, addr: Option<String>) -> Self {
        self.http_listen = addr;
        self
    }

    /// with_credentials switches SOCKS5 clients to username/password auth
    /// (or back to no auth when empty)
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_access_log(mut self, enabled: bool) -> Self {
        self.access_log = enabled;
        self
    }
}
