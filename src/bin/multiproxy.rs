use anyhow::{Context, Result};
use clap::Parser;
use multiproxy::{Credentials, HttpProxy, ProxyConfig, ProxyContext, RelayConfig, Socks5Server};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "A SOCKS5 and HTTP/HTTPS tunneling proxy", long_about = None)]
struct Args {
    /// SOCKS5 listener address
    #[arg(long, default_value = "127.0.0.1:1080")]
    socks5: String,

    /// HTTP proxy listener address
    #[arg(long, default_value = "127.0.0.1:8080")]
    http: String,

    /// Disable the HTTP proxy listener
    #[arg(long, action)]
    no_http: bool,

    /// Allowed SOCKS5 user as USERNAME:PASSWORD (repeatable)
    #[arg(short, long = "user", value_name = "USERNAME:PASSWORD", value_parser = Credentials::parse_entry)]
    users: Vec<(String, String)>,

    /// Outbound connect timeout in seconds, DNS included
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Relay idle timeout in seconds (0 disables it)
    #[arg(long, default_value_t = 0)]
    idle_timeout: u64,

    /// Seconds the client may keep sending after the upstream has closed (0 waits indefinitely)
    #[arg(long, default_value_t = 10)]
    linger: u64,

    /// Relay buffer size in bytes per direction
    #[arg(long, default_value_t = 8 * 1024)]
    buffer_size: usize,

    /// Disable HTTP access records
    #[arg(long, action)]
    no_access_log: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> ProxyConfig {
        let credentials: Credentials = self.users.into_iter().collect();
        let relay = RelayConfig {
            buffer_size: self.buffer_size.max(1),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            linger: Duration::from_secs(self.linger),
        };

        ProxyConfig::new()
            .with_socks5_listen(self.socks5)
            .with_http_listen((!self.no_http).then_some(self.http))
            .with_credentials(credentials)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))
            .with_relay(relay)
            .with_access_log(!self.no_access_log)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    let config = args.into_config();
    if !config.credentials.is_empty() {
        info!("Authentication enabled for {} user(s)", config.credentials.len());
    }

    let ctx = ProxyContext::new(config);

    let mut socks = Socks5Server::with_context(Arc::clone(&ctx));
    socks.bind().await?;

    let mut http = match &ctx.config.http_listen {
        Some(addr) => {
            let mut proxy = HttpProxy::with_context(addr.clone(), Arc::clone(&ctx));
            proxy.bind().await?;
            Some(proxy)
        }
        None => None,
    };

    let http_task = async {
        match http.as_mut() {
            Some(proxy) => proxy.run().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        res = socks.run() => res.context("SOCKS5 listener stopped"),
        res = http_task => res.context("HTTP listener stopped"),
        res = tokio::signal::ctrl_c() => {
            res.context("waiting for Ctrl-C")?;
            info!("shutting down with {} live sessions", ctx.registry.len());
            Ok(())
        }
    }
}
