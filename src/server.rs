use crate::{
    access::AccessLog,
    config::ProxyConfig,
    registry::ConnectionRegistry,
    session::{Session, SessionOutcome},
};
use anyhow::{Context, Result, bail};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Pause after a failed accept before trying again
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// ProxyContext is the state shared by every listener and session:
/// configuration, the connection registry and the access log
#[derive(Debug)]
pub struct ProxyContext {
    pub config: ProxyConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub access_log: AccessLog,
}

impl ProxyContext {
    pub fn new(config: ProxyConfig) -> Arc<Self> {
        let access_log = AccessLog::new(config.access_log);
        Arc::new(Self {
            config,
            registry: ConnectionRegistry::new(),
            access_log,
        })
    }
}

/// Socks5Server represents a SOCKS5 server and houses related
/// configuration data
pub struct Socks5Server {
    pub listen_addr: String,
    ctx: Arc<ProxyContext>,
    listener: Option<TcpListener>,
}

/// Socks5Server implementation block
impl Socks5Server {
    /// new is a constructor for the Socks5Server type
    pub fn new(config: ProxyConfig) -> Self {
        Self::with_context(ProxyContext::new(config))
    }

    /// with_context builds a server sharing state with other listeners
    pub fn with_context(ctx: Arc<ProxyContext>) -> Self {
        Self {
            listen_addr: ctx.config.socks5_listen.clone(),
            ctx,
            listener: None,
        }
    }

    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    /// bind to the listen address and return the address actually bound
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("SOCKS5 listener already bound");
        }

        // Instantiate tokio listener
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .with_context(|| format!("binding SOCKS5 listener on {}", self.listen_addr))?;
        let addr = listener.local_addr()?;

        info!("SOCKS5 proxy listening on {addr}");

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run handles server spinup and listens for incoming connections
    pub async fn run(&mut self) -> Result<()> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => {
                self.bind().await?;
                self.listener.take().context("SOCKS5 listener missing after bind")?
            }
        };

        // Listen for connections to proxy
        loop {
            // Accept incoming connection
            let (inbound, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Transient (e.g. out of file descriptors); keep serving
                    warn!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let session = Session::new(inbound, peer_addr, Arc::clone(&self.ctx));
            let span = info_span!("socks5", id = %session.id(), peer = %peer_addr);
            let registry = Arc::clone(&self.ctx.registry);

            // Spawn async task
            tokio::spawn(
                async move {
                    debug!("new client, {} live sessions", registry.len());

                    match session.run().await {
                        Ok(SessionOutcome::Relayed(_)) => (),
                        Ok(outcome) => debug!("session ended: {outcome:?}"),
                        Err(e) => error!("connection error: {e:#}"),
                    }

                    debug!("{} live sessions", registry.len());
                }
                .instrument(span),
            );
        }
    }
}
