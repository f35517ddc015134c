use crate::address;
use crate::auth::{self, AuthError};
use crate::codec::{self, FrameError, ProxyReply};
use crate::commands;
use crate::protocol::{AuthMethod, ReplyCode};
use crate::registry::{SessionGuard, SessionId, SessionKind, SessionState};
use crate::relay::{self, RelayResult};
use crate::server::ProxyContext;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// SessionOutcome is how a session that ran to completion ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// The client offered no method the server accepts
    NoAcceptableMethod,
    /// Username/password sub-negotiation failed
    AuthenticationFailed,
    /// The request was answered with a failure reply
    Refused(ReplyCode),
    /// The request succeeded and the relay ran until both sides stopped
    Relayed(RelayResult),
}

/// What the request phase produced
enum Negotiated {
    Upstream(TcpStream),
    Finished(SessionOutcome),
}

/// Session drives one SOCKS5 client connection through
/// handshake -> request -> relay -> closed
pub struct Session<S> {
    stream: S,
    peer: SocketAddr,
    state: SessionState,
    guard: SessionGuard,
    ctx: Arc<ProxyContext>,
}

/// Session implementation block
impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// new registers the connection and returns a session awaiting its handshake
    pub fn new(stream: S, peer: SocketAddr, ctx: Arc<ProxyContext>) -> Self {
        let guard = ctx.registry.register(peer, SessionKind::Socks5);

        Self {
            stream,
            peer,
            state: SessionState::AwaitingHandshake,
            guard,
            ctx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.guard.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// run executes the state machine. Whatever happens, the session is
    /// deregistered and both connections are closed when this returns
    pub async fn run(mut self) -> Result<SessionOutcome> {
        let negotiated = match self.negotiate().await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                self.close().await;
                return Err(e);
            }
        };

        let upstream = match negotiated {
            Negotiated::Upstream(upstream) => upstream,
            Negotiated::Finished(outcome) => {
                self.close().await;
                return Ok(outcome);
            }
        };

        self.transition(SessionState::Relaying);

        let Session {
            stream, guard, ctx, ..
        } = self;

        let result = relay::relay(stream, upstream, &ctx.config.relay).await;

        info!(
            "connection closed: {} bytes from client, {} bytes from server in {:?}",
            result.client_to_upstream.bytes, result.upstream_to_client.bytes, result.duration
        );

        guard.set_state(SessionState::Closed);
        Ok(SessionOutcome::Relayed(result))
    }

    /// negotiate covers the AwaitingHandshake and AwaitingRequest states
    async fn negotiate(&mut self) -> Result<Negotiated> {
        let hello = codec::read_handshake(&mut self.stream)
            .await
            .context("reading handshake")?;

        let credentials = &self.ctx.config.credentials;
        let method = auth::select_auth_method(&hello.methods, credentials);

        self.stream
            .write_all(&codec::encode_handshake_reply(method))
            .await
            .context("writing method selection")?;

        match method {
            AuthMethod::NoAcceptable => {
                warn!("no acceptable authentication method offered: {:02x?}", hello.methods);
                return Ok(Negotiated::Finished(SessionOutcome::NoAcceptableMethod));
            }
            AuthMethod::UserPass => match auth::authenticate_userpass(&mut self.stream, credentials).await {
                Ok(username) => debug!("authenticated as {username}"),
                Err(AuthError::Rejected { username }) => {
                    warn!("authentication failed for {username:?}");
                    return Ok(Negotiated::Finished(SessionOutcome::AuthenticationFailed));
                }
                Err(e) => return Err(e).context("username/password sub-negotiation"),
            },
            AuthMethod::NoAuth => (),
        }

        self.transition(SessionState::AwaitingRequest);

        let request = match codec::read_request(&mut self.stream).await {
            Ok(request) => request,
            Err(FrameError::Parse(e)) => {
                warn!("rejecting request: {e}");
                return self.refuse(ProxyReply::failure(e.reply_code())).await;
            }
            Err(e) => return Err(e).context("reading request"),
        };

        if let Err(e) = commands::ensure_supported(request.command) {
            warn!("rejecting request: {e}");
            return self.refuse(e.reply()).await;
        }

        let target = match address::resolve(&request) {
            Ok(target) => target,
            Err(e) => {
                warn!("rejecting request: {e}");
                return self.refuse(ProxyReply::failure(e.reply_code())).await;
            }
        };

        self.guard.set_target(target.to_string());
        debug!("{:?} {}", request.command, target);

        match commands::dispatch(&target, request.command, self.ctx.config.connect_timeout).await {
            Ok((upstream, reply)) => {
                self.send_reply(&reply).await?;
                info!("{} -> {} established", self.peer, target);
                Ok(Negotiated::Upstream(upstream))
            }
            Err(e) => {
                warn!("{:?} {} failed: {e}", request.command, target);
                self.refuse(e.reply()).await
            }
        }
    }

    async fn refuse(&mut self, reply: ProxyReply) -> Result<Negotiated> {
        self.send_reply(&reply).await?;
        Ok(Negotiated::Finished(SessionOutcome::Refused(reply.status)))
    }

    async fn send_reply(&mut self, reply: &ProxyReply) -> Result<()> {
        self.stream
            .write_all(&codec::encode_reply(reply))
            .await
            .context("writing reply")
    }

    fn transition(&mut self, state: SessionState) {
        self.state = state;
        self.guard.set_state(state);
    }

    async fn close(&mut self) {
        self.transition(SessionState::Closed);
        let _ = self.stream.shutdown().await;
    }
}
