use crate::address::{DialTarget, Host};
use crate::codec::ProxyReply;
use crate::protocol::{Command, ReplyCode};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::{net::TcpStream, time::timeout};
use tracing::debug;

/// DialError describes why an outbound connection could not be opened
#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },

    #[error("no addresses found for {host}")]
    NoAddresses { host: String },

    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("connect timed out after {0:?}")]
    TimedOut(Duration),
}

/// DialError implementation block
impl DialError {
    /// reply_code maps a dial failure to its SOCKS5 status
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            DialError::Resolve { .. } | DialError::NoAddresses { .. } => ReplyCode::HostUnreachable,
            DialError::TimedOut(_) => ReplyCode::TtlExpired,
            DialError::Connect(e) => match e.kind() {
                io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
                io::ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
                io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
                io::ErrorKind::PermissionDenied => ReplyCode::ConnectionNotAllowed,
                io::ErrorKind::TimedOut => ReplyCode::TtlExpired,
                _ => ReplyCode::ServerFailure,
            },
        }
    }

    /// http_status maps a dial failure to the status an HTTP proxy answers with
    pub fn http_status(&self) -> u16 {
        match self.reply_code() {
            ReplyCode::TtlExpired => 504,
            _ => 502,
        }
    }
}

/// DispatchError is a request the dispatcher answered with a failure reply
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("command {0:?} not supported")]
    CommandNotSupported(Command),

    #[error(transparent)]
    Dial(#[from] DialError),
}

impl DispatchError {
    /// reply is the failure frame sent to the client
    pub fn reply(&self) -> ProxyReply {
        let status = match self {
            DispatchError::CommandNotSupported(_) => ReplyCode::CommandNotSupported,
            DispatchError::Dial(e) => e.reply_code(),
        };
        ProxyReply::failure(status)
    }
}

/// ensure_supported answers every command other than CONNECT with COMMAND
/// NOT SUPPORTED, before the target is looked at
pub fn ensure_supported(command: Command) -> Result<(), DispatchError> {
    match command {
        Command::Connect => Ok(()),
        other => Err(DispatchError::CommandNotSupported(other)),
    }
}

/// dispatch performs the network side effect of a request. Only CONNECT is
/// served; BIND, UDP ASSOCIATE and unknown commands are answered with
/// COMMAND NOT SUPPORTED without touching the network
pub async fn dispatch(
    target: &DialTarget,
    command: Command,
    connect_timeout: Duration,
) -> Result<(TcpStream, ProxyReply), DispatchError> {
    ensure_supported(command)?;

    let outbound = dial(target, connect_timeout).await?;

    // Report the local end of the new socket, zeroed if unavailable
    let reply = match outbound.local_addr() {
        Ok(bound) => ProxyReply::new(ReplyCode::Succeeded, bound),
        Err(_) => ProxyReply::failure(ReplyCode::Succeeded),
    };

    Ok((outbound, reply))
}

/// dial opens a TCP connection to the target. Domain names are looked up
/// here, and the whole operation (lookup included) is bounded by the timeout
pub async fn dial(target: &DialTarget, connect_timeout: Duration) -> Result<TcpStream, DialError> {
    match timeout(connect_timeout, dial_inner(target)).await {
        Ok(result) => result,
        Err(_) => Err(DialError::TimedOut(connect_timeout)),
    }
}

async fn dial_inner(target: &DialTarget) -> Result<TcpStream, DialError> {
    let addrs: Vec<SocketAddr> = match &target.host {
        Host::Ip(ip) => vec![SocketAddr::new(*ip, target.port)],
        Host::Domain(name) => tokio::net::lookup_host((name.as_str(), target.port))
            .await
            .map_err(|source| DialError::Resolve {
                host: name.clone(),
                source,
            })?
            .collect(),
    };

    let mut last_err = None;

    // Try each resolved address in order
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!("connected to {target} via {addr}");
                return Ok(stream);
            }
            Err(e) => {
                debug!("connect to {addr} failed: {e}");
                last_err = Some(e);
            }
        }
    }

    match last_err {
        Some(e) => Err(DialError::Connect(e)),
        None => Err(DialError::NoAddresses {
            host: target.to_string(),
        }),
    }
}
