//! Bidirectional byte relay shared by the SOCKS5 and HTTP CONNECT paths.
//!
//! Each direction runs as its own task with a fixed-size buffer. When one
//! direction ends (EOF, reset or error) it shuts down the write side of its
//! destination. A clean EOF from the client is a half-close: the response
//! keeps flowing until the upstream finishes. When the upstream side ends
//! first, or the client side fails, the other direction gets `linger` to
//! drain before it is cancelled. `relay` only returns once both directions
//! have stopped.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, split};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tracing::{Instrument, debug, trace};

/// RelayConfig tunes the relay engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Transfer buffer size per direction
    pub buffer_size: usize,
    /// How long the relay may go without traffic in either direction (zero disables it)
    pub idle_timeout: Duration,
    /// How long the client side may keep sending once the upstream side has
    /// ended (zero waits indefinitely)
    pub linger: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024,
            idle_timeout: Duration::ZERO,
            linger: Duration::from_secs(10),
        }
    }
}

/// Direction names one half of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client->upstream",
            Direction::UpstreamToClient => "upstream->client",
        }
    }
}

/// DirectionStats is what one direction of a relay achieved
#[derive(Debug, Default)]
pub struct DirectionStats {
    pub bytes: u64,
    /// Set when the direction ended on anything other than a clean EOF
    pub error: Option<io::Error>,
}

/// RelayResult summarizes a finished relay
#[derive(Debug)]
pub struct RelayResult {
    pub client_to_upstream: DirectionStats,
    pub upstream_to_client: DirectionStats,
    pub duration: Duration,
}

impl RelayResult {
    pub fn total_bytes(&self) -> u64 {
        self.client_to_upstream.bytes + self.upstream_to_client.bytes
    }
}

/// relay pumps bytes between client and upstream until both directions stop
pub async fn relay<C, U>(client: C, upstream: U, config: &RelayConfig) -> RelayResult
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let started = Instant::now();

    let (client_read, client_write) = split(client);
    let (upstream_read, upstream_write) = split(upstream);

    // Counters live outside the tasks so a cancelled direction still reports its bytes
    let sent = Arc::new(AtomicU64::new(0));
    let received = Arc::new(AtomicU64::new(0));
    let activity = Arc::new(Activity::new());

    let mut outbound = tokio::spawn(copy_half(
        client_read,
        upstream_write,
        Direction::ClientToUpstream,
        *config,
        Arc::clone(&sent),
        Arc::clone(&activity),
    )
    .in_current_span());
    let mut inbound = tokio::spawn(copy_half(
        upstream_read,
        client_write,
        Direction::UpstreamToClient,
        *config,
        Arc::clone(&received),
        Arc::clone(&activity),
    )
    .in_current_span());

    let (outbound_err, inbound_err) = tokio::select! {
        joined = &mut outbound => {
            let first = joined_error(joined);
            // Client half-closed cleanly: the response is bounded only by idle_timeout
            let linger = if first.is_none() { Duration::ZERO } else { config.linger };
            (first, drain(&mut inbound, Direction::UpstreamToClient, linger).await)
        }
        joined = &mut inbound => {
            let first = joined_error(joined);
            (drain(&mut outbound, Direction::ClientToUpstream, config.linger).await, first)
        }
    };

    RelayResult {
        client_to_upstream: DirectionStats {
            bytes: sent.load(Ordering::Relaxed),
            error: outbound_err,
        },
        upstream_to_client: DirectionStats {
            bytes: received.load(Ordering::Relaxed),
            error: inbound_err,
        },
        duration: started.elapsed(),
    }
}

/// drain waits up to `linger` for the remaining direction, cancelling it
/// after that. A zero linger waits until the direction ends by itself
async fn drain(
    task: &mut JoinHandle<io::Result<()>>,
    direction: Direction,
    linger: Duration,
) -> Option<io::Error> {
    if linger.is_zero() {
        return joined_error((&mut *task).await);
    }

    match timeout(linger, &mut *task).await {
        Ok(joined) => joined_error(joined),
        Err(_) => {
            debug!("{}: cancelled after {:?} linger", direction.label(), linger);
            task.abort();
            // Wait for the cancellation so both halves are dropped before returning
            let _ = (&mut *task).await;
            Some(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("peer direction closed, no EOF within {linger:?}"),
            ))
        }
    }
}

/// Activity records when either direction last moved bytes, so a quiet
/// direction is not timed out while the other one is busy
struct Activity {
    started: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_millis.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

fn joined_error(joined: Result<io::Result<()>, JoinError>) -> Option<io::Error> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => Some(io::Error::other(e)),
    }
}

/// copy_half copies one direction and half-closes the destination however the copy ends
async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    config: RelayConfig,
    counter: Arc<AtomicU64>,
    activity: Arc<Activity>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = pump(&mut reader, &mut writer, direction, &config, &counter, &activity).await;

    match &result {
        Ok(()) => debug!(
            "{}: EOF after {} bytes",
            direction.label(),
            counter.load(Ordering::Relaxed)
        ),
        Err(e) => debug!("{}: {}", direction.label(), e),
    }

    // Shutdown write side
    let _ = writer.shutdown().await;

    result
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    config: &RelayConfig,
    counter: &AtomicU64,
    activity: &Activity,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; config.buffer_size.max(1)];

    loop {
        let n = if config.idle_timeout.is_zero() {
            reader.read(&mut buf).await?
        } else {
            let remaining = config.idle_timeout.saturating_sub(activity.idle_for());
            match timeout(remaining, reader.read(&mut buf)).await {
                Ok(read) => read?,
                // The other direction moved bytes recently
                Err(_) if activity.idle_for() < config.idle_timeout => continue,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("idle for {:?}", config.idle_timeout),
                    ));
                }
            }
        };

        if n == 0 {
            return Ok(());
        }

        trace!("{}: {} bytes", direction.label(), n);
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}
