use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::upstream::BoxedStream;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by one tunnel session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// client -> upstream
    pub from_client: u64,
    /// upstream -> client
    pub from_upstream: u64,
    pub idle_timed_out: bool,
}

/// Relay one tunnel session between `client` and `upstream`.
///
/// Returns once either side ends; both connections are closed by then.
pub async fn relay(
    client: BoxedStream,
    upstream: BoxedStream,
    label: impl Into<String>,
    idle_timeout: Option<Duration>,
) -> RelayStats {
    RelayPair::new(client, upstream, label).run(idle_timeout).await
}

/// The two connections of one tunnel session
pub struct RelayPair {
    client: Option<BoxedStream>,
    upstream: Option<BoxedStream>,
    label: String,
}

impl RelayPair {
    pub fn new(client: BoxedStream, upstream: BoxedStream, label: impl Into<String>) -> Self {
        Self {
            client: Some(client),
            upstream: Some(upstream),
            label: label.into(),
        }
    }

    /// Relay both directions until either side ends, then close both.
    ///
    /// Each direction runs as its own future and only waits on its own read
    /// and write, so a peer that writes before it reads never blocks the
    /// opposite direction. With `idle_timeout` set, a session that moves no
    /// bytes in either direction for that long is closed as well.
    pub async fn run(mut self, idle_timeout: Option<Duration>) -> RelayStats {
        let mut stats = RelayStats::default();

        let (Some(client), Some(upstream)) = (self.client.take(), self.upstream.take()) else {
            return stats;
        };

        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

        let from_client = AtomicU64::new(0);
        let from_upstream = AtomicU64::new(0);
        let activity = Activity::new();
        let period = idle_timeout.unwrap_or(Duration::MAX);

        {
            let label = self.label.as_str();
            let to_upstream = pump(&mut client_rd, &mut upstream_wr, &from_client, &activity, label, "client");
            let to_client = pump(&mut upstream_rd, &mut client_wr, &from_upstream, &activity, label, "upstream");

            tokio::select! {
                _ = to_upstream => {}
                _ = to_client => {}
                _ = activity.idle_for(period), if idle_timeout.is_some() => {
                    warn!("Tunnel {} idle for {:?}, closing", label, period);
                    stats.idle_timed_out = true;
                }
            }
        }

        stats.from_client = from_client.load(Ordering::Relaxed);
        stats.from_upstream = from_upstream.load(Ordering::Relaxed);

        self.client = Some(client_rd.unsplit(client_wr));
        self.upstream = Some(upstream_rd.unsplit(upstream_wr));
        self.close().await;
        stats
    }

    /// Shut down and drop both connections. Safe to call repeatedly.
    pub async fn close(&mut self) {
        for (side, stream) in [("upstream", self.upstream.take()), ("client", self.client.take())] {
            if let Some(mut stream) = stream {
                if let Err(e) = stream.shutdown().await {
                    if e.kind() != std::io::ErrorKind::NotConnected
                        && e.kind() != std::io::ErrorKind::BrokenPipe
                    {
                        debug!("Tunnel {} {} shutdown error: {}", self.label, side, e);
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.client.is_none() && self.upstream.is_none()
    }
}

/// Copy `reader` into `writer` until EOF or an error, counting bytes
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    activity: &Activity,
    label: &str,
    source: &str,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Tunnel {} {} read error: {}", label, source, e);
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            debug!("Tunnel {} write error relaying {} bytes: {}", label, source, e);
            break;
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}

/// Last time either direction moved bytes
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Resolves once nothing has moved for `period`
    async fn idle_for(&self, period: Duration) {
        loop {
            let last = self.started + Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
            let Some(deadline) = last.checked_add(period) else {
                return std::future::pending().await;
            };
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}
