//! Loopback startup barrier for processes fanned out inside one worker.
//!
//! Wire protocol, one line each way:
//! rank process -> barrier: `READY <rank>\n`
//! barrier -> rank process: `GO\n` once every rank in `0..world_size` has
//! checked in.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use sweep_core::error::SweepError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, warn};

const READY_PREFIX: &str = "READY";
const GO_LINE: &str = "GO";
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

pub struct RendezvousBarrier {
    listener: TcpListener,
    world_size: usize,
}

impl RendezvousBarrier {
    pub async fn bind(endpoint: SocketAddr, world_size: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(endpoint).await?;
        Ok(Self {
            listener,
            world_size,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Waits until every rank has checked in, then releases them together.
    ///
    /// Gives up after `startup_timeout` with [`SweepError::RendezvousTimeout`]
    /// reporting how many distinct ranks arrived.
    pub async fn wait(self, startup_timeout: Duration) -> Result<(), SweepError> {
        let deadline = Instant::now() + startup_timeout;
        let world_size = self.world_size;
        let mut arrived: BTreeMap<usize, TcpStream> = BTreeMap::new();
        let mut handshakes = JoinSet::new();

        let gathered = timeout_at(deadline, async {
            while arrived.len() < world_size {
                tokio::select! {
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(component = "bootstrap", %peer, "rendezvous_connection");
                            handshakes.spawn(read_ready(stream));
                        }
                        Err(error) => {
                            warn!(component = "bootstrap", %error, "rendezvous_accept_failed");
                        }
                    },
                    Some(joined) = handshakes.join_next() => match joined {
                        Ok(Ok((rank, stream))) if rank < world_size => {
                            arrived.entry(rank).or_insert(stream);
                        }
                        Ok(Ok((rank, _))) => {
                            warn!(component = "bootstrap", rank, world_size, "rendezvous_rank_out_of_range");
                        }
                        Ok(Err(error)) => {
                            warn!(component = "bootstrap", %error, "rendezvous_handshake_failed");
                        }
                        Err(error) => {
                            warn!(component = "bootstrap", %error, "rendezvous_handshake_aborted");
                        }
                    },
                }
            }
        })
        .await;

        if gathered.is_err() {
            return Err(SweepError::RendezvousTimeout {
                arrived: arrived.len(),
                expected: world_size,
            });
        }

        for (rank, stream) in arrived.iter_mut() {
            if let Err(error) = stream.write_all(format!("{GO_LINE}\n").as_bytes()).await {
                warn!(component = "bootstrap", rank = *rank, %error, "rendezvous_release_failed");
            }
        }
        Ok(())
    }
}

async fn read_ready(stream: TcpStream) -> io::Result<(usize, TcpStream)> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let rank = parse_ready(&line).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected rendezvous greeting {:?}", line.trim()),
        )
    })?;
    Ok((rank, reader.into_inner()))
}

fn parse_ready(line: &str) -> Option<usize> {
    let mut parts = line.split_whitespace();
    if parts.next()? != READY_PREFIX {
        return None;
    }
    let rank = parts.next()?.parse().ok()?;
    parts.next().is_none().then_some(rank)
}

/// Joins the barrier at `endpoint` as `rank` and waits for release.
///
/// Connection refusals are retried until `timeout`, so a rank may start
/// before the barrier is listening.
pub async fn check_in(endpoint: SocketAddr, rank: usize, timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    let released = timeout_at(deadline, async {
        let stream = loop {
            match TcpStream::connect(endpoint).await {
                Ok(stream) => break stream,
                Err(error) if error.kind() == io::ErrorKind::ConnectionRefused => {
                    sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(error) => return Err(error),
            }
        };

        let mut reader = BufReader::new(stream);
        reader
            .get_mut()
            .write_all(format!("{READY_PREFIX} {rank}\n").as_bytes())
            .await?;

        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line.trim() == GO_LINE {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected rendezvous release {:?}", line.trim()),
            ))
        }
    })
    .await;

    match released {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("rendezvous at {endpoint} did not release rank {rank} in time"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;

    fn ephemeral() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn parses_ready_greeting() {
        assert_eq!(parse_ready("READY 3\n"), Some(3));
        assert_eq!(parse_ready("READY x\n"), None);
        assert_eq!(parse_ready("HELLO 1\n"), None);
        assert_eq!(parse_ready("READY 1 2\n"), None);
    }

    #[tokio::test]
    async fn releases_all_ranks_once_everyone_checks_in() {
        let barrier = RendezvousBarrier::bind(ephemeral(), 3)
            .await
            .expect("bind barrier");
        let endpoint = barrier.local_addr().expect("local addr");

        let mut ranks = JoinSet::new();
        for rank in 0..3 {
            ranks.spawn(check_in(endpoint, rank, Duration::from_secs(5)));
        }

        barrier
            .wait(Duration::from_secs(5))
            .await
            .expect("barrier should release");
        while let Some(joined) = ranks.join_next().await {
            joined.expect("rank task").expect("rank should be released");
        }
    }

    #[tokio::test]
    async fn times_out_when_a_rank_never_arrives() {
        let barrier = RendezvousBarrier::bind(ephemeral(), 2)
            .await
            .expect("bind barrier");
        let endpoint = barrier.local_addr().expect("local addr");
        let lone_rank = tokio::spawn(check_in(endpoint, 0, Duration::from_secs(5)));

        let error = barrier
            .wait(Duration::from_millis(300))
            .await
            .expect_err("barrier should time out");

        assert!(matches!(
            error,
            SweepError::RendezvousTimeout {
                arrived: 1,
                expected: 2
            }
        ));
        assert!(error.is_retryable());
        let released = lone_rank.await.expect("rank task");
        assert!(released.is_err());
    }

    #[tokio::test]
    async fn duplicate_ranks_count_once() {
        let barrier = RendezvousBarrier::bind(ephemeral(), 2)
            .await
            .expect("bind barrier");
        let endpoint = barrier.local_addr().expect("local addr");
        let first = tokio::spawn(check_in(endpoint, 1, Duration::from_secs(2)));
        let second = tokio::spawn(check_in(endpoint, 1, Duration::from_secs(2)));

        let error = barrier
            .wait(Duration::from_millis(300))
            .await
            .expect_err("barrier should time out");

        assert!(matches!(
            error,
            SweepError::RendezvousTimeout { arrived: 1, .. }
        ));
        let _ = first.await;
        let _ = second.await;
    }

    #[tokio::test]
    async fn check_in_times_out_without_a_barrier() {
        let listener = TcpListener::bind(ephemeral()).await.expect("bind");
        let endpoint = listener.local_addr().expect("local addr");

        let error = check_in(endpoint, 0, Duration::from_millis(200))
            .await
            .expect_err("check-in should time out");
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
    }
}
