// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Ring exchange between isolated processes.
//!
//! N participants, ranks 0..N-1, each in its own process (its own cgroup /
//! MIG slice when launched through the orchestration wrapper). Every rank
//! sends one payload to its right neighbor and receives one from its left
//! neighbor over per-rank Unix domain sockets in a shared directory, then
//! verifies the received payload element-wise and synchronizes on a
//! barrier hosted by rank 0 before exiting.
//!
//! The pattern is closed and deadlock-free: every rank sends exactly once
//! and receives exactly once, with distinct source and destination. The
//! send runs on its own thread so both transfers are posted before either
//! is awaited, which is what keeps the full ring from serializing. The
//! only retry anywhere is connection establishment, bounded by the
//! per-rank timeout, to ride out process startup skew.

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use std::fs;
use std::io::BufRead;
use std::io::BufReader;
use std::io::ErrorKind;
use std::io::Write;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use std::time::Instant;

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const CONNECT_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct RingConfig {
    pub rank: usize,
    pub size: usize,
    /// Elements in the exchanged payload, each set to the sender's rank.
    pub payload_len: usize,
    /// Directory holding the per-rank sockets. Must be shared by all
    /// participants and writable from inside their cgroups.
    pub dir: PathBuf,
    /// Bound on the whole exchange, setup included.
    pub timeout: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
struct RingMessage {
    rank: usize,
    payload: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BarrierMessage {
    rank: usize,
    release: bool,
}

#[derive(Debug)]
pub struct RingOutcome {
    pub rank: usize,
    /// Left neighbor the payload came from.
    pub src: usize,
    /// Right neighbor the payload went to.
    pub dst: usize,
    pub received: Vec<u32>,
    /// Element-wise verification result.
    pub ok: bool,
}

fn ring_sock(dir: &Path, rank: usize) -> PathBuf {
    dir.join(format!("ring-{rank}.sock"))
}

fn barrier_sock(dir: &Path) -> PathBuf {
    dir.join("barrier.sock")
}

/// Run one rank of the exchange to completion, barrier included.
///
/// Socket setup failures and timeouts are errors; a payload that arrives
/// but doesn't verify is a result (`ok == false`); delivering that
/// verdict is the point of the tool.
pub fn run_participant(cfg: &RingConfig) -> Result<RingOutcome> {
    if cfg.size == 0 || cfg.rank >= cfg.size {
        bail!("invalid ring rank {} of size {}", cfg.rank, cfg.size);
    }
    let deadline = Instant::now() + cfg.timeout;
    let src = (cfg.rank + cfg.size - 1) % cfg.size;
    let dst = (cfg.rank + 1) % cfg.size;

    // Bind before sending anything so neighbors always find our sockets.
    let own_path = ring_sock(&cfg.dir, cfg.rank);
    let _ = fs::remove_file(&own_path);
    let listener = UnixListener::bind(&own_path)
        .with_context(|| format!("Failed to bind ring socket {own_path:?}"))?;
    let barrier_listener = if cfg.rank == 0 {
        let path = barrier_sock(&cfg.dir);
        let _ = fs::remove_file(&path);
        Some(
            UnixListener::bind(&path)
                .with_context(|| format!("Failed to bind barrier socket {path:?}"))?,
        )
    } else {
        None
    };

    // Post the send on its own thread, then await the receive; both
    // transfers are in flight before either completes.
    let send_path = ring_sock(&cfg.dir, dst);
    let message = RingMessage {
        rank: cfg.rank,
        payload: vec![cfg.rank as u32; cfg.payload_len],
    };
    let sender = thread::spawn(move || -> Result<()> {
        let mut stream = connect_with_retry(&send_path, deadline)?;
        write_message(&mut stream, &message)
    });

    let stream = accept_with_deadline(&listener, deadline)
        .with_context(|| format!("rank {} never heard from rank {src}", cfg.rank))?;
    let mut reader = BufReader::new(stream);
    let received: RingMessage = read_message(&mut reader, deadline)?;

    sender
        .join()
        .map_err(|_| anyhow!("sender thread panicked"))?
        .with_context(|| format!("rank {} failed to send to rank {dst}", cfg.rank))?;

    let ok = verify(&received, src, cfg.payload_len);
    debug!(
        "rank {} received {} elements from rank {}: ok={}",
        cfg.rank,
        received.payload.len(),
        src,
        ok
    );

    barrier(cfg, barrier_listener, deadline)?;

    let _ = fs::remove_file(&own_path);
    if cfg.rank == 0 {
        let _ = fs::remove_file(barrier_sock(&cfg.dir));
    }

    Ok(RingOutcome {
        rank: cfg.rank,
        src,
        dst,
        received: received.payload,
        ok,
    })
}

fn verify(message: &RingMessage, src: usize, payload_len: usize) -> bool {
    message.rank == src
        && message.payload.len() == payload_len
        && message.payload.iter().all(|&v| v == src as u32)
}

/// All ranks report to rank 0 and wait for the release. Two phases,
/// every edge used exactly once in each direction, so no circular wait.
fn barrier(cfg: &RingConfig, listener: Option<UnixListener>, deadline: Instant) -> Result<()> {
    if cfg.size == 1 {
        return Ok(());
    }

    match listener {
        Some(listener) => {
            let mut arrived = Vec::with_capacity(cfg.size - 1);
            while arrived.len() < cfg.size - 1 {
                let stream = accept_with_deadline(&listener, deadline)
                    .context("barrier: not all ranks arrived")?;
                let mut reader = BufReader::new(stream);
                let msg: BarrierMessage = read_message(&mut reader, deadline)?;
                debug!("barrier: rank {} arrived", msg.rank);
                arrived.push(reader);
            }
            for reader in arrived.iter_mut() {
                write_message(
                    reader.get_mut(),
                    &BarrierMessage {
                        rank: 0,
                        release: true,
                    },
                )?;
            }
        }
        None => {
            let mut stream = connect_with_retry(&barrier_sock(&cfg.dir), deadline)
                .context("barrier: rank 0 unreachable")?;
            write_message(
                &mut stream,
                &BarrierMessage {
                    rank: cfg.rank,
                    release: false,
                },
            )?;
            let mut reader = BufReader::new(stream);
            let release: BarrierMessage = read_message(&mut reader, deadline)?;
            if !release.release {
                bail!("barrier: unexpected message instead of release");
            }
        }
    }
    Ok(())
}

fn remaining(deadline: Instant) -> Result<Duration> {
    let now = Instant::now();
    if now >= deadline {
        bail!("ring exchange timed out");
    }
    Ok(deadline - now)
}

fn connect_with_retry(path: &Path, deadline: Instant) -> Result<UnixStream> {
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            // The neighbor's bind may simply not have happened yet.
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                if Instant::now() >= deadline {
                    return Err(e).with_context(|| format!("timed out connecting to {path:?}"));
                }
                thread::sleep(CONNECT_RETRY);
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to connect to {path:?}")),
        }
    }
}

fn accept_with_deadline(listener: &UnixListener, deadline: Instant) -> Result<UnixStream> {
    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                remaining(deadline).context("timed out waiting for a connection")?;
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => return Err(e).context("accept failed"),
        }
    }
}

fn write_message<T: Serialize>(stream: &mut UnixStream, message: &T) -> Result<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    stream.write_all(line.as_bytes())?;
    stream.flush()?;
    Ok(())
}

fn read_message<T: DeserializeOwned>(
    reader: &mut BufReader<UnixStream>,
    deadline: Instant,
) -> Result<T> {
    reader
        .get_ref()
        .set_read_timeout(Some(remaining(deadline)?))?;
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        bail!("peer closed the connection before sending");
    }
    Ok(serde_json::from_str(line.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ring(size: usize, payload_len: usize) -> Vec<RingOutcome> {
        let dir = tempfile::tempdir().unwrap();
        let mut handles = vec![];
        for rank in 0..size {
            let cfg = RingConfig {
                rank,
                size,
                payload_len,
                dir: dir.path().to_path_buf(),
                timeout: Duration::from_secs(10),
            };
            handles.push(thread::spawn(move || run_participant(&cfg)));
        }
        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect()
    }

    #[test]
    fn test_three_rank_exchange() {
        let outcomes = run_ring(3, 8);
        for outcome in &outcomes {
            let src = (outcome.rank + 2) % 3;
            assert!(outcome.ok, "rank {} failed verification", outcome.rank);
            assert_eq!(outcome.src, src);
            assert_eq!(outcome.received, vec![src as u32; 8]);
        }
    }

    #[test]
    fn test_single_rank_self_exchange() {
        let outcomes = run_ring(1, 4);
        assert!(outcomes[0].ok);
        assert_eq!(outcomes[0].src, 0);
        assert_eq!(outcomes[0].received, vec![0u32; 4]);
    }

    #[test]
    fn test_verify_rejects_wrong_payload() {
        let good = RingMessage {
            rank: 2,
            payload: vec![2, 2, 2],
        };
        assert!(verify(&good, 2, 3));

        let wrong_rank = RingMessage {
            rank: 1,
            payload: vec![1, 1, 1],
        };
        assert!(!verify(&wrong_rank, 2, 3));

        let corrupt = RingMessage {
            rank: 2,
            payload: vec![2, 7, 2],
        };
        assert!(!verify(&corrupt, 2, 3));

        let short = RingMessage {
            rank: 2,
            payload: vec![2, 2],
        };
        assert!(!verify(&short, 2, 3));
    }

    #[test]
    fn test_invalid_config() {
        let cfg = RingConfig {
            rank: 3,
            size: 3,
            payload_len: 8,
            dir: PathBuf::from("/tmp"),
            timeout: Duration::from_secs(1),
        };
        assert!(run_participant(&cfg).is_err());
    }
}
