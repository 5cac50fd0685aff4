//! Asynchronous hostname resolution over raw DNS/UDP.
//!
//! One task owns one UDP socket connected to the configured resolver.
//! Sessions hand it lookups through a channel and get the answer back on
//! a oneshot. UDP gives no delivery guarantee, so a periodic sweep
//! re-sends any query that has gone unanswered past the resend
//! threshold; the in-flight entry is removed the moment an answer
//! arrives, so a session sees at most one callback.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::dns;

/// How long a query may stay unanswered before it is re-sent. There is
/// no retry cap: a lost datagram is re-sent once per elapsed threshold
/// for as long as the client keeps waiting.
pub const RESEND_AFTER: Duration = Duration::from_secs(10);

const SWEEP_EVERY: Duration = Duration::from_secs(1);

// Standard maximum for DNS over UDP without EDNS0
const MAX_DATAGRAM: usize = 512;

/// One queued lookup: the hostname and the session waiting on it
struct Lookup {
    host: String,
    reply: oneshot::Sender<Option<Ipv4Addr>>,
}

/// In-flight bookkeeping for one hostname key
struct Pending {
    id: u16,
    sent_at: Instant,
    waiters: Vec<oneshot::Sender<Option<Ipv4Addr>>>,
}

/// Resolver is the cloneable handle sessions use to request lookups
#[derive(Clone)]
pub struct Resolver {
    tx: mpsc::UnboundedSender<Lookup>,
}

/// Resolver implementation block
impl Resolver {
    /// spawn binds the resolver's UDP socket, connects it to `server`,
    /// and starts the resolver task with the default resend threshold.
    pub async fn spawn(server: SocketAddr) -> Result<Self> {
        Self::spawn_with_resend(server, RESEND_AFTER).await
    }

    /// spawn_with_resend is `spawn` with an explicit resend threshold.
    /// Tests use a short threshold to exercise the retry path quickly.
    pub async fn spawn_with_resend(server: SocketAddr, resend_after: Duration) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect(server)
            .await
            .with_context(|| format!("failed to connect resolver socket to {server}"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(socket, rx, resend_after));

        info!("DNS resolver started, upstream {server}");
        Ok(Self { tx })
    }

    /// resolve queues an A lookup for `host` and waits for the answer.
    /// `None` means the name did not resolve (or the resolver task is
    /// gone, which a session treats the same way).
    pub async fn resolve(&self, host: &str) -> Option<Ipv4Addr> {
        let (reply, rx) = oneshot::channel();
        let lookup = Lookup {
            host: host.to_string(),
            reply,
        };
        if self.tx.send(lookup).is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }
}

/// system_nameserver reads the first usable `nameserver` line from
/// /etc/resolv.conf. Falls back to a public resolver when none is found.
pub fn system_nameserver() -> SocketAddr {
    if let Ok(contents) = std::fs::read_to_string("/etc/resolv.conf") {
        for line in contents.lines() {
            if let Some(rest) = line.trim().strip_prefix("nameserver") {
                if let Ok(ip) = rest.trim().parse::<IpAddr>() {
                    return SocketAddr::new(ip, 53);
                }
            }
        }
    }
    warn!("no nameserver found in /etc/resolv.conf, falling back to 8.8.8.8");
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53)
}

/// The resolver task body: drain the send queue, then wait for the next
/// lookup, datagram, or sweep tick.
async fn run(socket: UdpSocket, mut rx: mpsc::UnboundedReceiver<Lookup>, resend_after: Duration) {
    let mut queue: VecDeque<String> = VecDeque::new();
    let mut pending: HashMap<String, Pending> = HashMap::new();
    let mut sweep = tokio::time::interval(SWEEP_EVERY);
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        while let Some(host) = queue.pop_front() {
            send_query(&socket, &host, &mut pending).await;
        }

        tokio::select! {
            lookup = rx.recv() => {
                let Some(lookup) = lookup else {
                    // server dropped its handle, nothing left to serve
                    break;
                };
                enqueue(lookup, &mut queue, &mut pending);
            }

            received = socket.recv(&mut buf) => {
                match received {
                    Ok(n) => deliver(&buf[..n], &mut pending),
                    // e.g. ICMP port unreachable surfacing on the connected
                    // socket; the resend sweep covers the lost query
                    Err(e) => error!("DNS socket receive error: {e}"),
                }
            }

            _ = sweep.tick() => {
                let now = Instant::now();
                for (host, entry) in pending.iter() {
                    if now.duration_since(entry.sent_at) >= resend_after
                        && !queue.contains(host)
                    {
                        info!("DNS query for {host} unanswered, re-sending");
                        queue.push_back(host.clone());
                    }
                }
            }
        }
    }
}

/// enqueue records a lookup. A hostname already in flight gains another
/// waiter instead of a duplicate query; the one answer fans out to all.
fn enqueue(
    lookup: Lookup,
    queue: &mut VecDeque<String>,
    pending: &mut HashMap<String, Pending>,
) {
    let key = lookup.host.trim_end_matches('.').to_ascii_lowercase();
    debug!("new DNS request for {key}");

    match pending.get_mut(&key) {
        Some(entry) => entry.waiters.push(lookup.reply),
        None => {
            pending.insert(
                key.clone(),
                Pending {
                    id: rand::random(),
                    sent_at: Instant::now(),
                    waiters: vec![lookup.reply],
                },
            );
            queue.push_back(key);
        }
    }
}

/// send_query encodes and sends one query, stamping the pending entry
/// with a fresh id and send time. A hostname that cannot be encoded is
/// answered with failure on the spot.
async fn send_query(socket: &UdpSocket, host: &str, pending: &mut HashMap<String, Pending>) {
    // May have been answered while queued for a re-send
    let Some(entry) = pending.get_mut(host) else {
        return;
    };

    entry.id = rand::random();
    entry.sent_at = Instant::now();
    let id = entry.id;

    let query = match dns::encode_query(id, host) {
        Ok(query) => query,
        Err(e) => {
            error!("dropping DNS request: {e}");
            if let Some(entry) = pending.remove(host) {
                for waiter in entry.waiters {
                    let _ = waiter.send(None);
                }
            }
            return;
        }
    };

    match socket.send(&query).await {
        Ok(_) => debug!("sent DNS query {id:#06x} for {host}"),
        // Abandoned for this pass; the sweep will queue a re-send
        Err(e) => error!("DNS socket send error: {e}"),
    }
}

/// deliver parses one response datagram and completes the matching
/// pending resolution. Responses for names no longer in flight are
/// ignored, so a re-sent query can never produce a second callback.
fn deliver(pkt: &[u8], pending: &mut HashMap<String, Pending>) {
    let answer = match dns::decode_response(pkt) {
        Ok(answer) => answer,
        Err(e) => {
            warn!("ignoring resolver datagram: {e}");
            return;
        }
    };

    let Some(entry) = pending.remove(&answer.name) else {
        debug!("unmatched DNS response for {}", answer.name);
        return;
    };

    match answer.addr {
        Some(addr) => info!("resolved {} -> {addr}", answer.name),
        None => warn!("no A record for {}", answer.name),
    }
    for waiter in entry.waiters {
        let _ = waiter.send(answer.addr);
    }
}
