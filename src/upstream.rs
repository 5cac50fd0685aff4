//! The destination side of a proxied connection: the TCP socket to the
//! remote host and the two relay buffers between it and the client.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{Result, bail};
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Capacity of each relay buffer
pub const BUFFER_CAPACITY: usize = 8192;

/// RelayBuf is a fixed-capacity fill/drain buffer. Exactly one path
/// fills it and exactly one path drains it; a partially written
/// remainder is compacted to the front before the next fill.
struct RelayBuf {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
}

/// RelayBuf implementation block
impl RelayBuf {
    fn new() -> Self {
        Self {
            buf: vec![0u8; BUFFER_CAPACITY].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    fn has_data(&self) -> bool {
        self.start < self.end
    }

    fn has_space(&self) -> bool {
        self.end < self.buf.len() || self.start > 0
    }

    /// space returns the writable tail, compacting the unread remainder
    /// first when the tail is exhausted
    fn space(&mut self) -> &mut [u8] {
        if self.end == self.buf.len() && self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        &mut self.buf[self.end..]
    }

    fn filled(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    fn advance_fill(&mut self, n: usize) {
        self.end += n;
    }

    /// consume marks `n` drained bytes; a fully drained buffer resets
    /// to empty so the whole capacity is available again
    fn consume(&mut self, n: usize) {
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }
}

/// Upstream owns the socket to the remote host plus the outbound
/// (client -> host) and inbound (host -> client) relay buffers
pub struct Upstream {
    stream: TcpStream,
    peer: SocketAddrV4,
    to_host: RelayBuf,
    from_host: RelayBuf,
}

/// Upstream implementation block
impl Upstream {
    /// connect opens the connection to the remote host. The caller maps
    /// a failure here to the "host unreachable" reply.
    pub async fn connect(addr: Ipv4Addr, port: u16) -> std::io::Result<Self> {
        let peer = SocketAddrV4::new(addr, port);
        info!("connecting to remote host {peer}");
        let stream = TcpStream::connect(SocketAddr::V4(peer)).await?;
        Ok(Self {
            stream,
            peer,
            to_host: RelayBuf::new(),
            from_host: RelayBuf::new(),
        })
    }

    /// preload seeds the outbound buffer with bytes the client sent
    /// ahead of the reply. Anything past the buffer capacity is dropped.
    pub fn preload(&mut self, data: &[u8]) {
        let space = self.to_host.space();
        let n = data.len().min(space.len());
        space[..n].copy_from_slice(&data[..n]);
        self.to_host.advance_fill(n);
        if n < data.len() {
            warn!("dropping {} early client bytes", data.len() - n);
        }
    }

    /// relay copies bytes both ways until a side closes, driven purely
    /// by readiness. Each pass recomputes the interest set per socket:
    /// read interest while the receiving buffer has space, write
    /// interest while the draining buffer has data.
    ///
    /// Close ordering: a client close tears the pair down at once; a
    /// remote-host close first drains the buffered host -> client bytes,
    /// then closes the client.
    pub async fn relay(mut self, client: &mut TcpStream) -> Result<()> {
        let mut host_eof = false;
        let mut to_host_total: u64 = 0;
        let mut to_client_total: u64 = 0;

        loop {
            if host_eof && !self.from_host.has_data() {
                break;
            }

            let mut client_interest = None;
            if !host_eof && self.to_host.has_space() {
                client_interest = Some(Interest::READABLE);
            }
            if self.from_host.has_data() {
                client_interest = Some(match client_interest {
                    Some(interest) => interest | Interest::WRITABLE,
                    None => Interest::WRITABLE,
                });
            }

            let mut host_interest = None;
            if !host_eof && self.from_host.has_space() {
                host_interest = Some(Interest::READABLE);
            }
            if self.to_host.has_data() {
                host_interest = Some(match host_interest {
                    Some(interest) => interest | Interest::WRITABLE,
                    None => Interest::WRITABLE,
                });
            }

            if client_interest.is_none() && host_interest.is_none() {
                break;
            }

            tokio::select! {
                ready = client.ready(client_interest.unwrap_or(Interest::READABLE)),
                        if client_interest.is_some() => {
                    let ready = ready?;

                    if ready.is_readable() && !host_eof && self.to_host.has_space() {
                        match client.try_read(self.to_host.space()) {
                            Ok(0) => {
                                debug!("client closed the connection");
                                return Ok(());
                            }
                            Ok(n) => {
                                self.to_host.advance_fill(n);
                                to_host_total += n as u64;
                                debug!("read {n} bytes from client");
                            }
                            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                            Err(e) => return Err(e.into()),
                        }
                    }

                    if ready.is_writable() && self.from_host.has_data() {
                        match client.try_write(self.from_host.filled()) {
                            Ok(0) => bail!("client stopped accepting data"),
                            Ok(n) => {
                                self.from_host.consume(n);
                                to_client_total += n as u64;
                                debug!("wrote {n} bytes to client");
                            }
                            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                }

                ready = self.stream.ready(host_interest.unwrap_or(Interest::READABLE)),
                        if host_interest.is_some() => {
                    let ready = ready?;

                    if ready.is_readable() && !host_eof && self.from_host.has_space() {
                        match self.stream.try_read(self.from_host.space()) {
                            Ok(0) => {
                                debug!("remote host {} closed the connection", self.peer);
                                host_eof = true;
                            }
                            Ok(n) => {
                                self.from_host.advance_fill(n);
                                debug!("read {n} bytes from remote host");
                            }
                            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                            Err(e) => return Err(e.into()),
                        }
                    }

                    if ready.is_writable() && self.to_host.has_data() {
                        match self.stream.try_write(self.to_host.filled()) {
                            Ok(0) => bail!("remote host stopped accepting data"),
                            Ok(n) => {
                                self.to_host.consume(n);
                                debug!("wrote {n} bytes to remote host");
                            }
                            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
            }
        }

        // Remote host is gone and everything buffered has been flushed
        client.shutdown().await.ok();
        info!(
            "relay with {} finished: {to_host_total} bytes out, {to_client_total} bytes in",
            self.peer
        );
        Ok(())
    }
}
