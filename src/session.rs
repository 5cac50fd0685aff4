//! Per-client protocol state machine: greeting, method selection,
//! request, resolution/connect, reply, then relay.

use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

use crate::resolver::Resolver;
use crate::socks5::{self, AuthMethod, Command, ReplyCode, RequestAddr};
use crate::upstream::Upstream;

/// SessionState tracks a client connection through the handshake.
/// Transitions only move forward; the DNS-failure and connect-failure
/// paths jump straight to AwaitingReplySend with a failure code set.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionState {
    AwaitingGreeting,
    AwaitingMethodAck,
    AwaitingRequest,
    AwaitingResolution,
    AwaitingUpstream,
    AwaitingReplySend,
    Relaying,
    Closed,
}

/// Session drives one accepted client connection from greeting to close
pub struct Session {
    stream: TcpStream,
    resolver: Resolver,
    state: SessionState,
    /// Bytes read from the client but not yet consumed by the codec
    scratch: Vec<u8>,
    auth_method: AuthMethod,
    reply_code: ReplyCode,
    host_name: Option<String>,
    host_addr: Option<Ipv4Addr>,
    host_port: u16,
    upstream: Option<Upstream>,
}

/// Session implementation block
impl Session {
    /// new wraps an accepted client socket
    pub fn new(stream: TcpStream, resolver: Resolver) -> Self {
        Self {
            stream,
            resolver,
            state: SessionState::AwaitingGreeting,
            scratch: Vec::new(),
            auth_method: AuthMethod::NoAcceptable,
            reply_code: ReplyCode::Succeeded,
            host_name: None,
            host_addr: None,
            host_port: 0,
            upstream: None,
        }
    }

    /// run advances the state machine until the connection is closed.
    /// An error tears the session down; the upstream, if any, goes with
    /// it when the returned future is dropped.
    pub async fn run(mut self) -> Result<()> {
        loop {
            self.state = match self.state {
                SessionState::AwaitingGreeting => self.read_greeting().await?,
                SessionState::AwaitingMethodAck => self.write_selected_method().await?,
                SessionState::AwaitingRequest => self.read_request().await?,
                SessionState::AwaitingResolution => self.resolve_host().await?,
                SessionState::AwaitingUpstream => self.connect_upstream().await?,
                SessionState::AwaitingReplySend => self.write_reply().await?,
                SessionState::Relaying => self.relay().await?,
                SessionState::Closed => return Ok(()),
            };
        }
    }

    /// fill_scratch reads more client bytes for the codec to chew on.
    /// Returns the number of bytes read; 0 means the client is gone.
    async fn fill_scratch(&mut self) -> Result<usize> {
        let mut chunk = [0u8; 512];
        let n = self.stream.read(&mut chunk).await?;
        self.scratch.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn read_greeting(&mut self) -> Result<SessionState> {
        loop {
            if let Some((greeting, used)) = socks5::decode_greeting(&self.scratch)? {
                self.scratch.drain(..used);
                self.auth_method = greeting.select_method();
                if self.auth_method == AuthMethod::NoAcceptable {
                    error!("client offers authentication-only methods, refusing");
                }
                return Ok(SessionState::AwaitingMethodAck);
            }
            if self.fill_scratch().await? == 0 {
                debug!("client closed before completing the greeting");
                return Ok(SessionState::Closed);
            }
        }
    }

    async fn write_selected_method(&mut self) -> Result<SessionState> {
        self.stream
            .write_all(&socks5::encode_method_reply(self.auth_method))
            .await?;
        if self.auth_method == AuthMethod::NoAcceptable {
            return Ok(SessionState::Closed);
        }
        Ok(SessionState::AwaitingRequest)
    }

    async fn read_request(&mut self) -> Result<SessionState> {
        loop {
            if let Some((request, used)) = socks5::decode_request(&self.scratch)? {
                self.scratch.drain(..used);
                self.host_port = request.port;

                if Command::from_byte(request.command) != Some(Command::Connect) {
                    error!(
                        "unsupported command {:#04x}, only CONNECT is serviced",
                        request.command
                    );
                    self.reply_code = ReplyCode::CommandNotSupported;
                    return Ok(SessionState::AwaitingReplySend);
                }

                return Ok(match request.addr {
                    RequestAddr::Ipv4(addr) => {
                        debug!("request for {addr}:{}", self.host_port);
                        self.host_addr = Some(addr);
                        SessionState::AwaitingUpstream
                    }
                    RequestAddr::Domain(name) => {
                        info!("request for domain {name}:{}", self.host_port);
                        self.host_name = Some(name);
                        SessionState::AwaitingResolution
                    }
                    RequestAddr::Ipv6 => {
                        error!("IPv6 destinations are not serviced");
                        self.reply_code = ReplyCode::AddrTypeNotSupported;
                        SessionState::AwaitingReplySend
                    }
                });
            }
            if self.fill_scratch().await? == 0 {
                debug!("client closed before completing the request");
                return Ok(SessionState::Closed);
            }
        }
    }

    async fn resolve_host(&mut self) -> Result<SessionState> {
        let name = self
            .host_name
            .clone()
            .context("awaiting resolution without a hostname")?;
        match self.resolver.resolve(&name).await {
            Some(addr) => {
                self.host_addr = Some(addr);
                Ok(SessionState::AwaitingUpstream)
            }
            None => {
                self.reply_code = ReplyCode::HostUnreachable;
                Ok(SessionState::AwaitingReplySend)
            }
        }
    }

    async fn connect_upstream(&mut self) -> Result<SessionState> {
        let addr = self
            .host_addr
            .context("awaiting upstream without a resolved address")?;
        match Upstream::connect(addr, self.host_port).await {
            Ok(upstream) => {
                self.upstream = Some(upstream);
                self.reply_code = ReplyCode::Succeeded;
            }
            Err(e) => {
                error!("connect to {addr}:{} failed: {e}", self.host_port);
                self.reply_code = ReplyCode::HostUnreachable;
            }
        }
        Ok(SessionState::AwaitingReplySend)
    }

    async fn write_reply(&mut self) -> Result<SessionState> {
        self.stream
            .write_all(&socks5::encode_reply(self.reply_code))
            .await?;
        if self.reply_code == ReplyCode::Succeeded {
            Ok(SessionState::Relaying)
        } else {
            debug!("sent failure reply {:?}, closing", self.reply_code);
            Ok(SessionState::Closed)
        }
    }

    async fn relay(&mut self) -> Result<SessionState> {
        let mut upstream = self
            .upstream
            .take()
            .context("relaying without an upstream")?;
        // Client bytes that arrived pipelined behind the request
        if !self.scratch.is_empty() {
            upstream.preload(&self.scratch);
            self.scratch.clear();
        }
        upstream.relay(&mut self.stream).await?;
        Ok(SessionState::Closed)
    }
}
