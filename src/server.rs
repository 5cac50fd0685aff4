use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::resolver::{self, Resolver};
use crate::session::Session;

/// ProxyServer represents the SOCKS5 proxy and houses related
/// configuration data: the listen address and the DNS resolver to use
pub struct ProxyServer {
    pub listen_addr: String,
    resolver_addr: Option<SocketAddr>,
    listener: Option<TcpListener>,
}

/// ProxyServer implementation block
impl ProxyServer {
    /// new is a constructor for the ProxyServer type
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            resolver_addr: None,
            listener: None,
        }
    }

    /// with_resolver overrides the system-configured DNS resolver
    pub fn with_resolver(mut self, addr: Option<SocketAddr>) -> Self {
        self.resolver_addr = addr;
        self
    }

    /// bind to the listen address, panics when called twice
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            panic!("bind can only be called once");
        }

        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;

        info!("SOCKS5 proxy listening on {addr}");

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run starts the DNS resolver and accepts clients forever, one
    /// session task per connection. Accept failures are logged and the
    /// loop keeps serving.
    pub async fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self.listener.take().unwrap();

        let resolver_addr = self
            .resolver_addr
            .unwrap_or_else(resolver::system_nameserver);
        let resolver = Resolver::spawn(resolver_addr).await?;

        loop {
            match listener.accept().await {
                Ok((inbound, peer_addr)) => {
                    info!("new client: {peer_addr}");

                    let session = Session::new(inbound, resolver.clone());
                    tokio::spawn(async move {
                        if let Err(e) = session.run().await {
                            error!("connection error: {e}");
                        }
                    });
                }
                Err(e) => error!("accept failed: {e}"),
            }
        }
    }
}
