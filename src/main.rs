use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;

use minisocks::ProxyServer;

#[derive(Parser, Debug)]
#[command(author, version, about = "A lightweight SOCKS5 proxy", long_about = None)]
struct Args {
    /// Listener address
    #[arg(short, long, default_value = "127.0.0.1:1080")]
    listen: String,

    /// DNS resolver address, defaults to the system-configured one
    #[arg(short, long)]
    resolver: Option<SocketAddr>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt::init();

    // Parse args
    let args = Args::parse();

    // Instantiate the server and run it
    let mut server = ProxyServer::new(args.listen).with_resolver(args.resolver);
    server.run().await
}
