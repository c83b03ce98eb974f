//! Command-line front-end for the `stun3489` library: run the server, run
//! the NAT classifier standalone, or drive the hole-punch transport as a
//! stdin/stdout echo peer. This binary and its argument surface are
//! external collaborators of the core library (wire codec, forger,
//! server, classifier, hole-punch transport) rather than part of it.
use std::io::{self, BufRead, Write};
use std::net::SocketAddrV4;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_std::task;
use clap::{Parser, ValueEnum};

use stun3489::classifier::Classifier;
use stun3489::holepunch::P2pConn;
use stun3489::server::Server;

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum Mode {
    Server,
    ClientEchoOn,
    ClientEchoTo,
    Classify,
}

/// A legacy RFC 3489 STUN server, NAT classifier, and UDP hole-punching
/// client.
#[derive(Parser, Debug)]
#[command(name = "stun3489", version, about)]
struct Cli {
    /// Mode to run in.
    #[arg(short = 'm', long, value_enum)]
    mode: Mode,

    /// Address this process listens/binds on (client modes only).
    #[arg(short = 'l', long)]
    local_addr: Option<SocketAddrV4>,

    /// STUN server address.
    #[arg(short = 's', long, default_value = "127.0.0.1:3478")]
    server_addr: SocketAddrV4,

    /// Peer's NAT-mapped address to hole-punch to (client-echo-to only).
    #[arg(short = 'r', long)]
    remote_addr: Option<SocketAddrV4>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    task::block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    match cli.mode {
        Mode::Server => run_server(cli.server_addr).await,
        Mode::Classify => run_classify(require_local(&cli)?, cli.server_addr).await,
        Mode::ClientEchoOn => run_echo_on(require_local(&cli)?, cli.server_addr).await,
        Mode::ClientEchoTo => {
            let remote = cli
                .remote_addr
                .ok_or_else(|| anyhow!("client-echo-to requires -r <peer-nat-addr>"))?;
            run_echo_to(require_local(&cli)?, cli.server_addr, remote).await
        }
    }
}

fn require_local(cli: &Cli) -> Result<SocketAddrV4> {
    cli.local_addr
        .ok_or_else(|| anyhow!("this mode requires -l <local-addr>"))
}

async fn run_server(server_addr: SocketAddrV4) -> Result<()> {
    log::info!("listening on {}", server_addr);
    let server = Server::bind(server_addr, None)
        .await
        .context("failed to bind STUN server")?;
    server.serve().await.context("STUN server loop failed")?;
    Ok(())
}

async fn run_classify(local_addr: SocketAddrV4, server_addr: SocketAddrV4) -> Result<()> {
    let classifier = Classifier::new(local_addr, server_addr)
        .await
        .context("failed to start classifier")?;
    let nat_type = classifier.classify().await;
    println!("{:?}", nat_type);
    Ok(())
}

async fn run_echo_on(local_addr: SocketAddrV4, server_addr: SocketAddrV4) -> Result<()> {
    let conn = P2pConn::listen(local_addr, server_addr)
        .await
        .context("failed to listen for a hole-punch peer")?;
    println!("NAT address: {}", conn.nat_addr());
    println!("peer: {}", conn.remote_addr());
    echo_loop(conn).await
}

async fn run_echo_to(local_addr: SocketAddrV4, server_addr: SocketAddrV4, remote_addr: SocketAddrV4) -> Result<()> {
    let conn = P2pConn::dial(local_addr, server_addr, remote_addr)
        .await
        .context("failed to dial a hole-punch peer")?;
    println!("NAT address: {}", conn.nat_addr());
    echo_loop(conn).await
}

/// Echo datagrams to/from stdin/stdout: a foreground read loop prints
/// inbound datagrams, while lines typed on stdin are sent as outbound
/// datagrams — the two run concurrently per spec §5.
async fn echo_loop(conn: P2pConn) -> Result<()> {
    let conn = Arc::new(conn);
    let reader_conn = conn.clone();
    let reader = task::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            match reader_conn.read(&mut buf).await {
                Ok(n) => {
                    let mut stdout = io::stdout();
                    stdout.write_all(&buf[..n]).ok();
                    stdout.write_all(b"\n").ok();
                    stdout.flush().ok();
                }
                Err(e) => {
                    log::warn!("hole-punch read failed: {}", e);
                    return;
                }
            }
        }
    });

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read from stdin")?;
        if let Err(e) = conn.write(line.as_bytes()).await {
            log::warn!("hole-punch write failed: {}", e);
            break;
        }
    }
    reader.await;
    Ok(())
}
