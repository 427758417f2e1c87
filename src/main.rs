//! Reliable file transfer over UDP — a minimal TCP-like transport.
//!
//! Usage:
//!   rft send <HOST> <PORT> <FILE>     stream a file to a receiver
//!   rft serve <PORT> <DIR>            accept transfers into a directory
//!
//! The protocol is connection-oriented and ordered on top of raw UDP
//! datagrams: a three-way handshake assigns a connection id, data flows
//! under slow-start/congestion-avoidance with go-back-N loss recovery,
//! and a four-way teardown with a timed-wait window closes the stream.
//! The receiver multiplexes many concurrent transfers, writing each
//! connection's bytes to `<DIR>/<id>.file`.

mod congestion;
mod receiver;
mod seq;
mod sender;
mod wire;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::UdpSocket;

use receiver::{Receiver, Sink, SinkFactory};
use sender::Sender;

/// Reliable file transfer over UDP.
#[derive(Parser, Debug)]
#[command(name = "rft", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream a file to a receiver.
    Send {
        /// Remote hostname or IP address.
        host: String,
        /// Remote UDP port.
        port: u16,
        /// File to transfer.
        file: PathBuf,
    },
    /// Accept transfers, writing each connection to `<DIR>/<id>.file`.
    Serve {
        /// UDP port to listen on.
        port: u16,
        /// Directory for received files.
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    // Best-effort transport: a termination signal exits immediately, no
    // graceful teardown is attempted.
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });

    match cli.command {
        Command::Send { host, port, file } => send(host, port, file).await,
        Command::Serve { port, dir } => serve(port, dir).await,
    }
}

async fn send(host: String, port: u16, file: PathBuf) -> Result<()> {
    let remote: SocketAddr = tokio::net::lookup_host((host.as_str(), port))
        .await
        .with_context(|| format!("resolving {host}:{port}"))?
        .next()
        .with_context(|| format!("no address found for {host}"))?;

    let mut source = tokio::fs::File::open(&file)
        .await
        .with_context(|| format!("opening {}", file.display()))?;

    let bind_addr = if remote.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind_addr).await.context("binding UDP socket")?;
    socket.connect(remote).await.context("connecting UDP socket")?;
    log::info!("sending {} to {}", file.display(), remote);

    let mut sender = Sender::handshake(socket).await?;
    sender.transfer(&mut source).await?;
    sender.shutdown().await
}

async fn serve(port: u16, dir: PathBuf) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding UDP port {port}"))?;
    log::info!("listening on {}", socket.local_addr()?);

    let make_sink: SinkFactory = Box::new(move |id| {
        let path = dir.join(format!("{id}.file"));
        let file = std::fs::File::create(&path)
            .with_context(|| format!("creating {}", path.display()))?;
        Ok(Box::new(file) as Sink)
    });

    Receiver::new(socket, make_sink).run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_send() {
        let cli = Cli::parse_from(["rft", "send", "localhost", "9000", "data.bin"]);
        match cli.command {
            Command::Send { host, port, file } => {
                assert_eq!(host, "localhost");
                assert_eq!(port, 9000);
                assert_eq!(file, PathBuf::from("data.bin"));
            }
            _ => panic!("expected send subcommand"),
        }
    }

    #[test]
    fn test_cli_parses_serve_with_verbose() {
        let cli = Cli::parse_from(["rft", "serve", "9000", "/tmp/out", "-v"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Serve { port: 9000, .. }));
    }

    #[test]
    fn test_cli_rejects_out_of_range_port() {
        assert!(Cli::try_parse_from(["rft", "serve", "99999", "/tmp/out"]).is_err());
    }
}
