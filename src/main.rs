//! Entry point for `microtcp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All protocol work is delegated to the library; `main.rs` owns only process
//! setup (logging, argument parsing) and moving bytes between files and the
//! connection.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use microtcp::{Config, ConnError, Connection, Shutdown};

/// TCP-like reliable byte stream over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    mode: Mode,
}

/// Protocol knobs shared by both modes.
#[derive(Args)]
struct Tuning {
    /// Maximum payload bytes per segment.
    #[arg(long, global = true, default_value_t = microtcp::config::DEFAULT_MSS)]
    mss: u32,

    /// Acknowledgement timeout in milliseconds.
    #[arg(long, global = true, default_value_t = 200)]
    ack_timeout_ms: u64,
}

impl Tuning {
    fn config(&self) -> Config {
        Config {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            ..Config::with_mss(self.mss)
        }
    }
}

#[derive(Subcommand)]
enum Mode {
    /// Accept one connection and write everything received.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,

        /// Write the received stream here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Connect to a server, send a file or message, and close.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,

        /// File to send.
        #[arg(short, long, conflicts_with = "message")]
        file: Option<PathBuf>,

        /// Text to send; stdin is read when neither this nor --file is given.
        #[arg(short, long)]
        message: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.tuning.config();

    match cli.mode {
        Mode::Server { bind, output } => {
            log::info!("Starting server on {bind}");
            match output {
                Some(path) => {
                    let file = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("creating {}", path.display()))?;
                    run_server(bind, config, file).await
                }
                None => run_server(bind, config, tokio::io::stdout()).await,
            }
        }
        Mode::Client {
            server,
            file,
            message,
        } => {
            log::info!("Starting client, connecting to {server}");
            let data = match (file, message) {
                (Some(path), _) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, Some(text)) => text.into_bytes(),
                (None, None) => {
                    let mut buf = Vec::new();
                    tokio::io::stdin().read_to_end(&mut buf).await?;
                    buf
                }
            };
            run_client(server, config, &data).await
        }
    }
}

async fn run_server<W: AsyncWrite + Unpin>(bind: SocketAddr, config: Config, mut out: W) -> Result<()> {
    let mut buf = vec![0u8; config.recv_buffer_len];
    let mut conn = Connection::bind(bind, config).await?;
    let peer = conn.accept().await.context("accepting connection")?;
    log::info!("Accepted {peer}");

    let mut total = 0usize;
    loop {
        match conn.recv(&mut buf).await {
            Ok(n) => {
                out.write_all(&buf[..n]).await?;
                total += n;
            }
            Err(ConnError::Eof) => break,
            Err(e) => return Err(e).context("receiving"),
        }
    }
    out.flush().await?;

    log::info!(
        "Received {total} bytes from {peer} ({} segments, {} duplicates, {} out of order)",
        conn.stats.segments_received,
        conn.stats.duplicate_segments,
        conn.stats.out_of_order_segments
    );
    Ok(())
}

async fn run_client(server: SocketAddr, config: Config, data: &[u8]) -> Result<()> {
    let local: SocketAddr = if server.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let mut conn = Connection::bind(local, config).await?;
    conn.connect(server).await.context("connecting")?;

    let sent = conn.send(data).await.context("sending")?;
    conn.shutdown(Shutdown::Local).await.context("closing")?;

    log::info!(
        "Sent {sent} bytes ({} retransmissions, {} fast retransmits, {} timeouts)",
        conn.stats.retransmissions,
        conn.stats.fast_retransmits,
        conn.stats.timeouts
    );
    Ok(())
}
