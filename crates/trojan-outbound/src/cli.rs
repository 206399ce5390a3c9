//! CLI for probing an endpoint.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use bytes::BytesMut;
use clap::{Args, Parser};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use trojan_proto::{TargetAddress, sha224_hex};

use crate::adapter::TrojanAdapter;
use crate::config::{LoggingConfig, load_probe_config};
use crate::context::DialContext;
use crate::dialer::DialOptions;

/// Dial a target through the configured endpoint and print the reply.
#[derive(Parser, Debug, Clone)]
#[command(name = "probe", version, about = "Dial a target through a Trojan endpoint")]
pub struct ProbeArgs {
    /// Config file path (toml/json/jsonc).
    #[arg(short, long, default_value = "proxy.toml")]
    pub config: PathBuf,

    /// Target as host:port.
    #[arg(short, long)]
    pub target: String,

    /// Send one datagram instead of opening a stream.
    #[arg(long)]
    pub udp: bool,

    /// Bytes to send; `\r`, `\n` and `\t` escapes are expanded.
    #[arg(short, long)]
    pub payload: Option<String>,

    /// Overall deadline for the dial and the reply.
    #[arg(long, default_value_t = 10)]
    pub timeout_secs: u64,

    /// Log level override.
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Print the request header token for a password.
#[derive(Args, Debug, Clone)]
pub struct HashArgs {
    pub password: String,
}

pub fn run_hash(args: &HashArgs) {
    println!("{}", sha224_hex(&args.password));
}

/// Run one probe with the given CLI arguments.
pub async fn run(args: ProbeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_probe_config(&args.config)?;
    if let Some(level) = &args.log_level {
        config.logging.level = Some(level.clone());
    }
    init_tracing(&config.logging);

    let target: TargetAddress = args.target.parse()?;
    let adapter = TrojanAdapter::new(config.proxy.build()?)?;
    let payload = unescape(args.payload.as_deref().unwrap_or(""));
    let timeout = Duration::from_secs(args.timeout_secs);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
            on_signal.cancel();
        }
    });
    let ctx = DialContext::with_cancel(cancel).timeout(timeout);

    info!(
        proxy = %adapter.name(),
        server = %adapter.server_addr(),
        %target,
        udp = args.udp,
        "probing"
    );

    let reply = if args.udp {
        let pc = adapter.dial_packet(&ctx, &target, &DialOptions::default()).await?;
        pc.send_to(&payload, &target).await?;
        let (data, source) = tokio::time::timeout(timeout, pc.recv_from()).await??;
        info!(%source, len = data.len(), "datagram received");
        pc.close().await?;
        data.to_vec()
    } else {
        let mut conn = adapter.dial_stream(&ctx, &target, &DialOptions::default()).await?;
        if !payload.is_empty() {
            conn.write_all(&payload).await?;
            conn.flush().await?;
        }
        let mut reply = BytesMut::with_capacity(4096);
        match tokio::time::timeout(timeout, read_reply(&mut conn, &mut reply)).await {
            Ok(res) => res?,
            Err(_) => warn!(len = reply.len(), "reply timed out, printing what arrived"),
        }
        conn.close().await?;
        reply.to_vec()
    };

    let mut stdout = io::stdout().lock();
    stdout.write_all(&reply)?;
    stdout.flush()?;
    Ok(())
}

async fn read_reply<R: tokio::io::AsyncRead + Unpin>(
    conn: &mut R,
    reply: &mut BytesMut,
) -> io::Result<()> {
    while conn.read_buf(reply).await? > 0 {}
    Ok(())
}

fn unescape(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut tmp = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut tmp).as_bytes());
            continue;
        }
        match chars.next() {
            Some('r') => out.push(b'\r'),
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('\\') => out.push(b'\\'),
            Some(other) => {
                out.push(b'\\');
                let mut tmp = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut tmp).as_bytes());
            }
            None => out.push(b'\\'),
        }
    }
    out
}

fn init_tracing(config: &LoggingConfig) {
    let base_level = config.level.as_deref().unwrap_or("info");
    let mut filter_str = base_level.to_string();
    for (module, level) in &config.filters {
        filter_str.push_str(&format!(",{module}={level}"));
    }
    let filter = EnvFilter::try_new(&filter_str).unwrap_or_else(|_| EnvFilter::new("info"));

    let format = config.format.as_deref().unwrap_or("pretty");
    // stdout carries the reply, so logs default to stderr
    let to_stdout = config.output.as_deref() == Some("stdout");

    let registry = tracing_subscriber::registry().with(filter);
    let res = match (format, to_stdout) {
        ("json", true) => registry.with(fmt::layer().json().with_writer(io::stdout)).try_init(),
        ("json", false) => registry.with(fmt::layer().json().with_writer(io::stderr)).try_init(),
        ("compact", true) => registry.with(fmt::layer().compact().with_writer(io::stdout)).try_init(),
        ("compact", false) => registry.with(fmt::layer().compact().with_writer(io::stderr)).try_init(),
        (_, true) => registry.with(fmt::layer().with_writer(io::stdout)).try_init(),
        (_, false) => registry.with(fmt::layer().with_writer(io::stderr)).try_init(),
    };
    if let Err(e) = res {
        eprintln!("tracing already initialized: {e}");
    }
}
