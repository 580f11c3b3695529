use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tfstun::rate::Pps;
use tfstun::tun::TunDevice;
use tfstun::tunnel::{TunnelConfig, spawn_egress, spawn_ingress};
use tfstun::udp;

#[derive(Parser)]
#[command(name = "tfstun")]
#[command(about = "IP-TFS tunnel over UDP", long_about = None)]
struct Cli {
    /// Peer hostname (client mode)
    #[arg(short, long)]
    connect: Option<String>,

    /// Bind address (server mode)
    #[arg(short, long, default_value = "::")]
    listen: String,

    /// UDP port
    #[arg(short, long)]
    port: u16,

    /// Interface name, %d for the first free index
    #[arg(short, long, default_value = "vtun%d")]
    dev: String,

    /// Outer frame size in bytes, header included
    #[arg(short, long, default_value_t = 1500)]
    mtu: usize,

    /// Transmit rate in kbit/s
    #[arg(short, long, default_value_t = 10_000)]
    rate: u64,

    /// Simulated receive-side rate cap in kbit/s (0 disables)
    #[arg(short = 'C', long, default_value_t = 0)]
    congest_rate: u64,

    /// Refuse on-path fragmentation of outer frames
    #[arg(short = 'D', long)]
    dont_fragment: bool,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug {
        "tfstun=debug"
    } else if cli.verbose {
        "tfstun=info"
    } else {
        "tfstun=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if cli.dont_fragment {
        bail!("dont-fragment not implemented yet");
    }

    let cfg = TunnelConfig::new(cli.mtu, cli.rate * 1000, cli.congest_rate * 1000)
        .context("invalid tunnel configuration")?;

    let tun = TunDevice::open(&cli.dev).context("open TUN device")?;
    info!(name = tun.name(), "opened tun device");

    let sock = match &cli.connect {
        Some(host) => udp::connect(host, cli.port)
            .with_context(|| format!("connect to {}:{}", host, cli.port))?,
        None => udp::listen(&cli.listen, cli.port)
            .with_context(|| format!("listen on {}:{}", cli.listen, cli.port))?,
    };

    let pps = Arc::new(Pps::new(cfg.target_pps()));
    let dev = Arc::new(tun);

    let mut handles = spawn_ingress(Arc::clone(&dev), sock.try_clone()?, &cfg, Arc::clone(&pps))
        .context("spawn ingress")?;
    handles.extend(spawn_egress(dev, sock, &cfg, pps).context("spawn egress")?);

    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}
