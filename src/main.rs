//! vgstackd: terminal control-channel daemon.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  MemoryConfig   FsStorage   ProcessOs   SimDevice / SimCard    │
//! │  (ConfigPort)   (Storage)   (OsPort)    (Device / Card)        │
//! │  SerialTransport  TcpTransport  JournalSink → UpgradeNotifier  │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │          ProtocolEngine (pure protocol logic)          │    │
//! │  │  FrameCodec · CommandDispatcher · Router · Upgrades    │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │  io_task: link readers · dispatcher executor · writer          │
//! └────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use vgstack::adapters::device_id;
use vgstack::adapters::fs_storage::FsStorage;
use vgstack::adapters::kv_config::MemoryConfig;
use vgstack::adapters::log_sink::LogNotifier;
use vgstack::adapters::notify::UpgradeNotifier;
use vgstack::adapters::process_os::ProcessOs;
use vgstack::adapters::sim_device::{LogDisplay, SimCard, SimDevice};
use vgstack::adapters::tcp::TcpTransport;
use vgstack::adapters::time::wall_clock_ms;
use vgstack::app::ports::PortSet;
use vgstack::config::StackConfig;
use vgstack::diagnostics::{self, JournalSink, UpgradeJournal};
use vgstack::proto::io_task::{self, Link};
use vgstack::proto::subctl;
use vgstack::proto::sync::SyncBridge;
use vgstack::proto::transport::{Transport, TransportId};

/// Control-channel daemon for scanner and access terminals.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Stack configuration (JSON). Missing fields take defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Device settings file (flat JSON of `sysInfo.*` keys), rewritten on change.
    #[arg(short, long, default_value = "/app/data/config.json")]
    device_config: PathBuf,
    /// Directory device paths are resolved under.
    #[arg(short, long, default_value = "/")]
    root: PathBuf,
    /// Really reboot and set the system clock.
    #[arg(long)]
    live: bool,
    /// Serial number reported until the host writes one.
    #[arg(long, default_value = "")]
    serial_number: String,
    /// Push this image to the sub-controller after start-up.
    #[arg(long)]
    subctl_image: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> Result<StackConfig> {
    let config = match path {
        Some(p) => {
            let text = std::fs::read_to_string(p)
                .with_context(|| format!("failed to read {}", p.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", p.display()))?
        }
        None => StackConfig::default(),
    };
    config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;
    Ok(config)
}

fn journal_clock() -> u64 {
    wall_clock_ms() / 1000
}

type BoxedTransport = Box<dyn Transport + Send>;

/// Open a serial line as a link. With `spare`, a third handle on the same
/// port is returned for a sub-controller upgrade worker.
#[cfg(feature = "serial")]
fn serial_link(
    id: TransportId,
    device: &str,
    baud: u32,
    spare: bool,
) -> Result<(Link, Option<BoxedTransport>)> {
    use vgstack::adapters::serial::SerialTransport;
    let reader = SerialTransport::open(device, baud)?;
    let writer = reader.try_clone()?;
    let extra = if spare {
        Some(Box::new(reader.try_clone()?) as BoxedTransport)
    } else {
        None
    };
    Ok((Link::new(id, reader, writer), extra))
}

#[cfg(not(feature = "serial"))]
fn serial_link(
    _id: TransportId,
    device: &str,
    _baud: u32,
    _spare: bool,
) -> Result<(Link, Option<BoxedTransport>)> {
    anyhow::bail!("{} configured but built without the serial feature", device)
}

/// Open every configured transport. A transport that fails to open is
/// logged and left out.
fn open_links(config: &StackConfig, want_subctl: bool) -> (Vec<Link>, Option<BoxedTransport>) {
    let t = &config.transports;
    let mut links = Vec::new();
    let mut spare_link = None;
    for (id, device) in [
        (TransportId::Rs485, t.rs485_device.as_deref()),
        (TransportId::SubController, t.subctl_device.as_deref()),
    ] {
        let Some(device) = device else { continue };
        let spare = want_subctl && id == TransportId::SubController;
        match serial_link(id, device, t.baud_rate, spare) {
            Ok((link, extra)) => {
                links.push(link);
                if extra.is_some() {
                    spare_link = extra;
                }
            }
            Err(e) => warn!("{} link unavailable: {:#}", id, e),
        }
    }
    if let Some(addr) = t.tcp_addr.as_deref() {
        match TcpTransport::connect(addr).and_then(|r| {
            let w = r.try_clone()?;
            Ok(Link::new(TransportId::Tcp, r, w))
        }) {
            Ok(link) => links.push(link),
            Err(e) => warn!("tcp link unavailable: {:#}", e),
        }
    }
    (links, spare_link)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    diagnostics::install_panic_handler();

    info!("vgstackd v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(cli.config.as_ref())?;
    let device_config = MemoryConfig::open(&cli.device_config).map_err(|e| {
        anyhow::anyhow!("device config {}: {}", cli.device_config.display(), e)
    })?;
    info!("{} device settings loaded", device_config.len());

    let storage = FsStorage::new(&cli.root);
    let journal = UpgradeJournal::default();
    for rec in journal.read_all(&storage) {
        info!(
            "previous upgrade: {} {:?} at {} {}",
            rec.target, rec.outcome, rec.at_secs, rec.detail
        );
    }

    let mac = device_id::read_mac();
    let ports = PortSet {
        config: Box::new(device_config),
        storage: Box::new(storage.clone()),
        events: Box::new(JournalSink::new(
            UpgradeNotifier::new(LogNotifier::new()),
            storage.clone(),
            journal,
            journal_clock,
        )),
        os: Box::new(ProcessOs::new(storage, cli.live)),
        device: Box::new(SimDevice::new(mac, cli.serial_number)),
        card: Box::new(SimCard::new()),
        display: Box::new(LogDisplay),
    };

    let bridge = Arc::new(SyncBridge::new());
    let (links, upgrade_link) = open_links(&config, cli.subctl_image.is_some());
    if links.is_empty() {
        warn!("no transports configured; HTTP and reports only");
    }

    if let Some(image) = cli.subctl_image.as_ref() {
        let link = upgrade_link.context("--subctl-image needs a working transports.subctl_device")?;
        let bytes = std::fs::read(image)
            .with_context(|| format!("failed to read {}", image.display()))?;
        let events = Box::new(UpgradeNotifier::new(LogNotifier::new()));
        subctl::spawn_upgrade(link, Arc::clone(&bridge), &config, bytes, events)
            .context("failed to spawn sub-controller upgrade")?;
    }

    let stack = io_task::start(config, bridge, ports, links).context("failed to start stack")?;
    stack.join();
    Ok(())
}
