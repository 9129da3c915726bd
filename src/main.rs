//! portald
//!
//! Host for the portal emulation plugin on Linux: transfers go through the
//! hidraw backend, the combo is read from an evdev device.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use portald::{
    combo::EvdevButtons,
    hidraw,
    ButtonSource, Collaborators, Config, DeviceError, DeviceHandle, DeviceIdentity, DispatchTable, DumpBuffer,
    DumpStore, EmulationEvent, FsStorage, HidrawTransfer, Plugin, PluginOptions, SysfsResolver,
    TransferPath,
};

/// Transfer timeout used by `--probe`
const PROBE_TIMEOUT_MS: u64 = 500;

/// portald - emulate a toy portal from a figure dump
#[derive(Parser, Debug)]
#[command(name = "portald")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/portald/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// List all hidraw devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Overwrite the figure dump with the default stand-in and exit
    #[arg(long)]
    reset_dump: bool,

    /// evdev device for the toggle combo (overrides config)
    #[arg(long)]
    input_device: Option<PathBuf>,

    /// Read once from the given hidraw handle through the hook, print it and exit
    #[arg(long, value_name = "HANDLE")]
    probe: Option<i32>,

    /// Bytes requested by --probe
    #[arg(long, default_value_t = 32)]
    probe_len: usize,
}

/// Button source for hosts without a combo device
struct NoButtons;

impl ButtonSource for NoButtons {
    fn current_buttons(&self) -> u32 {
        0
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = load_config(args.config.as_deref());
    if let Some(device) = args.input_device.clone() {
        config.input_device = Some(device);
    }

    if args.list_devices {
        list_devices(config.device.identity());
        return Ok(());
    }

    if args.reset_dump {
        let store = DumpStore::on_disk(&config.dump_path);
        store.persist(&DumpBuffer::synthesize_default())?;
        info!(path = %store.path().display(), "Figure dump reset to default");
        return Ok(());
    }

    info!("portald starting...");

    let table = DispatchTable::new(Arc::new(HidrawTransfer::new()));
    let collaborators = Collaborators {
        installer: Arc::new(table.clone()),
        resolver: Arc::new(SysfsResolver::new()),
        buttons: open_buttons(&config),
        storage: Arc::new(FsStorage),
    };

    let (event_tx, mut event_rx) = mpsc::channel::<EmulationEvent>(16);
    let mut plugin = Plugin::new(PluginOptions::from(&config), collaborators).with_events(event_tx);

    if let Err(e) = plugin.start() {
        error!("Failed to start portal emulation: {}", e);
        return Err(e.into());
    }

    if let Some(handle) = args.probe {
        if let Err(e) = probe(&table, DeviceHandle(handle), args.probe_len) {
            println!("Read from handle {} failed: {}", handle, e);
        }
    } else {
        info!("portald ready");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, exiting...");
                    break;
                }
                event = event_rx.recv() => match event {
                    Some(EmulationEvent::Toggled { enabled }) => {
                        info!(enabled, "Portal emulation {}", if enabled { "ON" } else { "OFF" });
                    }
                    None => break,
                }
            }
        }
    }

    tokio::task::spawn_blocking(move || plugin.stop()).await?;
    Ok(())
}

/// Load configuration, falling back to defaults
fn load_config(path: Option<&std::path::Path>) -> Config {
    let loaded = match path {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    };

    match loaded {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config, using defaults: {}", e);
            Config::default()
        }
    }
}

/// Open the combo device, or an idle source if none is usable
fn open_buttons(config: &Config) -> Arc<dyn ButtonSource> {
    let Some(path) = config.input_device.as_ref() else {
        warn!("No input device configured - toggle combo disabled");
        return Arc::new(NoButtons);
    };

    match EvdevButtons::open(path, &config.combo.keys) {
        Ok(buttons) => Arc::new(buttons),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to open input device");
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                error!("Ensure udev rules are installed and user is in 'input' group.");
            }
            Arc::new(NoButtons)
        }
    }
}

/// Issue one read through the hook and hex-dump the result
fn probe(table: &DispatchTable, handle: DeviceHandle, len: usize) -> Result<Vec<u8>, DeviceError> {
    let mut buf = vec![0u8; len];
    let n = table.read(handle, &mut buf, Duration::from_millis(PROBE_TIMEOUT_MS))?;
    buf.truncate(n.min(len));

    println!("Read {} byte(s) from handle {}:", n, handle);
    for (i, chunk) in buf.chunks(16).enumerate() {
        println!("  {:04X}: {:02X?}", i * 16, chunk);
    }
    Ok(buf)
}

/// List all hidraw devices
fn list_devices(portal: DeviceIdentity) {
    println!("Scanning for hidraw devices...\n");

    let devices = match hidraw::list_devices() {
        Ok(devices) => devices,
        Err(e) => {
            println!("Could not scan {}: {}", hidraw::HIDRAW_SYSFS_DIR, e);
            return;
        }
    };

    if devices.is_empty() {
        println!("No hidraw devices found.");
        return;
    }

    println!("Found {} device(s):\n", devices.len());

    for device in &devices {
        let marker = if device.identity == portal { " [portal]" } else { "" };
        println!("{}. {}{}", device.handle, device.name, marker);
        println!("   Path:    {:?}", device.path);
        println!("   Vendor:  0x{:04X}", device.identity.vendor_id);
        println!("   Product: 0x{:04X}", device.identity.product_id);
        println!();
    }
}
