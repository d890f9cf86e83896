//! usbipd - USB/IP device export daemon
//!
//! Shares USB devices attached to this host with remote machines over
//! the USB/IP protocol. Devices are bound for export with the `bind`
//! subcommand; `start` serves all bound devices on TCP port 3240 until
//! interrupted.

mod net;
mod registry;
mod usb;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use common::setup_logging;
use common::usb_types::DeviceSnapshot;
use net::UsbIpServer;
use protocol::DeviceSpeed;
use registry::{BindingEntry, BindingRegistry};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use usb::{RusbBackend, UsbBackend};

#[derive(Parser, Debug)]
#[command(name = "usbipd")]
#[command(
    author,
    version,
    about = "USB/IP daemon - share USB devices over the network"
)]
#[command(long_about = "
Share USB devices attached to this host over the USB/IP protocol.

EXAMPLES:
    # Show connected devices and their binding state
    usbipd list

    # Bind a device for export
    usbipd bind --bus-id 1-4.3

    # Serve all bound devices on the default port (3240)
    usbipd start

    # Serve on a specific address with debug logging
    usbipd -v start --addr 192.168.1.10

Bindings persist in the user configuration directory
(e.g. ~/.config/usbipd/bindings.toml) across restarts.
")]
struct Args {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the binding configuration file
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all connected USB devices
    List,

    /// Bind a USB device for export
    Bind {
        /// Bus ID of the device to bind (e.g. 1-4.3)
        #[arg(short, long, value_name = "BUSID")]
        bus_id: String,
    },

    /// Remove a USB device binding
    Unbind {
        /// Bus ID of the device to unbind
        #[arg(short, long, value_name = "BUSID", conflicts_with = "all")]
        bus_id: Option<String>,

        /// Remove all device bindings
        #[arg(long)]
        all: bool,
    },

    /// Start the USB/IP server with all bound devices
    Start {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        addr: IpAddr,

        /// TCP port to listen on
        #[arg(short, long, default_value_t = protocol::USBIP_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    setup_logging(log_level).context("Failed to setup logging")?;

    let registry =
        BindingRegistry::load(args.config.clone()).context("Failed to load bindings")?;

    match args.command {
        Command::List => command_list(registry),
        Command::Bind { bus_id } => command_bind(registry, &bus_id),
        Command::Unbind { bus_id, all } => command_unbind(registry, bus_id.as_deref(), all),
        Command::Start { addr, port } => command_start(registry, addr, port).await,
    }
}

/// Print every connected device and its binding state
fn command_list(registry: BindingRegistry) -> Result<()> {
    let backend = RusbBackend::new().context("Failed to initialize USB")?;
    let devices = backend
        .devices()
        .context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!(
        "{:<14} {:<10} {:<20} {:<26} {:<20} {:<10}",
        "BUSID", "VID:PID", "Manufacturer", "Product", "Serial", "State"
    );
    println!("{}", "-".repeat(104));

    for device in &devices {
        let record = &device.record;
        let state = if registry.is_exported(device.busid()) {
            "Bound"
        } else {
            "Not bound"
        };
        println!(
            "{:<14.14} {:<10} {:<20.20} {:<26.26} {:<20.20} {:<10}",
            device.busid(),
            format!("{:04x}:{:04x}", record.vendor_id, record.product_id),
            device.manufacturer.as_deref().unwrap_or("Unknown"),
            device.product.as_deref().unwrap_or("Unknown"),
            device.serial_number.as_deref().unwrap_or("N/A"),
            state,
        );
    }

    println!("\nTotal devices found: {}", devices.len());
    Ok(())
}

/// Persist a binding for one connected device
fn command_bind(mut registry: BindingRegistry, bus_id: &str) -> Result<()> {
    let backend = RusbBackend::new().context("Failed to initialize USB")?;
    let Some(device) = backend
        .device(bus_id)
        .context("Failed to enumerate USB devices")?
    else {
        bail!("No device found with bus id '{}'", bus_id);
    };

    let added = registry.add(BindingEntry {
        bus_id: bus_id.to_string(),
        vendor_id: format!("{:04x}", device.record.vendor_id),
        product_id: format!("{:04x}", device.record.product_id),
    });

    if added {
        registry.save().context("Failed to save bindings")?;
        println!("Device bound successfully: {}", bus_id);
        print_device_details(&device);
    } else {
        println!("Device is already bound: {}", bus_id);
    }
    Ok(())
}

/// Remove one binding, or all of them
fn command_unbind(
    mut registry: BindingRegistry,
    bus_id: Option<&str>,
    all: bool,
) -> Result<()> {
    if all {
        let count = registry.clear();
        registry.save().context("Failed to save bindings")?;
        if count > 0 {
            println!("Removed {} device binding(s).", count);
        } else {
            println!("No devices were bound.");
        }
        return Ok(());
    }

    let Some(bus_id) = bus_id else {
        bail!("--bus-id or --all is required");
    };

    if !registry.remove(bus_id) {
        bail!("Device is not bound: {}", bus_id);
    }
    registry.save().context("Failed to save bindings")?;
    println!("Device unbound successfully: {}", bus_id);
    Ok(())
}

/// Export all bound devices and serve until interrupted
async fn command_start(registry: BindingRegistry, addr: IpAddr, port: u16) -> Result<()> {
    if registry.entries().is_empty() {
        bail!("No devices are bound. Use 'usbipd bind --bus-id <BUSID>' to bind devices first.");
    }

    let backend = Arc::new(RusbBackend::new().context("Failed to initialize USB")?);

    let mut exportable = 0;
    for entry in registry.entries() {
        match backend.device(&entry.bus_id) {
            Ok(Some(_)) => {
                info!("Exporting device {}", entry.bus_id);
                exportable += 1;
            }
            Ok(None) => {
                warn!("Bound device {} is not connected, skipping", entry.bus_id);
            }
            Err(e) => {
                warn!("Could not check device {}: {:#}", entry.bus_id, e);
            }
        }
    }
    if exportable == 0 {
        bail!("No bound devices could be exported. Check that they are still connected.");
    }

    info!("usbipd v{}", env!("CARGO_PKG_VERSION"));
    let server = UsbIpServer::bind(SocketAddr::new(addr, port), backend, Arc::new(registry))
        .await
        .context("Failed to start server")?;

    tokio::select! {
        result = server.run() => result,
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, stopping");
            Ok(())
        }
    }
}

/// Human-readable rendering of one device, shown after a bind
fn print_device_details(device: &DeviceSnapshot) {
    let record = &device.record;

    println!("{}", "=".repeat(60));
    println!("Vendor ID:       0x{:04x}", record.vendor_id);
    println!("Product ID:      0x{:04x}", record.product_id);
    println!(
        "Device Class:    {:#04x}/{:#04x}/{:#04x}",
        record.device_class, record.device_subclass, record.device_protocol
    );
    println!("Speed:           {}", speed_label(record.speed));
    println!("Configurations:  {}", record.num_configurations);

    if let Some(ref manufacturer) = device.manufacturer {
        println!("Manufacturer:    {}", manufacturer);
    }
    if let Some(ref product) = device.product {
        println!("Product:         {}", product);
    }
    if let Some(ref serial) = device.serial_number {
        println!("Serial Number:   {}", serial);
    }

    for (index, interface) in record.interfaces.iter().enumerate() {
        println!(
            "  Interface {}: class {:#04x}/{:#04x}/{:#04x}",
            index, interface.class, interface.subclass, interface.protocol
        );
    }
    for endpoint in &device.endpoints {
        println!(
            "    Endpoint {:#04x}: {:?} {}, max packet {}",
            endpoint.address,
            endpoint.kind,
            endpoint.direction(),
            endpoint.max_packet_size
        );
    }
    println!("{}", "=".repeat(60));
}

fn speed_label(speed: DeviceSpeed) -> &'static str {
    match speed {
        DeviceSpeed::Low => "low (1.5 Mbit/s)",
        DeviceSpeed::Full => "full (12 Mbit/s)",
        DeviceSpeed::High => "high (480 Mbit/s)",
        DeviceSpeed::Wireless => "wireless",
        DeviceSpeed::Super => "super (5 Gbit/s)",
        DeviceSpeed::SuperPlus => "super+ (10 Gbit/s)",
        DeviceSpeed::Unknown => "unknown",
    }
}
