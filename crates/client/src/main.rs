//! USB passthrough client
//!
//! Command-line front end for the host's USB passthrough broker.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client::config::{ClientConfig, TransportKind};
use client::{
    ApiClient, BrokerConnector, ChannelHandler, Device, DeviceController, DeviceStore,
    ListenerEvent, NotificationListener, Registry, SelectOutcome, SelectVmRequest, StoreEvent,
};
use common::{Connector, setup_logging};
use serde::Serialize;
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-passthrough-client")]
#[command(author, version, about = "USB passthrough client - move host USB devices between VMs")]
#[command(long_about = "
Client for the host-side USB passthrough broker. Lists the USB devices the
broker manages, passes them to VMs and follows the broker's notifications.

EXAMPLES:
    # Follow notifications (default command)
    usb-passthrough-client

    # List devices and their current VM
    usb-passthrough-client list

    # Pass a device to a VM, by label or device node
    usb-passthrough-client attach \"Mass Storage\" vm-business

    # Take it back
    usb-passthrough-client detach /dev/bus/usb/001/004

    # Talk to a broker on another vsock port
    usb-passthrough-client --cid 2 --port 2001 list

CONFIGURATION:
    The client looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-passthrough/client.toml
    3. /etc/usb-passthrough/client.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Broker vsock context id
    #[arg(long, value_name = "CID", global = true)]
    cid: Option<u32>,

    /// Broker vsock port
    #[arg(long, value_name = "PORT", global = true)]
    port: Option<u32>,

    /// Connect through a Unix socket instead of vsock
    #[arg(long, value_name = "PATH", global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices and the VM each one is passed to
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Pass a device to a VM ("None" detaches it)
    Attach {
        /// Device label or device node
        device: String,
        /// Target VM
        vm: String,
    },
    /// Return a device to the host
    Detach {
        /// Device label or device node
        device: String,
    },
    /// Follow broker notifications until Ctrl+C
    Monitor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = ClientConfig::default();
        let path = ClientConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        ClientConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ClientConfig::load_or_default()
    };
    apply_overrides(&mut config, &args);

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.client.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("USB passthrough client v{}", env!("CARGO_PKG_VERSION"));

    config.validate().context("Invalid configuration")?;
    let connector = config.connector()?;
    info!("Broker: {}", connector.describe());

    let mut api = ApiClient::new(connector.clone());
    if let Some(max) = config.listener.max_frame_size {
        api = api.with_max_frame_size(max);
    }
    let (store, store_events) = DeviceStore::new(api, config.refresh_policy());

    match args.command.unwrap_or(Command::Monitor) {
        Command::List { json } => {
            store.refresh().await?;
            print_registry(&store.snapshot().await, json)?;
        }
        Command::Attach { device, vm } => {
            store.refresh().await?;
            select(&DeviceController::new(store), &device, &vm).await?;
        }
        Command::Detach { device } => {
            store.refresh().await?;
            select(&DeviceController::new(store), &device, "None").await?;
        }
        Command::Monitor => monitor(&config, connector, store, store_events).await?,
    }

    Ok(())
}

fn apply_overrides(config: &mut ClientConfig, args: &Args) {
    if let Some(cid) = args.cid {
        config.broker.cid = cid;
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    if let Some(ref socket) = args.socket {
        config.broker.transport = TransportKind::Unix;
        config.broker.socket_path = Some(socket.to_string_lossy().into_owned());
    }
}

async fn select(controller: &DeviceController<BrokerConnector>, device: &str, vm: &str) -> Result<()> {
    match controller.select_target(device, vm).await? {
        SelectOutcome::Unchanged { label } => println!("{} is already on {}", label, vm),
        SelectOutcome::Attached { label, vm } => println!("{} passed to {}", label, vm),
        SelectOutcome::Detached { label } => println!("{} detached", label),
    }
    Ok(())
}

async fn monitor(
    config: &ClientConfig,
    connector: BrokerConnector,
    store: DeviceStore<BrokerConnector>,
    store_events: async_channel::Receiver<StoreEvent>,
) -> Result<()> {
    let (handler, notifications) = ChannelHandler::new();
    let listener = NotificationListener::new(connector, handler)
        .with_config(config.listener_config())
        .spawn();

    store.spawn_refresh();

    loop {
        tokio::select! {
            notification = notifications.recv() => {
                match notification {
                    Ok(ListenerEvent::Refresh) => {
                        store.spawn_refresh();
                    }
                    Ok(ListenerEvent::SelectVm(request)) => print_select_request(&request),
                    Err(_) => break,
                }
            }
            event = store_events.recv() => {
                match event {
                    Ok(StoreEvent::Refreshed { .. }) => print_registry(&store.snapshot().await, false)?,
                    Ok(StoreEvent::RefreshFailed { attempts, error }) => {
                        eprintln!("Device list unavailable after {} attempts: {}", attempts, error);
                    }
                    Err(_) => break,
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    listener.shutdown();
    listener.abort();
    if let Err(e) = listener.join().await
        && !e.is_cancelled()
    {
        warn!("Notification listener ended abnormally: {}", e);
    }
    Ok(())
}

#[derive(Serialize)]
struct DeviceRow<'a> {
    label: &'a str,
    #[serde(flatten)]
    device: &'a Device,
}

fn print_registry(registry: &Registry, as_json: bool) -> Result<()> {
    if as_json {
        let devices: Vec<_> = registry
            .iter()
            .map(|(label, device)| DeviceRow { label, device })
            .collect();
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if registry.is_empty() {
        println!("No devices");
        return Ok(());
    }

    let width = registry.labels().map(|l| l.chars().count()).max().unwrap_or(0);
    for (label, device) in registry.iter() {
        println!(
            "{:<width$}  {:<12}  {}  [{}]",
            label,
            device.vm,
            device.device_node,
            device.allowed_vms.join(", "),
            width = width
        );
    }
    Ok(())
}

fn print_select_request(request: &SelectVmRequest) {
    println!(
        "Select a VM for {} ({}): {}{}",
        request.product_name,
        request.device_node().unwrap_or("unknown node"),
        request.allowed_vms.join(", "),
        request
            .vm
            .as_deref()
            .map(|vm| format!(" (currently {})", vm))
            .unwrap_or_default()
    );
}
