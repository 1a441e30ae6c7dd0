//! UrjaP2P - peer-to-peer energy trading daemon
//!
//! One binary, three roles:
//!
//! - `sell`: await orders, switch the relay, stream meter readings and
//!   settle each trade
//! - `buy --channel N --energy WH`: place one order and track its delivery
//! - `meter`: dump local meter readings (no trading)
//!
//! `write-config` writes a starter TOML config to the configured path.

use std::env;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use urja_p2p::config::AppConfig;
use urja_p2p::devices::{MeterDriver, Pzem004t, UsbHidRelay};
use urja_p2p::error::{Error, Result};
use urja_p2p::sampler::{MeterSampler, PublishMode};
use urja_p2p::trading::{OrderCoordinator, OrderPlacer};
use urja_p2p::types::Order;
/// Default configuration path
const DEFAULT_CONFIG: &str = "/etc/urja-p2p.toml";

/// What the daemon was asked to do
enum Role {
    Sell,
    Buy { channel: u8, energy_wh: f64 },
    Meter,
    WriteConfig,
}

struct CliArgs {
    config_path: String,
    role: Role,
}

fn usage() -> ! {
    eprintln!(
        "Usage: urja-p2p [--config <path>] <role>\n\
         Roles:\n  \
         sell                                 serve energy orders\n  \
         buy --channel <n> --energy <wh>      place one order\n  \
         meter                                dump local meter readings\n  \
         write-config                         write a starter config file"
    );
    process::exit(2);
}

/// Hand-rolled argument parsing; the surface is too small for a parser
/// dependency
fn parse_args() -> CliArgs {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut config_path = DEFAULT_CONFIG.to_string();
    let mut role_name: Option<String> = None;
    let mut channel: Option<u8> = None;
    let mut energy_wh: Option<f64> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                config_path = args.get(i).cloned().unwrap_or_else(|| usage());
            }
            "--channel" | "-n" => {
                i += 1;
                channel = args.get(i).and_then(|s| s.parse().ok());
                if channel.is_none() {
                    usage();
                }
            }
            "--energy" | "-e" => {
                i += 1;
                energy_wh = args.get(i).and_then(|s| s.parse().ok());
                if energy_wh.is_none() {
                    usage();
                }
            }
            name if !name.starts_with('-') && role_name.is_none() => {
                role_name = Some(name.to_string());
            }
            _ => usage(),
        }
        i += 1;
    }

    let role = match role_name.as_deref() {
        Some("sell") => Role::Sell,
        Some("buy") => match (channel, energy_wh) {
            (Some(channel), Some(energy_wh)) => Role::Buy { channel, energy_wh },
            _ => usage(),
        },
        Some("meter") => Role::Meter,
        Some("write-config") => Role::WriteConfig,
        _ => usage(),
    };

    CliArgs { config_path, role }
}

fn main() {
    let args = parse_args();

    if let Role::WriteConfig = args.role {
        let config = AppConfig::field_defaults();
        if let Err(e) = config.to_file(&args.config_path) {
            eprintln!("failed to write {}: {}", args.config_path, e);
            process::exit(1);
        }
        println!("wrote starter config to {}", args.config_path);
        return;
    }

    let config = match AppConfig::from_file(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load {}: {}", args.config_path, e);
            process::exit(1);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.logging.level),
    )
    .init();
    log::info!("UrjaP2P v{} starting", env!("CARGO_PKG_VERSION"));
    log::info!("using config: {}", args.config_path);

    // Cooperative shutdown: Ctrl-C clears the flag every loop polls
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        r.store(false, Ordering::Relaxed);
    }) {
        log::warn!("failed to install Ctrl-C handler: {}", e);
    }

    let outcome = match args.role {
        Role::Sell => run_seller(&config, running),
        Role::Buy { channel, energy_wh } => run_buyer(&config, channel, energy_wh, running),
        Role::Meter => run_meter(&config, running),
        Role::WriteConfig => unreachable!(),
    };

    if let Err(e) = outcome {
        log::error!("{}", e);
        process::exit(1);
    }
    log::info!("UrjaP2P stopped");
}

/// Seller: open both devices (failures here abort startup), then serve
fn run_seller(config: &AppConfig, running: Arc<AtomicBool>) -> Result<()> {
    let relay = UsbHidRelay::open(&config.relay)?;

    let meter_config = config.meter.clone();
    let meter_factory = Box::new(move || {
        Pzem004t::open(&meter_config).map(|meter| Box::new(meter) as Box<dyn MeterDriver>)
    });
    // Probe the meter bus once so a dead port fails startup, not the
    // first session
    drop(meter_factory()?);

    let mut coordinator = OrderCoordinator::new(config, Box::new(relay), meter_factory)?;
    if config.relay.startup_test {
        coordinator.startup_test()?;
    }
    coordinator.serve(running)
}

/// Buyer: place one order, watch delivery, send the final STOP
fn run_buyer(
    config: &AppConfig,
    channel: u8,
    energy_wh: f64,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let order = Order::new(channel, energy_wh)?;
    let placer = OrderPlacer::new(config)?;
    let outcome = placer.run(order, running)?;
    if !outcome.completed {
        return Err(Error::Other(format!(
            "order ended early at {:.2}Wh of {:.2}Wh",
            outcome.delivered_wh, energy_wh
        )));
    }
    Ok(())
}

/// Standalone metering: local dump only, until Ctrl-C
fn run_meter(config: &AppConfig, running: Arc<AtomicBool>) -> Result<()> {
    let meter = Pzem004t::open(&config.meter)?;
    let handle = MeterSampler::new(
        Box::new(meter),
        PublishMode::Local,
        config.meter.poll_interval(),
    )
    .spawn()?;

    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(250));
    }
    handle.stop();
    Ok(())
}
