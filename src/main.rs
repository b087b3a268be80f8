use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::ops::Deref;
use std::sync::mpsc;
use std::{panic, thread};

use battgo_lib::battery::{Battery, BatteryHandle};
use battgo_lib::controller::Controller;
use battgo_lib::device::FunctionalDevice;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

const fn about_text() -> &'static str {
    "battgo battery bus monitor"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
struct CliArgs {
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,

    /// Device
    #[arg(short, long, default_value_t = default_device_name())]
    device: String,

    /// Number of devices on the bus: a fixed count, '0' to scan
    /// continuously, or '-1' to scan adaptively
    #[arg(short = 'n', long, default_value_t = -1, allow_hyphen_values = true)]
    devices: i32,
}

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let phy = battgo_lib::serialport::open(&args.device)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;

    let (update_tx, update_rx) = mpsc::sync_channel::<BatteryHandle>(1);
    thread::spawn(move || {
        for battery in update_rx {
            let data = battery.data();
            match serde_json::to_string_pretty(&*data) {
                Ok(json) => info!("{json}"),
                Err(err) => warn!("Cannot serialize battery data: {err}"),
            }
        }
    });

    let mut controller = Controller::new(phy, args.devices, move |device| {
        Some(Box::new(Battery::new(device, update_tx.clone())) as Box<dyn FunctionalDevice>)
    });

    controller.run().context("Bus controller failed")
}
