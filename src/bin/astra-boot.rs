//! astra-boot command line interface.

use std::collections::HashMap;
use std::path::Path;
use std::process;
use std::sync::mpsc;
use std::sync::Arc;

use clap::{crate_version, App, AppSettings::*, Arg};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;

use astra_update::{
    DeviceManager, DevicePhase, ManagerStatus, SettingsBuilder, StatusEvent,
};

fn main() {
    println!("Astra Boot v{}\n", crate_version!());

    let matches = App::new("astra-boot")
        .version(format!("v{}", crate_version!()).as_str())
        .about("Astra USB Boot Utility")
        .long_about(
            "\n\
            astra-boot works in tandem with the ROM of an Astra SoC held in \
            USB-download mode. The device asks for its boot stages by name \
            over a USB interrupt endpoint and astra-boot answers each \
            request by streaming the file, length-prefixed, over the bulk \
            endpoint until the device reaches U-Boot (or Linux, for \
            Linux-capable bundles).\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .arg(
            Arg::with_name("BOOT_BUNDLE")
                .help("path of the boot bundle to serve")
                .index(1)
                .required(true),
        )
        .arg(
            Arg::with_name("LOG")
                .help("log file path")
                .short("-l")
                .long("--log")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("DEBUG")
                .help("enable debug logging")
                .short("-D")
                .long("--debug"),
        )
        .arg(
            Arg::with_name("CONTINUOUS")
                .help("keep serving devices after the first one boots")
                .short("-C")
                .long("--continuous"),
        )
        .arg(
            Arg::with_name("TEMP_DIR")
                .help("temporary directory holding per-device state")
                .short("-T")
                .long("--temp-dir")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("USB_DEBUG")
                .help("enable libusb debug logging")
                .short("-u")
                .long("--usb-debug"),
        )
        .arg(
            Arg::with_name("SIMPLE_PROGRESS")
                .help("print progress messages instead of progress bars")
                .short("-S")
                .long("--simple-progress"),
        )
        .arg(
            Arg::with_name("BOOT_COMMAND")
                .help("command baked into the synthesized uEnv.txt")
                .short("-o")
                .long("--boot-command")
                .takes_value(true)
                .default_value(""),
        )
        .arg(
            Arg::with_name("PORT")
                .help("comma-separated USB bus-path prefixes to accept")
                .short("-p")
                .long("--port")
                .takes_value(true),
        )
        .arg(Arg::with_name("v").short("v").multiple(true).help(
            "Sets the logging level of verbosity, repeat several times for \
                higher verbosity",
        ))
        .get_matches();

    let log_level = if matches.is_present("DEBUG") {
        LevelFilter::Debug
    } else {
        match matches.occurrences_of("v") {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    // libusb writes straight to stdout and would fight the bars.
    let simple_progress =
        matches.is_present("SIMPLE_PROGRESS") || matches.is_present("USB_DEBUG");

    let mut settings = SettingsBuilder::new()
        .continuous(matches.is_present("CONTINUOUS"))
        .usb_debug(matches.is_present("USB_DEBUG"))
        .log_level(log_level)
        .finalize();
    if let Some(log) = matches.value_of("LOG") {
        settings.log_path = Some(log.into());
    }
    if let Some(temp) = matches.value_of("TEMP_DIR") {
        settings.temp_dir = Some(temp.into());
    }
    if let Some(ports) = matches.value_of("PORT") {
        settings.filter_ports = Some(ports.into());
    }

    let bundle_path = matches.value_of("BOOT_BUNDLE").unwrap().to_string();
    let boot_command = matches.value_of("BOOT_COMMAND").unwrap().to_string();

    let (tx, rx) = mpsc::channel::<StatusEvent>();

    let interrupt_tx = tx.clone();
    ctrlc::set_handler(move || {
        println!("\nreceived Ctrl+C, shutting down");
        let _ = interrupt_tx.send(StatusEvent::manager(ManagerStatus::Shutdown, "Interrupted"));
    })
    .expect("failed to install the Ctrl-C handler");

    let sink_tx = std::sync::Mutex::new(tx.clone());
    let sink = Arc::new(move |event: StatusEvent| {
        let _ = sink_tx.lock().unwrap().send(event);
    });

    let manager = match DeviceManager::new(sink, settings) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("{}: {}", style("error").red(), e);
            process::exit(-1);
        }
    };

    if let Err(e) = manager.boot(Path::new(&bundle_path), &boot_command) {
        eprintln!("{}: failed to initialize boot: {}", style("error").red(), e);
        process::exit(-1);
    }

    let mut bars: HashMap<(String, String), ProgressBar> = HashMap::new();

    for event in rx.iter() {
        match event {
            StatusEvent::Manager(manager_event) => match manager_event.status {
                ManagerStatus::Start | ManagerStatus::Info => {
                    println!("{}\n", manager_event.message);
                }
                ManagerStatus::Failure => {
                    eprintln!("{}: {}", style("failure").red(), manager_event.message);
                }
                ManagerStatus::Shutdown => break,
            },
            StatusEvent::Device(device) => match device.phase {
                DevicePhase::Added => {
                    println!("Detected Device: {}", device.device);
                }
                DevicePhase::BootStart => {
                    println!("Booting Device: {}", device.device);
                }
                DevicePhase::BootComplete => {
                    println!(
                        "{} Booting {} is complete",
                        style("✔").green(),
                        device.device
                    );
                }
                DevicePhase::BootFail => {
                    eprintln!(
                        "{} Device: {} Boot Failed: {}",
                        style("✘").red(),
                        device.device,
                        device.message
                    );
                }
                DevicePhase::ImageSendStart
                | DevicePhase::ImageSendProgress
                | DevicePhase::ImageSendComplete => {
                    if simple_progress {
                        println!(
                            "Device: {} Image: {} Progress: {}",
                            device.device, device.image, device.progress
                        );
                    } else {
                        update_progress_bar(&mut bars, &device);
                    }
                }
                _ => {}
            },
        }
    }

    if manager.shutdown() {
        eprintln!(
            "Error reported: please check the log file for more information: {}",
            manager.log_file().display()
        );
        process::exit(-1);
    }
}

fn update_progress_bar(
    bars: &mut HashMap<(String, String), ProgressBar>,
    device: &astra_update::DeviceEvent,
) {
    let key = (device.device.clone(), device.image.clone());
    let bar = bars.entry(key).or_insert_with(|| {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{elapsed_precise}] [{bar:50.green}] {pos:>3}% {msg}")
                .progress_chars("=> "),
        );
        bar.set_prefix(format!("{}:", device.device));
        bar.set_message(device.image.clone());
        bar
    });

    bar.set_position(device.progress as u64);
    if device.progress >= 100 {
        bar.finish();
    }
}
