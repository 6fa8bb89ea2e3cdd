//! astra-update command line interface.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process;
use std::sync::mpsc;
use std::sync::Arc;

use clap::{crate_version, App, AppSettings::*, Arg};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;

use astra_update::{
    DeviceManager, DevicePhase, FlashPlan, ManagerStatus, SettingsBuilder, StatusEvent,
};

fn main() {
    println!("Astra Update v{}\n", crate_version!());

    let matches = App::new("astra-update")
        .version(format!("v{}", crate_version!()).as_str())
        .about("Astra USB Update Utility")
        .long_about(
            "\n\
            astra-update boots an Astra SoC held in USB-download mode and \
            then flashes an eMMC or SPI image: the device is first served a \
            boot bundle until U-Boot is up, after which the flash command \
            runs (typed into the U-Boot console or baked into uEnv.txt) \
            while the requested flash payloads stream over USB.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .arg(
            Arg::with_name("BUNDLES")
                .help("directory holding the boot bundle collection")
                .short("-B")
                .long("--bundles")
                .takes_value(true)
                .default_value("astra-usbboot-images"),
        )
        .arg(
            Arg::with_name("FLASH")
                .help("flash image path")
                .short("-f")
                .long("--flash")
                .takes_value(true)
                .default_value("eMMCimg"),
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
                .help("keep updating devices as they arrive")
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
            Arg::with_name("BOARD")
                .help("board name")
                .short("-b")
                .long("--board")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("CHIP")
                .help("chip name")
                .short("-c")
                .long("--chip")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("MANIFEST")
                .help("flash manifest file path")
                .short("-M")
                .long("--manifest")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("BUNDLE_ID")
                .help("pin a specific boot bundle id")
                .short("-i")
                .long("--bundle-id")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("IMAGE_TYPE")
                .help("flash image type")
                .short("-t")
                .long("--image-type")
                .takes_value(true)
                .possible_values(&["spi", "nand", "emmc"]),
        )
        .arg(
            Arg::with_name("SECURE_BOOT")
                .help("secure boot version")
                .short("-s")
                .long("--secure-boot")
                .takes_value(true)
                .default_value("genx"),
        )
        .arg(
            Arg::with_name("MEMORY_LAYOUT")
                .help("memory layout")
                .short("-m")
                .long("--memory-layout")
                .takes_value(true)
                .possible_values(&["1gb", "2gb", "3gb", "4gb"]),
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

    // Command line values take precedence over the flash manifest.
    let mut config = BTreeMap::new();
    if let Some(board) = matches.value_of("BOARD") {
        config.insert("board".to_string(), board.to_string());
    }
    if let Some(chip) = matches.value_of("CHIP") {
        config.insert("chip".to_string(), chip.to_string());
    }
    if let Some(image_type) = matches.value_of("IMAGE_TYPE") {
        config.insert("image_type".to_string(), image_type.to_string());
    }
    if let Some(id) = matches.value_of("BUNDLE_ID") {
        config.insert("boot_image".to_string(), id.to_string());
    }
    if let Some(secure_boot) = matches.value_of("SECURE_BOOT") {
        config.insert("secure_boot".to_string(), secure_boot.to_string());
    }
    if let Some(layout) = matches.value_of("MEMORY_LAYOUT") {
        config.insert("memory_layout".to_string(), layout.to_string());
    }

    let flash_path = matches.value_of("FLASH").unwrap().to_string();
    let bundles_path = matches.value_of("BUNDLES").unwrap().to_string();
    let manifest = matches.value_of("MANIFEST").map(Path::new);

    let plan = match FlashPlan::load(Path::new(&flash_path), &config, manifest) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!(
                "{}: failed to load flash image: {}",
                style("error").red(),
                e
            );
            process::exit(-1);
        }
    };
    println!("{}\n", plan.description());

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

    if let Err(e) = manager.update(plan, Path::new(&bundles_path)) {
        eprintln!(
            "{}: failed to initialize update: {}",
            style("error").red(),
            e
        );
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
                DevicePhase::BootFail => {
                    eprintln!(
                        "{} Device: {} Boot Failed: {}",
                        style("✘").red(),
                        device.device,
                        device.message
                    );
                }
                DevicePhase::UpdateComplete => {
                    println!(
                        "{} Device: {} Update Complete",
                        style("✔").green(),
                        device.device
                    );
                }
                DevicePhase::UpdateFail => {
                    eprintln!(
                        "{} Device: {} Update Failed: {}",
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
