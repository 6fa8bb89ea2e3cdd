//! End-to-end session scenarios against a mock USB device.

mod mockusb;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use astra_update::usb::EnumerationGate;
use astra_update::{
    BootBundle, DeviceEvent, DevicePhase, DeviceSession, FlashPlan, StatusEvent, StatusSink,
    SIZE_REQUEST_IMAGE,
};

use mockusb::MockEndpointIo;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn status_channel() -> (StatusSink, mpsc::Receiver<StatusEvent>) {
    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    let sink: StatusSink = Arc::new(move |event| {
        let _ = tx.lock().unwrap().send(event);
    });
    (sink, rx)
}

fn write_bundle(root: &Path, uenv: bool, console: &str, files: &[(&str, &[u8])]) -> PathBuf {
    let dir = root.join("bundle");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("manifest.yaml"),
        format!(
            "id: \"test-bundle\"\n\
             chip: \"sl1680\"\n\
             board: \"rdk\"\n\
             console: \"{}\"\n\
             uenv_support: {}\n\
             vendor_id: \"06CB\"\n\
             product_id: \"00B1\"\n\
             secure_boot: \"genx\"\n\
             memory_layout: \"4gb\"\n\
             uboot: \"uboot\"\n",
            console, uenv
        ),
    )
    .unwrap();
    for (name, contents) in files {
        fs::write(dir.join(name), contents).unwrap();
    }
    dir
}

fn write_emmc_flash_dir(root: &Path) -> PathBuf {
    let dir = root.join("eMMCimg");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("emmc_part_list"), b"part1\n").unwrap();
    fs::write(dir.join("boot.subimg"), b"bootdata").unwrap();
    fs::write(dir.join("rootfs.subimg"), b"rootfs-payload-bytes").unwrap();
    fs::write(
        dir.join("emmc_image_list"),
        "boot.subimg,0x1000\nrootfs.subimg,0x2000\n",
    )
    .unwrap();
    dir
}

/// Pull device events until one matches, failing the test on timeout.
fn wait_for_device_event<F>(rx: &mpsc::Receiver<StatusEvent>, mut predicate: F) -> DeviceEvent
where
    F: FnMut(&DeviceEvent) -> bool,
{
    loop {
        match rx.recv_timeout(RECV_TIMEOUT).expect("status event") {
            StatusEvent::Device(event) => {
                if predicate(&event) {
                    return event;
                }
            }
            StatusEvent::Manager(_) => {}
        }
    }
}

fn new_session(
    io: MockEndpointIo,
    temp: &Path,
    boot_only: bool,
    boot_command: &str,
    sink: StatusSink,
    timeout: Duration,
) -> DeviceSession {
    DeviceSession::new(
        Box::new(io),
        temp,
        boot_only,
        boot_command,
        sink,
        Arc::new(EnumerationGate::new()),
        timeout,
    )
    .unwrap()
}

// -----------------------------------------------------------------------------
// Scenarios
// -----------------------------------------------------------------------------

/// uEnv-driven boot with an empty boot command: the host synthesizes
/// `uEnv.txt` with body `bootcmd=`, serves it as the final boot image, and
/// the user sees a single terminal Success event.
#[test]
fn uenv_boot_only_completes_on_uenv() {
    let root = tempfile::tempdir().unwrap();
    let bundle_dir = write_bundle(root.path(), true, "uart", &[]);
    let bundle = BootBundle::load(&bundle_dir).unwrap();

    let (sink, rx) = status_channel();
    let (io, device) = MockEndpointIo::new("1-2.3");
    let temp = root.path().join("state");
    fs::create_dir_all(&temp).unwrap();

    let session = new_session(io, &temp, true, "", sink, Duration::from_secs(10));
    session.boot(&bundle).unwrap();

    wait_for_device_event(&rx, |e| e.phase == DevicePhase::BootStart);

    device.request(0x70, "uEnv.txt");
    wait_for_device_event(&rx, |e| {
        e.phase == DevicePhase::ImageSendComplete && e.image == "uEnv.txt"
    });

    // Header: 8-byte payload, little endian, reserved zeros; then the body.
    let mut expected = Vec::new();
    expected.extend_from_slice(&8u32.to_le_bytes());
    expected.extend_from_slice(&[0, 0, 0, 0]);
    expected.extend_from_slice(b"bootcmd=");
    assert_eq!(device.bulk_bytes(), expected);
    assert_eq!(device.bulk_bytes().len(), 16);

    // The serving thread flips the phase right after the send completes.
    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    while session.phase() != DevicePhase::BootComplete {
        assert!(std::time::Instant::now() < deadline, "boot did not complete");
        std::thread::sleep(Duration::from_millis(10));
    }

    // The device reboots out of USB-download mode.
    device.disconnect();
    session.wait_for_completion();

    let done = wait_for_device_event(&rx, |e| e.phase == DevicePhase::BootComplete);
    assert_eq!(done.progress, 100);
    assert_eq!(done.image, "");
    assert_eq!(done.message, "Success");

    session.close();
}

/// eMMC update: the final flash image (tag > 0x79) arms the size echo;
/// `07_IMAGE` then carries the payload size and its serve completes the
/// update. Size-echo events never reach the sink.
#[test]
fn emmc_update_waits_for_size_echo() {
    let root = tempfile::tempdir().unwrap();
    let bundle_dir = write_bundle(root.path(), true, "uart", &[]);
    let bundle = BootBundle::load(&bundle_dir).unwrap();
    let flash_dir = write_emmc_flash_dir(root.path());
    let plan = FlashPlan::load(&flash_dir, &BTreeMap::new(), None).unwrap();
    assert_eq!(plan.final_image(), "rootfs.subimg");

    let (sink, rx) = status_channel();
    let (io, device) = MockEndpointIo::new("1-4");
    let temp = root.path().join("state");
    fs::create_dir_all(&temp).unwrap();

    let session = new_session(
        io,
        &temp,
        false,
        plan.flash_command(),
        sink,
        Duration::from_secs(10),
    );
    session.boot(&bundle).unwrap();
    session.update(&plan).unwrap();

    // Boot leg: the bundle's final boot image is the synthesized uEnv.txt.
    device.request(0x70, "uEnv.txt");
    let boot_done = wait_for_device_event(&rx, |e| e.phase == DevicePhase::BootComplete);
    assert_eq!(boot_done.message, "Success");

    // Update leg: the device asks for the final flash payload.
    device.request(0x80, "rootfs.subimg");
    wait_for_device_event(&rx, |e| {
        e.phase == DevicePhase::ImageSendComplete && e.image == "rootfs.subimg"
    });
    assert_eq!(session.phase(), DevicePhase::UpdateProgress);

    // The size echo now holds the payload size, little endian.
    let echo = fs::read(temp.join("device1-4").join(SIZE_REQUEST_IMAGE)).unwrap();
    assert_eq!(echo, (b"rootfs-payload-bytes".len() as u32).to_le_bytes());

    // Receipt confirmation: the device reads the echo back. The echo
    // serve emits no events, so poll the phase instead.
    device.request(0x01, SIZE_REQUEST_IMAGE);
    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    while session.phase() != DevicePhase::UpdateComplete {
        assert!(std::time::Instant::now() < deadline, "update did not complete");
        std::thread::sleep(Duration::from_millis(10));
    }

    device.disconnect();
    session.wait_for_completion();
    let done = wait_for_device_event(&rx, |e| e.phase == DevicePhase::UpdateComplete);
    assert_eq!(done.progress, 100);
    assert_eq!(done.message, "Success");

    session.close();

    // Nothing about 07_IMAGE is user-visible.
    while let Ok(event) = rx.try_recv() {
        if let StatusEvent::Device(device_event) = event {
            assert_ne!(device_event.image, SIZE_REQUEST_IMAGE);
        }
    }
}

/// SPI update on a USB-console device without uEnv support: the flash
/// command is typed at the U-Boot prompt, the size echo gates completion,
/// and the prompt's return triggers the reset command.
#[test]
fn usb_console_spi_update_types_commands() {
    let root = tempfile::tempdir().unwrap();
    let bundle_dir = write_bundle(
        root.path(),
        false,
        "usb",
        &[("gen3_uboot.bin.usb", b"uboot-stage" as &[u8])],
    );
    let bundle = BootBundle::load(&bundle_dir).unwrap();

    let flash_dir = root.path().join("spi");
    fs::create_dir_all(&flash_dir).unwrap();
    fs::write(flash_dir.join("uboot.bin"), b"spi-image").unwrap();
    let mut config = BTreeMap::new();
    config.insert("image_type".to_string(), "spi".to_string());
    config.insert("image_file".to_string(), "uboot.bin".to_string());
    let plan = FlashPlan::load(&flash_dir, &config, None).unwrap();

    let (sink, rx) = status_channel();
    let (io, device) = MockEndpointIo::new("1-7");
    let temp = root.path().join("state");
    fs::create_dir_all(&temp).unwrap();

    let session = new_session(io, &temp, false, "", sink, Duration::from_secs(10));
    session.boot(&bundle).unwrap();

    // Boot leg up to U-Boot.
    device.request(0x01, "gen3_uboot.bin.usb");
    wait_for_device_event(&rx, |e| e.phase == DevicePhase::BootComplete);

    // U-Boot announces its prompt; update() types the flash command.
    device.feed(b"=> ");
    session.update(&plan).unwrap();
    {
        let typed = device.interrupt_writes.lock().unwrap();
        assert_eq!(typed.len(), 1);
        let command = String::from_utf8(typed[0].clone()).unwrap();
        assert!(command.starts_with("usbload uboot.bin 0x10000000; spinit;"));
        assert!(command.ends_with("; sleep 1; reset\n"));
    }

    // Flash leg: final SPI payload, then the size-echo confirmation.
    device.request(0x85, "uboot.bin");
    wait_for_device_event(&rx, |e| {
        e.phase == DevicePhase::ImageSendComplete && e.image == "uboot.bin"
    });
    device.request(0x01, SIZE_REQUEST_IMAGE);
    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    while session.phase() != DevicePhase::UpdateComplete {
        assert!(std::time::Instant::now() < deadline, "update did not complete");
        std::thread::sleep(Duration::from_millis(10));
    }

    // The prompt returns after the flash; the host types the reset.
    device.feed(b"=> ");
    session.wait_for_completion();
    {
        let typed = device.interrupt_writes.lock().unwrap();
        assert_eq!(typed.len(), 2);
        assert_eq!(typed[1], b"reset\n");
    }

    let done = wait_for_device_event(&rx, |e| e.phase == DevicePhase::UpdateComplete);
    assert_eq!(done.message, "Success");

    session.close();
    assert!(device.is_closed());
}

/// The miniloader resets the device right after it is loaded; that
/// disconnect must not be reported as a failure.
#[test]
fn miniloader_disconnect_is_not_a_failure() {
    let root = tempfile::tempdir().unwrap();
    let bundle_dir = write_bundle(
        root.path(),
        false,
        "usb",
        &[("gen3_miniloader.bin.usb", b"mini" as &[u8])],
    );
    let bundle = BootBundle::load(&bundle_dir).unwrap();

    let (sink, rx) = status_channel();
    let (io, device) = MockEndpointIo::new("1-2");
    let temp = root.path().join("state");
    fs::create_dir_all(&temp).unwrap();

    let session = new_session(io, &temp, true, "", sink, Duration::from_secs(10));
    session.boot(&bundle).unwrap();

    device.request(0x01, "gen3_miniloader.bin.usb");
    wait_for_device_event(&rx, |e| {
        e.phase == DevicePhase::ImageSendComplete && e.image == "gen3_miniloader.bin.usb"
    });

    device.disconnect();
    session.close();

    // No failure phase and no disconnect message was reported.
    while let Ok(event) = rx.try_recv() {
        if let StatusEvent::Device(device_event) = event {
            assert!(!device_event.phase.is_failure(), "{:?}", device_event);
            assert_ne!(device_event.message, "Device disconnected");
        }
    }
}

/// No request within the deadline while booting is fatal, with an
/// operator-actionable message.
#[test]
fn boot_timeout_is_fatal_during_boot_progress() {
    let root = tempfile::tempdir().unwrap();
    let bundle_dir = write_bundle(root.path(), true, "uart", &[("boot1.bin", b"x" as &[u8])]);
    let bundle = BootBundle::load(&bundle_dir).unwrap();

    let (sink, rx) = status_channel();
    let (io, device) = MockEndpointIo::new("2-1");
    let temp = root.path().join("state");
    fs::create_dir_all(&temp).unwrap();

    let session = new_session(io, &temp, true, "", sink, Duration::from_millis(300));
    session.boot(&bundle).unwrap();

    // One served image moves the phase to BootProgress; then silence.
    device.request(0x01, "boot1.bin");
    wait_for_device_event(&rx, |e| {
        e.phase == DevicePhase::ImageSendComplete && e.image == "boot1.bin"
    });

    let fail = wait_for_device_event(&rx, |e| e.phase == DevicePhase::BootFail);
    assert!(fail.message.contains("Timeout during boot"), "{}", fail.message);
    assert!(fail.message.contains("USB_BOOT"), "{}", fail.message);
    assert_eq!(session.phase(), DevicePhase::BootFail);

    session.close();
}

/// A request for an unknown basename fails the running update.
#[test]
fn missing_image_fails_update() {
    let root = tempfile::tempdir().unwrap();
    let bundle_dir = write_bundle(root.path(), true, "uart", &[]);
    let bundle = BootBundle::load(&bundle_dir).unwrap();
    let flash_dir = write_emmc_flash_dir(root.path());
    let plan = FlashPlan::load(&flash_dir, &BTreeMap::new(), None).unwrap();

    let (sink, rx) = status_channel();
    let (io, device) = MockEndpointIo::new("3-1");
    let temp = root.path().join("state");
    fs::create_dir_all(&temp).unwrap();

    let session = new_session(
        io,
        &temp,
        false,
        plan.flash_command(),
        sink,
        Duration::from_secs(10),
    );
    session.boot(&bundle).unwrap();
    session.update(&plan).unwrap();

    device.request(0x70, "uEnv.txt");
    wait_for_device_event(&rx, |e| e.phase == DevicePhase::BootComplete);

    device.request(0x80, "nonexistent.img");
    let fail = wait_for_device_event(&rx, |e| e.phase == DevicePhase::UpdateFail);
    assert_eq!(fail.image, "nonexistent.img");
    assert!(fail.message.contains("image not found"), "{}", fail.message);
    assert_eq!(session.phase(), DevicePhase::UpdateFail);

    session.close();
}

/// Terminal phases are sticky: nothing served after a failure moves the
/// phase again.
#[test]
fn terminal_phase_never_changes() {
    let root = tempfile::tempdir().unwrap();
    let bundle_dir = write_bundle(root.path(), true, "uart", &[("boot1.bin", b"x" as &[u8])]);
    let bundle = BootBundle::load(&bundle_dir).unwrap();

    let (sink, rx) = status_channel();
    let (io, device) = MockEndpointIo::new("2-2");
    let temp = root.path().join("state");
    fs::create_dir_all(&temp).unwrap();

    let session = new_session(io, &temp, true, "", sink, Duration::from_secs(10));
    session.boot(&bundle).unwrap();

    device.request(0x01, "no-such-image.bin");
    wait_for_device_event(&rx, |e| e.phase == DevicePhase::BootFail);
    assert_eq!(session.phase(), DevicePhase::BootFail);

    // The serving thread is gone; further requests change nothing.
    device.request(0x01, "boot1.bin");
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(session.phase(), DevicePhase::BootFail);

    session.close();
    assert_eq!(session.phase(), DevicePhase::BootFail);
}

/// Request prefixes of the form `dir/name` are stripped before matching.
#[test]
fn request_prefix_is_stripped() {
    let root = tempfile::tempdir().unwrap();
    let bundle_dir = write_bundle(root.path(), true, "uart", &[("boot1.bin", b"abc" as &[u8])]);
    let bundle = BootBundle::load(&bundle_dir).unwrap();

    let (sink, rx) = status_channel();
    let (io, device) = MockEndpointIo::new("2-3");
    let temp = root.path().join("state");
    fs::create_dir_all(&temp).unwrap();

    let session = new_session(io, &temp, true, "", sink, Duration::from_secs(10));
    session.boot(&bundle).unwrap();

    device.request(0x01, "images/boot1.bin");
    let done = wait_for_device_event(&rx, |e| e.phase == DevicePhase::ImageSendComplete);
    assert_eq!(done.image, "boot1.bin");

    session.close();
}

/// Console frames (no request marker) accumulate in the console stream
/// and land in console.log.
#[test]
fn console_frames_accumulate() {
    let root = tempfile::tempdir().unwrap();
    let bundle_dir = write_bundle(root.path(), true, "uart", &[]);
    let bundle = BootBundle::load(&bundle_dir).unwrap();

    let (sink, _rx) = status_channel();
    let (io, device) = MockEndpointIo::new("2-4");
    let temp = root.path().join("state");
    fs::create_dir_all(&temp).unwrap();

    let session = new_session(io, &temp, true, "", sink, Duration::from_secs(10));
    session.boot(&bundle).unwrap();

    device.feed(b"U-Boot 2019.10\n");
    device.feed(b"=> ");
    assert_eq!(session.console_contents(), "U-Boot 2019.10\n=> ");

    let logged = fs::read_to_string(temp.join("device2-4").join("console.log")).unwrap();
    assert_eq!(logged, "U-Boot 2019.10\n=> ");

    session.close();
}
