//! Boot bundles: a directory of first-stage USB-download payloads plus a
//! `manifest.yaml` describing the device they target.
//!
//! A bundle is loaded once and immutable afterwards. A [`BundleCollection`]
//! holds every bundle found under a root directory and can pick the best
//! match for a flash plan when no bundle id was pinned.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::Deserialize;

use crate::error::ManagerError;
use crate::image::{Image, ImageKind};

// =============================================================================
// Public Interface
// =============================================================================

/// Secure-boot generation of the target SoC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureBoot {
    V2,
    V3,
}

impl SecureBoot {
    pub fn parse(s: &str) -> SecureBoot {
        if s.eq_ignore_ascii_case("gen2") {
            SecureBoot::V2
        } else {
            SecureBoot::V3
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SecureBoot::V2 => "gen2",
            SecureBoot::V3 => "genx",
        }
    }
}

impl fmt::Display for SecureBoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the U-Boot console of the bundle is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UbootConsole {
    Uart,
    Usb,
}

/// Which U-Boot build the bundle ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UbootVariant {
    Unknown,
    Stock,
    Vendor,
}

/// DDR memory size the boot stages are built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLayout {
    OneGb,
    TwoGb,
    ThreeGb,
    FourGb,
}

impl MemoryLayout {
    pub fn parse(s: &str) -> Result<MemoryLayout, ManagerError> {
        match s.to_ascii_lowercase().as_str() {
            "1gb" => Ok(MemoryLayout::OneGb),
            "2gb" => Ok(MemoryLayout::TwoGb),
            "3gb" => Ok(MemoryLayout::ThreeGb),
            "4gb" => Ok(MemoryLayout::FourGb),
            other => Err(ManagerError::ConfigInvalid(format!(
                "invalid memory layout: {}",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryLayout::OneGb => "1GB",
            MemoryLayout::TwoGb => "2GB",
            MemoryLayout::ThreeGb => "3GB",
            MemoryLayout::FourGb => "4GB",
        }
    }
}

impl fmt::Display for MemoryLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// DDR silicon type, used for bundle matching only when specified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdrType {
    NotSpecified,
    Ddr3,
    Ddr4,
    Lpddr4,
    Lpddr4x,
    Ddr4x16,
}

impl DdrType {
    pub fn parse(s: &str) -> DdrType {
        match s.to_ascii_lowercase().as_str() {
            "ddr3" => DdrType::Ddr3,
            "ddr4" => DdrType::Ddr4,
            "lpddr4" => DdrType::Lpddr4,
            "lpddr4x" => DdrType::Lpddr4x,
            "ddr4x16" => DdrType::Ddr4x16,
            _ => DdrType::NotSpecified,
        }
    }
}

/// A loaded boot bundle.
#[derive(Debug)]
pub struct BootBundle {
    path: PathBuf,
    directory_name: String,
    images: Vec<Image>,
    id: String,
    chip: String,
    board: String,
    uenv_support: bool,
    secure_boot: SecureBoot,
    console: UbootConsole,
    memory_layout: MemoryLayout,
    ddr_type: DdrType,
    vendor_id: u16,
    product_id: u16,
    uboot_variant: UbootVariant,
    final_boot_image: String,
    linux_boot: bool,
}

impl BootBundle {
    /// Load a bundle from a directory containing `manifest.yaml`.
    pub fn load(path: impl Into<PathBuf>) -> Result<BootBundle, ManagerError> {
        let path = path.into();
        if !path.is_dir() {
            return Err(ManagerError::BundleNotFound(format!(
                "{} is not a bundle directory",
                path.display()
            )));
        }

        let manifest = Manifest::load(&path.join("manifest.yaml"))?;

        let mut images = Vec::new();
        for entry in std::fs::read_dir(&path).map_err(|e| {
            ManagerError::ConfigInvalid(format!("cannot read {}: {}", path.display(), e))
        })? {
            let entry = entry
                .map_err(|e| ManagerError::ConfigInvalid(format!("cannot read entry: {}", e)))?;
            debug!("found file: {}", entry.path().display());
            if entry.file_name() != "manifest.yaml" && entry.path().is_file() {
                images.push(Image::new(entry.path(), ImageKind::BootStage));
            }
        }

        // Bundles carrying a kernel and a ramdisk boot straight into Linux;
        // the ramdisk is then the last image the ROM requests.
        let (linux_boot, final_boot_image) = if path.join("Image.gz").exists()
            && path.join("ramdisk.cpio.gz").exists()
        {
            (true, "ramdisk.cpio.gz".to_string())
        } else if path.join("Image").exists() && path.join("rootfs.cpio.gz").exists() {
            (true, "rootfs.cpio.gz".to_string())
        } else {
            let final_image = match manifest.secure_boot {
                SecureBoot::V2 => "minildr.img",
                SecureBoot::V3 => {
                    if manifest.uenv_support {
                        "uEnv.txt"
                    } else {
                        "gen3_uboot.bin.usb"
                    }
                }
            };
            (false, final_image.to_string())
        };

        let directory_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!("loaded boot bundle: {}", directory_name);

        Ok(BootBundle {
            path,
            directory_name,
            images,
            id: manifest.id,
            chip: manifest.chip,
            board: manifest.board,
            uenv_support: manifest.uenv_support,
            secure_boot: manifest.secure_boot,
            console: manifest.console,
            memory_layout: manifest.memory_layout,
            ddr_type: manifest.ddr_type,
            vendor_id: manifest.vendor_id,
            product_id: manifest.product_id,
            uboot_variant: manifest.uboot_variant,
            final_boot_image,
            linux_boot,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn chip(&self) -> &str {
        &self.chip
    }

    pub fn board(&self) -> &str {
        &self.board
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    pub fn uenv_support(&self) -> bool {
        self.uenv_support
    }

    pub fn secure_boot(&self) -> SecureBoot {
        self.secure_boot
    }

    pub fn console(&self) -> UbootConsole {
        self.console
    }

    pub fn memory_layout(&self) -> MemoryLayout {
        self.memory_layout
    }

    pub fn ddr_type(&self) -> DdrType {
        self.ddr_type
    }

    pub fn uboot_variant(&self) -> UbootVariant {
        self.uboot_variant
    }

    pub fn final_boot_image(&self) -> &str {
        &self.final_boot_image
    }

    pub fn is_linux_boot(&self) -> bool {
        self.linux_boot
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Multi-line description shown to the user when the manager starts.
    pub fn description(&self) -> String {
        format!(
            "Boot Bundle: {} {} ({})\n    \
             Secure Boot: {}\n    \
             Memory Layout: {}\n    \
             U-Boot Console: {}\n    \
             uEnv.txt Support: {}\n    \
             U-Boot Variant: {}",
            self.chip,
            self.board,
            self.id,
            self.secure_boot,
            self.memory_layout,
            match self.console {
                UbootConsole::Uart => "UART",
                UbootConsole::Usb => "USB",
            },
            if self.uenv_support {
                "enabled"
            } else {
                "disabled"
            },
            match self.uboot_variant {
                UbootVariant::Vendor => "Vendor U-Boot",
                _ => "U-Boot",
            },
        )
    }
}

/// All bundles found under a root directory, one subdirectory per bundle.
#[derive(Debug, Default)]
pub struct BundleCollection {
    bundles: Vec<Arc<BootBundle>>,
}

impl BundleCollection {
    /// Load every subdirectory of `root` that carries a `manifest.yaml`.
    pub fn load(root: &Path) -> Result<BundleCollection, ManagerError> {
        debug!("loading boot bundles from {}", root.display());

        if !root.exists() {
            return Err(ManagerError::BundleNotFound(format!(
                "boot bundle directory {} not found",
                root.display()
            )));
        }

        let mut bundles = Vec::new();
        if root.is_dir() {
            for entry in std::fs::read_dir(root).map_err(|e| {
                ManagerError::ConfigInvalid(format!("cannot read {}: {}", root.display(), e))
            })? {
                let entry = entry.map_err(|e| {
                    ManagerError::ConfigInvalid(format!("cannot read entry: {}", e))
                })?;
                let path = entry.path();
                if path.is_dir() && path.join("manifest.yaml").exists() {
                    let bundle = BootBundle::load(&path)?;
                    info!("loaded boot bundle: {} {}", bundle.chip(), bundle.board());
                    bundles.push(Arc::new(bundle));
                }
            }
        }

        Ok(BundleCollection { bundles })
    }

    pub fn bundles(&self) -> &[Arc<BootBundle>] {
        &self.bundles
    }

    pub fn get(&self, id: &str) -> Option<Arc<BootBundle>> {
        self.bundles.iter().find(|b| b.id() == id).cloned()
    }

    /// Bundles matching the given hardware description. Board and DDR type
    /// only participate when specified.
    pub fn matching(
        &self,
        chip: &str,
        secure_boot: SecureBoot,
        memory_layout: MemoryLayout,
        ddr_type: DdrType,
        board: &str,
    ) -> Vec<Arc<BootBundle>> {
        self.bundles
            .iter()
            .filter(|b| {
                b.chip() == chip
                    && b.secure_boot() == secure_boot
                    && b.memory_layout() == memory_layout
                    && (board.is_empty() || b.board() == board)
                    && (ddr_type == DdrType::NotSpecified || b.ddr_type() == ddr_type)
            })
            .cloned()
            .collect()
    }

    /// Pick the best bundle among `candidates`:
    /// vendor U-Boot with uEnv, then any bundle with uEnv, then a bundle
    /// with USB console when nothing has uEnv, then the first match.
    pub fn best_match(candidates: &[Arc<BootBundle>]) -> Option<Arc<BootBundle>> {
        let mut best = candidates.first().cloned()?;

        for bundle in candidates {
            info!("boot bundle candidate: {} {}", bundle.chip(), bundle.board());
            if bundle.uboot_variant() == UbootVariant::Vendor && bundle.uenv_support() {
                return Some(Arc::clone(bundle));
            } else if bundle.uenv_support() {
                best = Arc::clone(bundle);
            } else if !best.uenv_support() && bundle.console() == UbootConsole::Usb {
                best = Arc::clone(bundle);
            }
        }

        Some(best)
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// `manifest.yaml` as written on disk; converted into typed fields.
#[derive(Debug, Deserialize)]
struct RawManifest {
    id: String,
    chip: String,
    board: String,
    console: String,
    uenv_support: bool,
    vendor_id: String,
    product_id: String,
    secure_boot: String,
    memory_layout: String,
    uboot: String,
    ddr_type: Option<String>,
}

struct Manifest {
    id: String,
    chip: String,
    board: String,
    console: UbootConsole,
    uenv_support: bool,
    vendor_id: u16,
    product_id: u16,
    secure_boot: SecureBoot,
    memory_layout: MemoryLayout,
    ddr_type: DdrType,
    uboot_variant: UbootVariant,
}

impl Manifest {
    fn load(path: &Path) -> Result<Manifest, ManagerError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ManagerError::ConfigInvalid(format!(
                "unable to open the manifest file {}: {}",
                path.display(),
                e
            ))
        })?;
        let raw: RawManifest = serde_yaml::from_str(&contents)?;

        let console = if raw.console == "uart" {
            UbootConsole::Uart
        } else {
            UbootConsole::Usb
        };
        let vendor_id = parse_hex_id(&raw.vendor_id)?;
        let product_id = parse_hex_id(&raw.product_id)?;
        let secure_boot = SecureBoot::parse(&raw.secure_boot);
        let memory_layout = MemoryLayout::parse(&raw.memory_layout)?;
        let ddr_type = raw
            .ddr_type
            .as_deref()
            .map(DdrType::parse)
            .unwrap_or(DdrType::NotSpecified);
        let uboot_variant = match raw.uboot.to_ascii_lowercase().as_str() {
            "uboot" => UbootVariant::Stock,
            "suboot" => UbootVariant::Vendor,
            _ => UbootVariant::Unknown,
        };

        info!("loaded boot bundle manifest: {} {}", raw.chip, raw.board);
        info!("id: {}", raw.id);
        info!("secure boot version: {}", secure_boot);
        info!("vendor id: {:#06X}", vendor_id);
        info!("product id: {:#06X}", product_id);
        info!("uEnv support: {}", raw.uenv_support);
        info!("memory layout: {}", memory_layout);

        Ok(Manifest {
            id: raw.id,
            chip: raw.chip,
            board: raw.board,
            console,
            uenv_support: raw.uenv_support,
            vendor_id,
            product_id,
            secure_boot,
            memory_layout,
            ddr_type,
            uboot_variant,
        })
    }
}

fn parse_hex_id(s: &str) -> Result<u16, ManagerError> {
    let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16)
        .map_err(|_| ManagerError::ConfigInvalid(format!("invalid hex device id: {}", s)))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_bundle(
        root: &Path,
        name: &str,
        uenv: bool,
        uboot: &str,
        console: &str,
        files: &[&str],
    ) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("manifest.yaml"),
            format!(
                "id: \"{}\"\n\
                 chip: \"sl1680\"\n\
                 board: \"rdk\"\n\
                 console: \"{}\"\n\
                 uenv_support: {}\n\
                 vendor_id: \"06CB\"\n\
                 product_id: \"00B1\"\n\
                 secure_boot: \"GENX\"\n\
                 memory_layout: \"4GB\"\n\
                 uboot: \"{}\"\n",
                name, console, uenv, uboot
            ),
        )
        .unwrap();
        for f in files {
            fs::write(dir.join(f), b"x").unwrap();
        }
        dir
    }

    #[test]
    fn manifest_fields() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_bundle(
            root.path(),
            "b1",
            true,
            "suboot",
            "usb",
            &["gen3_uboot.bin.usb"],
        );
        let bundle = BootBundle::load(&dir).unwrap();
        assert_eq!(bundle.id(), "b1");
        assert_eq!(bundle.chip(), "sl1680");
        assert_eq!(bundle.board(), "rdk");
        assert_eq!(bundle.vendor_id(), 0x06CB);
        assert_eq!(bundle.product_id(), 0x00B1);
        assert_eq!(bundle.secure_boot(), SecureBoot::V3);
        assert_eq!(bundle.memory_layout(), MemoryLayout::FourGb);
        assert_eq!(bundle.console(), UbootConsole::Usb);
        assert_eq!(bundle.uboot_variant(), UbootVariant::Vendor);
        assert!(bundle.uenv_support());
        assert_eq!(bundle.images().len(), 1);
    }

    #[test]
    fn final_image_defaults_v3_uenv() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_bundle(root.path(), "b1", true, "uboot", "uart", &[]);
        let bundle = BootBundle::load(&dir).unwrap();
        assert_eq!(bundle.final_boot_image(), "uEnv.txt");
    }

    #[test]
    fn final_image_defaults_v3_no_uenv() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_bundle(root.path(), "b1", false, "uboot", "usb", &[]);
        let bundle = BootBundle::load(&dir).unwrap();
        assert_eq!(bundle.final_boot_image(), "gen3_uboot.bin.usb");
    }

    #[test]
    fn final_image_defaults_v2() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("b1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("manifest.yaml"),
            "id: \"b1\"\nchip: \"sl1620\"\nboard: \"rdk\"\nconsole: \"uart\"\n\
             uenv_support: false\nvendor_id: \"06CB\"\nproduct_id: \"00B1\"\n\
             secure_boot: \"gen2\"\nmemory_layout: \"2gb\"\nuboot: \"uboot\"\n",
        )
        .unwrap();
        let bundle = BootBundle::load(&dir).unwrap();
        assert_eq!(bundle.secure_boot(), SecureBoot::V2);
        assert_eq!(bundle.final_boot_image(), "minildr.img");
    }

    #[test]
    fn linux_boot_detection() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_bundle(
            root.path(),
            "b1",
            true,
            "uboot",
            "uart",
            &["Image.gz", "ramdisk.cpio.gz"],
        );
        let bundle = BootBundle::load(&dir).unwrap();
        assert!(bundle.is_linux_boot());
        assert_eq!(bundle.final_boot_image(), "ramdisk.cpio.gz");

        let dir = write_bundle(
            root.path(),
            "b2",
            true,
            "uboot",
            "uart",
            &["Image", "rootfs.cpio.gz"],
        );
        let bundle = BootBundle::load(&dir).unwrap();
        assert!(bundle.is_linux_boot());
        assert_eq!(bundle.final_boot_image(), "rootfs.cpio.gz");
    }

    #[test]
    fn invalid_memory_layout_rejected() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("bad");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("manifest.yaml"),
            "id: \"bad\"\nchip: \"sl1680\"\nboard: \"rdk\"\nconsole: \"usb\"\n\
             uenv_support: false\nvendor_id: \"06CB\"\nproduct_id: \"00B1\"\n\
             secure_boot: \"genx\"\nmemory_layout: \"6gb\"\nuboot: \"uboot\"\n",
        )
        .unwrap();
        match BootBundle::load(&dir) {
            Err(ManagerError::ConfigInvalid(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn collection_selection_priority() {
        let root = tempfile::tempdir().unwrap();
        write_bundle(root.path(), "plain", false, "uboot", "uart", &[]);
        write_bundle(root.path(), "usb-console", false, "uboot", "usb", &[]);
        write_bundle(root.path(), "uenv", true, "uboot", "uart", &[]);
        write_bundle(root.path(), "vendor-uenv", true, "suboot", "usb", &[]);

        let collection = BundleCollection::load(root.path()).unwrap();
        assert_eq!(collection.bundles().len(), 4);

        let candidates = collection.matching(
            "sl1680",
            SecureBoot::V3,
            MemoryLayout::FourGb,
            DdrType::NotSpecified,
            "",
        );
        let best = BundleCollection::best_match(&candidates).unwrap();
        assert_eq!(best.id(), "vendor-uenv");
    }

    #[test]
    fn collection_prefers_uenv_over_usb_console() {
        let root = tempfile::tempdir().unwrap();
        write_bundle(root.path(), "usb-console", false, "uboot", "usb", &[]);
        write_bundle(root.path(), "uenv", true, "uboot", "uart", &[]);

        let collection = BundleCollection::load(root.path()).unwrap();
        let candidates = collection.matching(
            "sl1680",
            SecureBoot::V3,
            MemoryLayout::FourGb,
            DdrType::NotSpecified,
            "",
        );
        let best = BundleCollection::best_match(&candidates).unwrap();
        assert_eq!(best.id(), "uenv");
    }

    #[test]
    fn collection_get_by_id() {
        let root = tempfile::tempdir().unwrap();
        write_bundle(root.path(), "first", false, "uboot", "uart", &[]);
        write_bundle(root.path(), "second", false, "uboot", "usb", &[]);
        let collection = BundleCollection::load(root.path()).unwrap();
        assert_eq!(collection.get("second").unwrap().id(), "second");
        assert!(collection.get("absent").is_none());
    }

    #[test]
    fn board_filter_applies_when_set() {
        let root = tempfile::tempdir().unwrap();
        write_bundle(root.path(), "b1", false, "uboot", "uart", &[]);
        let collection = BundleCollection::load(root.path()).unwrap();
        let none = collection.matching(
            "sl1680",
            SecureBoot::V3,
            MemoryLayout::FourGb,
            DdrType::NotSpecified,
            "other-board",
        );
        assert!(none.is_empty());
    }
}
