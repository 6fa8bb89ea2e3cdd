//! Flash plans: what to write to eMMC or SPI once the device is at U-Boot.
//!
//! A plan is assembled from a flash-image directory, an optional
//! `manifest.yaml` of flat key/value pairs, and caller-supplied config
//! values (config wins on conflict). The plan carries the prebuilt U-Boot
//! command string that triggers the flash, the images to serve while the
//! command runs, and the name of the final image whose transmission marks
//! the update complete.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::bundle::{DdrType, MemoryLayout, SecureBoot};
use crate::error::ManagerError;
use crate::image::{Image, ImageKind};

// Let the console drain before the device resets.
const RESET_COMMAND: &str = "; sleep 1; reset";

// =============================================================================
// Public Interface
// =============================================================================

/// Per-image SPI parameters. Addresses and lengths stay strings: they are
/// spliced verbatim into the U-Boot command line.
#[derive(Debug, Clone)]
pub struct SpiImageParams {
    pub image_file: String,
    pub read_address: String,
    pub write_first_copy_address: String,
    pub write_second_copy_address: String,
    pub write_length: String,
    pub erase_first_start_address: String,
    pub erase_first_length: String,
    pub erase_second_start_address: String,
    pub erase_second_length: String,
}

impl Default for SpiImageParams {
    fn default() -> Self {
        SpiImageParams {
            image_file: String::new(),
            read_address: "0x10000000".into(),
            write_first_copy_address: "0xf0000000".into(),
            write_second_copy_address: "0xf0200000".into(),
            write_length: "0x200000".into(),
            erase_first_start_address: "0xf0000000".into(),
            erase_first_length: "0xf01fffff".into(),
            erase_second_start_address: "0xf0200000".into(),
            erase_second_length: "0xf03fffff".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpiParams {
    pub images: Vec<SpiImageParams>,
}

#[derive(Debug, Clone)]
pub struct EmmcParams {
    /// Basename of the flash-image directory, passed to `l2emmc`.
    pub directory_name: String,
}

/// The flash job type with its parameters.
#[derive(Debug, Clone)]
pub enum FlashKind {
    Spi(SpiParams),
    Emmc(EmmcParams),
}

impl FlashKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlashKind::Spi(_) => "SPI",
            FlashKind::Emmc(_) => "eMMC",
        }
    }
}

impl fmt::Display for FlashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully assembled flash job.
#[derive(Debug)]
pub struct FlashPlan {
    kind: FlashKind,
    image_path: PathBuf,
    boot_bundle_id: String,
    chip: String,
    board: String,
    secure_boot: SecureBoot,
    memory_layout: MemoryLayout,
    ddr_type: DdrType,
    reset_when_complete: bool,
    images: Vec<Image>,
    flash_command: String,
    final_image: String,
}

impl FlashPlan {
    /// Assemble a plan from a flash-image path, caller config and an
    /// optional manifest path (defaults to `<image_path>/manifest.yaml`).
    pub fn load(
        image_path: &Path,
        config: &BTreeMap<String, String>,
        manifest: Option<&Path>,
    ) -> Result<FlashPlan, ManagerError> {
        let image_path = resolve_image_path(image_path)?;
        let manifest_path = manifest
            .map(Path::to_path_buf)
            .unwrap_or_else(|| image_path.join("manifest.yaml"));

        let (merged, image_sections) = merge_manifest(&manifest_path, config)?;

        let boot_bundle_id = merged.get("boot_image").cloned().unwrap_or_default();
        let chip = merged
            .get("chip")
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default();
        let board = merged
            .get("board")
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default();
        let secure_boot = SecureBoot::parse(merged.get("secure_boot").map_or("", String::as_str));
        let memory_layout = match merged.get("memory_layout") {
            Some(s) if !s.is_empty() => MemoryLayout::parse(s)?,
            // Default layouts per chip.
            _ => {
                if chip == "sl1680" {
                    MemoryLayout::FourGb
                } else {
                    MemoryLayout::TwoGb
                }
            }
        };
        let ddr_type = merged
            .get("ddr_type")
            .map(|s| DdrType::parse(s))
            .unwrap_or(DdrType::NotSpecified);
        let reset_when_complete = merged.get("reset").map_or(true, |v| v != "disable");

        let flash_type = match merged.get("image_type").map(String::as_str) {
            Some("spi") => FlashType::Spi,
            Some("nand") => FlashType::Nand,
            Some("emmc") => FlashType::Emmc,
            Some(other) => {
                return Err(ManagerError::ConfigInvalid(format!(
                    "unknown image type: {}",
                    other
                )))
            }
            // An unstated type is an eMMC image when the directory has the
            // eMMC partition layout.
            None if image_path.is_dir() && image_path.join("emmc_part_list").exists() => {
                FlashType::Emmc
            }
            None => {
                return Err(ManagerError::ConfigInvalid(
                    "unknown flash image type".into(),
                ))
            }
        };

        let mut plan = FlashPlan {
            kind: FlashKind::Emmc(EmmcParams {
                directory_name: String::new(),
            }),
            image_path,
            boot_bundle_id,
            chip,
            board,
            secure_boot,
            memory_layout,
            ddr_type,
            reset_when_complete,
            images: Vec::new(),
            flash_command: String::new(),
            final_image: String::new(),
        };

        match flash_type {
            FlashType::Spi => plan.load_spi(&merged, &image_sections)?,
            FlashType::Emmc => plan.load_emmc()?,
            FlashType::Nand => {
                return Err(ManagerError::ConfigInvalid(
                    "NAND flashing is not supported".into(),
                ))
            }
        }

        Ok(plan)
    }

    pub fn kind(&self) -> &FlashKind {
        &self.kind
    }

    pub fn boot_bundle_id(&self) -> &str {
        &self.boot_bundle_id
    }

    pub fn chip(&self) -> &str {
        &self.chip
    }

    pub fn board(&self) -> &str {
        &self.board
    }

    pub fn secure_boot(&self) -> SecureBoot {
        self.secure_boot
    }

    pub fn memory_layout(&self) -> MemoryLayout {
        self.memory_layout
    }

    pub fn ddr_type(&self) -> DdrType {
        self.ddr_type
    }

    pub fn reset_when_complete(&self) -> bool {
        self.reset_when_complete
    }

    /// The command typed at the U-Boot prompt (or baked into `uEnv.txt`).
    pub fn flash_command(&self) -> &str {
        &self.flash_command
    }

    /// Basename of the last image in the flash sequence.
    pub fn final_image(&self) -> &str {
        &self.final_image
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    /// Multi-line description shown to the user before the update starts.
    pub fn description(&self) -> String {
        format!(
            "Update Image: {} {}\n    \
             Image Type: {}\n    \
             Secure Boot: {}\n    \
             Memory Layout: {}\n    \
             Boot Bundle ID: {}",
            self.chip, self.board, self.kind, self.secure_boot, self.memory_layout,
            self.boot_bundle_id,
        )
    }

    fn load_spi(
        &mut self,
        merged: &BTreeMap<String, String>,
        image_sections: &[BTreeMap<String, String>],
    ) -> Result<(), ManagerError> {
        let mut entries = Vec::new();

        if !image_sections.is_empty() {
            for section in image_sections {
                entries.push(spi_params_from(section));
            }
        } else if merged.contains_key("image_file") {
            entries.push(spi_params_from(merged));
        } else {
            // No image file named anywhere: flash the path itself.
            let mut params = spi_params_from(merged);
            params.image_file = self
                .image_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            entries.push(params);
        }

        let mut command = String::new();
        for params in &entries {
            let full_path = if self.image_path.is_dir() {
                self.image_path.join(&params.image_file)
            } else {
                self.image_path.clone()
            };
            if !full_path.exists() {
                return Err(ManagerError::ConfigInvalid(format!(
                    "{} not found",
                    full_path.display()
                )));
            }
            self.images.push(Image::new(full_path, ImageKind::UpdateSpi));
            self.final_image = params.image_file.clone();

            // Flash primary and secondary copies of the SPI image.
            command.push_str(&format!(
                "usbload {} {}; spinit; erase {} {}; cp.b {} {} {}; erase {} {}; cp.b {} {} {}; ",
                params.image_file,
                params.read_address,
                params.erase_first_start_address,
                params.erase_first_length,
                params.read_address,
                params.write_first_copy_address,
                params.write_length,
                params.erase_second_start_address,
                params.erase_second_length,
                params.read_address,
                params.write_second_copy_address,
                params.write_length,
            ));
        }
        if self.reset_when_complete {
            command.push_str(RESET_COMMAND);
        }

        self.flash_command = command;
        self.kind = FlashKind::Spi(SpiParams { images: entries });

        Ok(())
    }

    fn load_emmc(&mut self) -> Result<(), ManagerError> {
        if !self.image_path.is_dir() {
            return Err(ManagerError::ConfigInvalid(format!(
                "{} is not an eMMC image directory",
                self.image_path.display()
            )));
        }

        let directory_name = self
            .image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut command = format!("l2emmc {}", directory_name);
        if self.reset_when_complete {
            command.push_str(RESET_COMMAND);
        }

        for entry in std::fs::read_dir(&self.image_path).map_err(|e| {
            ManagerError::ConfigInvalid(format!(
                "cannot read {}: {}",
                self.image_path.display(),
                e
            ))
        })? {
            let entry = entry
                .map_err(|e| ManagerError::ConfigInvalid(format!("cannot read entry: {}", e)))?;
            debug!("found file: {}", entry.path().display());
            let filename = entry.file_name().to_string_lossy().into_owned();
            if filename.contains("emmc") || filename.contains("subimg") {
                self.images
                    .push(Image::new(entry.path(), ImageKind::UpdateEmmc));
            } else if filename.contains("TAG--") && filename.contains("astra") {
                self.detect_chip_from_tag(&filename);
            }
        }

        self.parse_emmc_image_list()?;

        self.flash_command = command;
        self.kind = FlashKind::Emmc(EmmcParams { directory_name });

        Ok(())
    }

    /// Yocto builds drop a TAG file naming the chip into the image
    /// directory; use it when the config did not pin a chip.
    fn detect_chip_from_tag(&mut self, filename: &str) {
        let pos = match filename.find("sl") {
            Some(p) if p + 6 <= filename.len() => p,
            _ => return,
        };
        let candidate = &filename[pos..pos + 6];
        if !candidate[2..].chars().all(|c| c.is_ascii_digit()) {
            return;
        }

        if !self.chip.is_empty() && candidate != self.chip {
            warn!(
                "image tag chip name {} differs from configured chip {}",
                candidate, self.chip
            );
            return;
        }

        if self.chip.is_empty() {
            let layout = match candidate {
                "sl1680" => MemoryLayout::FourGb,
                "sl1640" | "sl1620" => MemoryLayout::TwoGb,
                _ => return,
            };
            self.chip = candidate.to_string();
            self.secure_boot = SecureBoot::V3;
            self.memory_layout = layout;
            info!("detected that this image is for chip: {}", self.chip);
        }
    }

    /// The final update image is the last non-blank entry of the
    /// `emmc_image_list` file (comma-delimited, first field).
    fn parse_emmc_image_list(&mut self) -> Result<(), ManagerError> {
        let list_path = match self.images.iter().find(|i| i.name() == "emmc_image_list") {
            Some(image) => image.path().to_path_buf(),
            None => return Ok(()),
        };

        let contents = std::fs::read_to_string(&list_path).map_err(|e| {
            ManagerError::ConfigInvalid(format!("cannot read {}: {}", list_path.display(), e))
        })?;

        for line in contents.lines() {
            let name = line.split(',').next().unwrap_or("").trim();
            if !name.is_empty() {
                self.final_image = name.to_string();
            }
        }

        debug!("final image: {}", self.final_image);
        Ok(())
    }
}

// =============================================================================
// Private stuff
// =============================================================================

enum FlashType {
    Spi,
    Nand,
    Emmc,
}

/// Default flash directory names: `eMMCimg`, with the Yocto default
/// `SYNAIMG` as the fallback.
fn resolve_image_path(image_path: &Path) -> Result<PathBuf, ManagerError> {
    if image_path.exists() {
        let mut p = image_path.to_path_buf();
        // A trailing slash would leak into the directory basename.
        if p.file_name().is_none() {
            if let Some(parent) = image_path.parent() {
                p = parent.to_path_buf();
            }
        }
        return Ok(p);
    }
    if image_path == Path::new("eMMCimg") {
        let fallback = Path::new("SYNAIMG");
        if fallback.exists() {
            return Ok(fallback.to_path_buf());
        }
    }
    Err(ManagerError::ConfigInvalid(format!(
        "{} not found",
        image_path.display()
    )))
}

/// Read the manifest mapping under the caller config: config keys win, and
/// the nested `images` section becomes one map per image entry.
fn merge_manifest(
    manifest_path: &Path,
    config: &BTreeMap<String, String>,
) -> Result<(BTreeMap<String, String>, Vec<BTreeMap<String, String>>), ManagerError> {
    let mut merged = config.clone();
    let mut image_sections = Vec::new();

    let contents = match std::fs::read_to_string(manifest_path) {
        Ok(c) => c,
        // No manifest file; the command line values may be enough.
        Err(_) => return Ok((merged, image_sections)),
    };

    let root: serde_yaml::Value = serde_yaml::from_str(&contents)
        .map_err(|_| ManagerError::ConfigInvalid("invalid manifest".into()))?;
    let mapping = match root.as_mapping() {
        Some(m) => m,
        None => return Ok((merged, image_sections)),
    };

    for (key, value) in mapping {
        let key = match key.as_str() {
            Some(k) => k.to_string(),
            None => continue,
        };
        if merged.contains_key(&key) {
            continue;
        }
        if let Some(scalar) = scalar_to_string(value) {
            merged.insert(key, scalar);
        } else if key == "images" {
            if let Some(images) = value.as_mapping() {
                for (image_name, props) in images {
                    let image_name = match image_name.as_str() {
                        Some(n) => n.to_string(),
                        None => continue,
                    };
                    let mut section = BTreeMap::new();
                    section.insert("image_file".to_string(), image_name);
                    if let Some(props) = props.as_mapping() {
                        for (prop, val) in props {
                            if let (Some(p), Some(v)) = (props_key(prop), scalar_to_string(val)) {
                                section.insert(p, v);
                            }
                        }
                    }
                    image_sections.push(section);
                }
            }
        }
    }

    Ok((merged, image_sections))
}

fn props_key(value: &serde_yaml::Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn spi_params_from(map: &BTreeMap<String, String>) -> SpiImageParams {
    let mut params = SpiImageParams::default();
    if let Some(file) = map.get("image_file") {
        params.image_file = file.clone();
    }
    if let Some(v) = map.get("read_address") {
        params.read_address = v.clone();
    }
    if let Some(v) = map.get("write_first_copy_address") {
        params.write_first_copy_address = v.clone();
    }
    if let Some(v) = map.get("write_second_copy_address") {
        params.write_second_copy_address = v.clone();
    }
    if let Some(v) = map.get("write_length") {
        params.write_length = v.clone();
    }
    if let Some(v) = map.get("erase_first_start_address") {
        params.erase_first_start_address = v.clone();
    }
    if let Some(v) = map.get("erase_first_length") {
        params.erase_first_length = v.clone();
    }
    if let Some(v) = map.get("erase_second_start_address") {
        params.erase_second_start_address = v.clone();
    }
    if let Some(v) = map.get("erase_second_length") {
        params.erase_second_length = v.clone();
    }
    params
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn spi_single_image_command() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("uboot.bin"), b"u-boot").unwrap();
        let plan = FlashPlan::load(
            dir.path(),
            &config(&[("image_type", "spi"), ("image_file", "uboot.bin")]),
            None,
        )
        .unwrap();

        assert_eq!(
            plan.flash_command(),
            "usbload uboot.bin 0x10000000; spinit; \
             erase 0xf0000000 0xf01fffff; cp.b 0x10000000 0xf0000000 0x200000; \
             erase 0xf0200000 0xf03fffff; cp.b 0x10000000 0xf0200000 0x200000; \
             ; sleep 1; reset"
        );
        assert_eq!(plan.final_image(), "uboot.bin");
        assert!(plan.reset_when_complete());
        assert_eq!(plan.images().len(), 1);
        assert!(matches!(plan.kind(), FlashKind::Spi(_)));
    }

    #[test]
    fn spi_reset_disable_drops_reset_suffix() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("uboot.bin"), b"u-boot").unwrap();
        let plan = FlashPlan::load(
            dir.path(),
            &config(&[
                ("image_type", "spi"),
                ("image_file", "uboot.bin"),
                ("reset", "disable"),
            ]),
            None,
        )
        .unwrap();
        assert!(!plan.flash_command().contains("reset"));
        assert!(!plan.reset_when_complete());
    }

    #[test]
    fn spi_missing_image_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = FlashPlan::load(
            dir.path(),
            &config(&[("image_type", "spi"), ("image_file", "absent.bin")]),
            None,
        );
        match result {
            Err(ManagerError::ConfigInvalid(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn spi_manifest_images_section() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), b"a").unwrap();
        fs::write(dir.path().join("b.bin"), b"b").unwrap();
        fs::write(
            dir.path().join("manifest.yaml"),
            "image_type: \"spi\"\nimages:\n  a.bin:\n    read_address: \"0x11000000\"\n  b.bin:\n    write_length: \"0x100000\"\n",
        )
        .unwrap();
        let plan = FlashPlan::load(dir.path(), &BTreeMap::new(), None).unwrap();
        assert_eq!(plan.images().len(), 2);
        assert!(plan.flash_command().contains("usbload a.bin 0x11000000;"));
        assert!(plan
            .flash_command()
            .contains("cp.b 0x10000000 0xf0200000 0x100000;"));
        match plan.kind() {
            FlashKind::Spi(params) => assert_eq!(params.images.len(), 2),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn config_wins_over_manifest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("uboot.bin"), b"u").unwrap();
        fs::write(
            dir.path().join("manifest.yaml"),
            "image_type: \"spi\"\nimage_file: \"uboot.bin\"\nchip: \"sl1640\"\n",
        )
        .unwrap();
        let plan = FlashPlan::load(dir.path(), &config(&[("chip", "SL1680")]), None).unwrap();
        assert_eq!(plan.chip(), "sl1680");
        assert_eq!(plan.memory_layout(), MemoryLayout::FourGb);
    }

    #[test]
    fn emmc_plan_from_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("eMMCimg");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("emmc_part_list"), b"part1\n").unwrap();
        fs::write(dir.join("boot.subimg"), b"boot").unwrap();
        fs::write(dir.join("rootfs.subimg"), b"rootfs").unwrap();
        fs::write(
            dir.join("emmc_image_list"),
            "boot.subimg,0x1000\nrootfs.subimg,0x2000\n",
        )
        .unwrap();

        let plan = FlashPlan::load(&dir, &BTreeMap::new(), None).unwrap();
        assert_eq!(plan.flash_command(), "l2emmc eMMCimg; sleep 1; reset");
        assert_eq!(plan.final_image(), "rootfs.subimg");
        // emmc_part_list, emmc_image_list and both subimg files are served.
        assert_eq!(plan.images().len(), 4);
        match plan.kind() {
            FlashKind::Emmc(params) => assert_eq!(params.directory_name, "eMMCimg"),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn emmc_image_list_skips_blank_tail() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("img");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("emmc_part_list"), b"").unwrap();
        fs::write(dir.join("emmc_image_list"), "a.subimg,1\nb.subimg,2\n\n\n").unwrap();
        let plan = FlashPlan::load(&dir, &BTreeMap::new(), None).unwrap();
        assert_eq!(plan.final_image(), "b.subimg");
    }

    #[test]
    fn emmc_chip_detected_from_tag_file() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("img");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("emmc_part_list"), b"").unwrap();
        fs::write(dir.join("TAG--sl1680-astra-release"), b"").unwrap();
        let plan = FlashPlan::load(&dir, &BTreeMap::new(), None).unwrap();
        assert_eq!(plan.chip(), "sl1680");
        assert_eq!(plan.secure_boot(), SecureBoot::V3);
        assert_eq!(plan.memory_layout(), MemoryLayout::FourGb);
    }

    #[test]
    fn nand_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = FlashPlan::load(dir.path(), &config(&[("image_type", "nand")]), None);
        match result {
            Err(ManagerError::ConfigInvalid(msg)) => assert!(msg.contains("NAND")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn missing_path_rejected() {
        let result = FlashPlan::load(
            Path::new("/nonexistent/flash-image"),
            &BTreeMap::new(),
            None,
        );
        assert!(matches!(result, Err(ManagerError::ConfigInvalid(_))));
    }
}
