//! Raw flash primitives and the flash partition table.
//!
//! Raw-class partitions are copied block-level rather than archived; the
//! actual flash drivers stay behind [`FlashToolkit`], with an external-tool
//! implementation for real hardware and a file-backed one for simulation
//! and tests (selected by the `simulation` config flag).

use crate::errors::{Result, StorageError};
use regex::Regex;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Partition classes that are backed up and restored by block-level copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashClass {
    Mtd,
    Bml,
    Emmc,
}

impl FlashClass {
    pub fn from_fs_type(fs_type: &str) -> Option<Self> {
        match fs_type {
            "mtd" => Some(Self::Mtd),
            "bml" => Some(Self::Bml),
            "emmc" => Some(Self::Emmc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mtd => "mtd",
            Self::Bml => "bml",
            Self::Emmc => "emmc",
        }
    }
}

pub trait FlashToolkit: Send + Sync {
    fn backup_raw(&self, class: FlashClass, device: &str, dest: &Path) -> Result<()>;
    fn restore_raw(&self, class: FlashClass, device: &str, src: &Path) -> Result<()>;
    fn erase_raw(&self, class: FlashClass, device: &str) -> Result<()>;
}

pub fn toolkit(simulation: bool) -> Arc<dyn FlashToolkit> {
    if simulation {
        Arc::new(SimulatedFlashTools::default())
    } else {
        Arc::new(ExternalFlashTools)
    }
}

/// Shells out to the board's flash tools with discrete argument vectors.
/// MTD partitions are addressed by name; bml/emmc devices are plain block
/// devices and go through `dd`.
pub struct ExternalFlashTools;

impl ExternalFlashTools {
    fn run(tool: &str, args: &[&str]) -> Result<()> {
        let status = Command::new(tool)
            .args(args)
            .status()
            .map_err(|e| StorageError::encoding(tool, e))?;
        if status.success() {
            Ok(())
        } else {
            Err(StorageError::encoding(tool, status))
        }
    }
}

impl FlashToolkit for ExternalFlashTools {
    fn backup_raw(&self, class: FlashClass, device: &str, dest: &Path) -> Result<()> {
        let dest = dest.to_string_lossy();
        match class {
            FlashClass::Mtd => Self::run("dump_image", &[device, &dest]),
            FlashClass::Bml | FlashClass::Emmc => {
                Self::run("dd", &[&format!("if={device}"), &format!("of={dest}")])
            }
        }
    }

    fn restore_raw(&self, class: FlashClass, device: &str, src: &Path) -> Result<()> {
        let src = src.to_string_lossy();
        match class {
            FlashClass::Mtd => Self::run("flash_image", &[device, &src]),
            FlashClass::Bml | FlashClass::Emmc => {
                Self::run("dd", &[&format!("if={src}"), &format!("of={device}")])
            }
        }
    }

    fn erase_raw(&self, class: FlashClass, device: &str) -> Result<()> {
        match class {
            FlashClass::Mtd => Self::run("erase_image", &[device]),
            FlashClass::Bml | FlashClass::Emmc => {
                Self::run("dd", &["if=/dev/zero", &format!("of={device}")])
            }
        }
    }
}

/// File-backed toolkit: device paths are treated as ordinary files and every
/// call is recorded, so jobs can run end to end on a development machine.
#[derive(Default)]
pub struct SimulatedFlashTools {
    calls: Mutex<Vec<String>>,
}

impl SimulatedFlashTools {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &str, class: FlashClass, device: &str) {
        debug!(op, class = class.as_str(), device, "simulated flash call");
        self.calls
            .lock()
            .unwrap()
            .push(format!("{op} {} {device}", class.as_str()));
    }
}

impl FlashToolkit for SimulatedFlashTools {
    fn backup_raw(&self, class: FlashClass, device: &str, dest: &Path) -> Result<()> {
        self.record("backup", class, device);
        std::fs::copy(device, dest)
            .map_err(|e| StorageError::encoding("simulated flash backup", e))?;
        Ok(())
    }

    fn restore_raw(&self, class: FlashClass, device: &str, src: &Path) -> Result<()> {
        self.record("restore", class, device);
        std::fs::copy(src, device)
            .map_err(|e| StorageError::encoding("simulated flash restore", e))?;
        Ok(())
    }

    fn erase_raw(&self, class: FlashClass, device: &str) -> Result<()> {
        self.record("erase", class, device);
        std::fs::write(device, b"").map_err(|e| StorageError::format(device, e))?;
        Ok(())
    }
}

/// One line of the flash partition table.
#[derive(Debug, Clone)]
pub struct MtdPartition {
    pub index: usize,
    pub name: String,
    pub size: u64,
}

impl MtdPartition {
    pub fn block_device(&self) -> PathBuf {
        PathBuf::from(format!("/dev/block/mtdblock{}", self.index))
    }
}

/// Snapshot of `/proc/mtd`, scanned on demand when a flash-native partition
/// has to be located by its declared name.
#[derive(Debug, Default)]
pub struct MtdTable {
    partitions: Vec<MtdPartition>,
}

impl MtdTable {
    pub fn scan(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(Self::parse(std::io::BufReader::new(file)))
    }

    pub fn parse(input: impl BufRead) -> Self {
        // mtd0: 00040000 00020000 "boot"
        let line_re = Regex::new(r#"^mtd(\d+):\s+([0-9a-fA-F]+)\s+[0-9a-fA-F]+\s+"([^"]*)""#)
            .expect("static regex");

        let mut partitions = Vec::new();
        for line in input.lines() {
            let Ok(line) = line else { break };
            let Some(caps) = line_re.captures(&line) else {
                if !line.starts_with("dev:") {
                    warn!(line, "unrecognized flash table line");
                }
                continue;
            };
            let index = caps[1].parse().unwrap_or(0);
            let size = u64::from_str_radix(&caps[2], 16).unwrap_or(0);
            partitions.push(MtdPartition {
                index,
                name: caps[3].to_string(),
                size,
            });
        }
        Self { partitions }
    }

    pub fn find(&self, name: &str) -> Option<&MtdPartition> {
        self.partitions.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_flash_table() {
        let table = MtdTable::parse(Cursor::new(
            "dev:    size   erasesize  name\n\
             mtd0: 00040000 00020000 \"boot\"\n\
             mtd1: 00500000 00020000 \"system\"\n\
             garbage line\n",
        ));

        let boot = table.find("boot").unwrap();
        assert_eq!(boot.index, 0);
        assert_eq!(boot.size, 0x40000);
        assert_eq!(boot.block_device(), PathBuf::from("/dev/block/mtdblock0"));
        assert!(table.find("cache").is_none());
    }

    #[test]
    fn simulated_toolkit_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("mmcblk0p7");
        let image = dir.path().join("boot.img");
        std::fs::write(&device, b"raw partition bytes").unwrap();

        let tools = SimulatedFlashTools::default();
        let dev = device.to_string_lossy();

        tools.backup_raw(FlashClass::Emmc, &dev, &image).unwrap();
        tools.erase_raw(FlashClass::Emmc, &dev).unwrap();
        assert_eq!(std::fs::read(&device).unwrap(), b"");

        tools.restore_raw(FlashClass::Emmc, &dev, &image).unwrap();
        assert_eq!(std::fs::read(&device).unwrap(), b"raw partition bytes");
        assert_eq!(tools.calls().len(), 3);
    }
}
