//! Static volume table: which mount points exist, what backs them, and how
//! they may be mounted. Loaded once at startup and read-only afterwards.

use crate::flash::FlashClass;
use chrono::Local;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const RAMDISK_MOUNT: &str = "/tmp";
pub const RAMDISK_FS: &str = "ramdisk";

/// Filesystems mounted through the three-attempt device/type fallback chain.
const COMMON_FS: &[&str] = &["ext2", "ext3", "ext4", "f2fs", "rfs", "vfat"];

/// The legacy flash-native filesystem, mounted directly over an MTD device.
pub const FLASH_NATIVE_FS: &str = "yaffs2";

/// An emulated-storage mount point that is really a subdirectory of the
/// data partition.
pub const DATA_MEDIA_FS: &str = "datamedia";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub mount_point: String,
    pub fs_type: String,
    /// Absent only for the ramdisk pseudo-volume.
    pub device: Option<String>,
    pub device2: Option<String>,
    pub fs_type2: Option<String>,
    pub fs_options: Option<String>,
    pub fs_options2: Option<String>,
    /// Partition length in bytes, honored when formatting.
    pub length: Option<i64>,
    pub lun: Option<String>,
}

impl Volume {
    fn ramdisk() -> Self {
        Self {
            mount_point: RAMDISK_MOUNT.to_string(),
            fs_type: RAMDISK_FS.to_string(),
            device: None,
            device2: None,
            fs_type2: None,
            fs_options: None,
            fs_options2: None,
            length: None,
            lun: None,
        }
    }

    fn new(mount_point: &str, fs_type: &str, device: &str) -> Self {
        Self {
            mount_point: mount_point.to_string(),
            fs_type: fs_type.to_string(),
            device: Some(device.to_string()),
            device2: None,
            fs_type2: None,
            fs_options: None,
            fs_options2: None,
            length: None,
            lun: None,
        }
    }

    pub fn is_ramdisk(&self) -> bool {
        self.fs_type == RAMDISK_FS
    }

    pub fn is_data_media(&self) -> bool {
        self.fs_type == DATA_MEDIA_FS
    }

    pub fn is_flash_native(&self) -> bool {
        self.fs_type == FLASH_NATIVE_FS
    }

    /// Raw-copy class, for partitions that bypass filesystem archiving.
    pub fn flash_class(&self) -> Option<FlashClass> {
        FlashClass::from_fs_type(&self.fs_type)
    }

    pub fn uses_common_mount(&self) -> bool {
        COMMON_FS.contains(&self.fs_type.as_str())
    }

    /// Last component of the mount point; names the backup artifacts.
    pub fn leaf(&self) -> &str {
        self.mount_point.rsplit('/').next().unwrap_or("")
    }
}

/// Ordered, immutable set of declared volumes. The ramdisk pseudo-volume is
/// always present and always first.
#[derive(Debug)]
pub struct VolumeRegistry {
    volumes: Vec<Volume>,
}

impl Default for VolumeRegistry {
    fn default() -> Self {
        Self {
            volumes: vec![Volume::ramdisk()],
        }
    }
}

impl VolumeRegistry {
    /// Load the table from disk. Never fails fatally: a missing table yields
    /// the ramdisk-only registry, malformed lines are logged and skipped.
    pub fn load(path: &Path) -> Self {
        let registry = match std::fs::File::open(path) {
            Ok(file) => Self::parse(BufReader::new(file)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to open volume table");
                Self::default()
            }
        };

        for (i, v) in registry.volumes.iter().enumerate() {
            info!(
                index = i,
                mount_point = %v.mount_point,
                fs_type = %v.fs_type,
                device = v.device.as_deref().unwrap_or("-"),
                device2 = v.device2.as_deref().unwrap_or("-"),
                "volume"
            );
        }
        registry
    }

    pub fn parse(input: impl Read) -> Self {
        let mut registry = Self::default();

        for line in BufReader::new(input).lines() {
            let Ok(line) = line else { break };
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match Self::parse_line(trimmed) {
                Some(volume) => registry.volumes.push(volume),
                None => warn!(line = trimmed, "skipping malformed volume table line"),
            }
        }
        registry
    }

    /// `mount_point fs_type device [device2] [opt=val,...]`. A fourth token
    /// is a second device only when it starts with `/`, otherwise it is the
    /// options field.
    fn parse_line(line: &str) -> Option<Volume> {
        let mut tokens = line.split_whitespace();
        let mount_point = tokens.next()?;
        let fs_type = tokens.next()?;
        let device = tokens.next()?;

        let mut volume = Volume::new(mount_point, fs_type, device);

        let mut options = None;
        if let Some(fourth) = tokens.next() {
            if fourth.starts_with('/') {
                volume.device2 = Some(fourth.to_string());
                options = tokens.next();
            } else {
                options = Some(fourth);
            }
        }

        if let Some(options) = options {
            if !Self::apply_options(&mut volume, options) {
                return None;
            }
        }
        Some(volume)
    }

    fn apply_options(volume: &mut Volume, options: &str) -> bool {
        for option in options.split(',') {
            if let Some(value) = option.strip_prefix("length=") {
                match value.parse() {
                    Ok(length) => volume.length = Some(length),
                    Err(_) => return false,
                }
            } else if let Some(value) = option.strip_prefix("fstype2=") {
                // The declared alternative becomes the primary type; the
                // previous primary turns into the fallback.
                volume.fs_type2 = Some(std::mem::replace(&mut volume.fs_type, value.to_string()));
            } else if let Some(value) = option.strip_prefix("fs_options=") {
                volume.fs_options = Some(value.to_string());
            } else if let Some(value) = option.strip_prefix("fs_options2=") {
                volume.fs_options2 = Some(value.to_string());
            } else if let Some(value) = option.strip_prefix("lun=") {
                volume.lun = Some(value.to_string());
            } else {
                warn!(option, "bad volume option");
                return false;
            }
        }
        true
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    /// The volume owning `path`: the longest declared mount point that
    /// prefixes `path` on a path-segment boundary. This is the single source
    /// of truth for path ownership, including alias mount points nested
    /// under another volume.
    pub fn volume_for_path(&self, path: &str) -> Option<&Volume> {
        self.volumes
            .iter()
            .filter(|v| {
                let mp = v.mount_point.as_str();
                path.starts_with(mp)
                    && (path.len() == mp.len() || path.as_bytes()[mp.len()] == b'/')
            })
            .max_by_key(|v| v.mount_point.len())
    }

    pub fn data_media_volume(&self) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.is_data_media())
    }

    pub fn is_data_media(&self) -> bool {
        self.data_media_volume().is_some()
    }

    pub fn is_data_media_path(&self, path: &str) -> bool {
        self.volume_for_path(path).is_some_and(|v| v.is_data_media())
    }

    /// The `/data`-subdirectory that backs the emulated-storage alias. The
    /// alias volume declares it as its device; `/data/media` when it
    /// doesn't.
    pub fn media_dir(&self) -> Option<PathBuf> {
        let alias = self.data_media_volume()?;
        Some(PathBuf::from(
            alias.device.as_deref().unwrap_or("/data/media"),
        ))
    }

    /// The real data volume that the emulated-storage alias lives on.
    pub fn data_volume(&self) -> Option<&Volume> {
        let media = self.media_dir()?;
        self.volume_for_path(media.to_str()?)
    }

    /// True when `path` is exactly the data volume's mount point.
    pub fn is_data_root(&self, path: &str) -> bool {
        self.data_volume().is_some_and(|v| v.mount_point == path)
    }

    /// True for the data mount point and anything below it.
    pub fn is_under_data(&self, path: &str) -> bool {
        self.data_volume().is_some_and(|v| {
            let mp = v.mount_point.as_str();
            path.starts_with(mp) && (path.len() == mp.len() || path.as_bytes()[mp.len()] == b'/')
        })
    }

    /// `media/0` layouts moved user storage one level down; mirror whichever
    /// layout is already present.
    pub fn use_migrated_storage(&self) -> bool {
        self.media_dir()
            .is_some_and(|m| m.join("0").symlink_metadata().is_ok())
    }

    pub fn primary_storage(&self) -> Option<&str> {
        self.volume_for_path("/sdcard")
            .map(|_| "/sdcard")
    }

    pub fn android_secure_path(&self) -> Option<String> {
        Some(format!("{}/.android_secure", self.primary_storage()?))
    }

    pub fn has_datadata(&self) -> bool {
        self.volume_for_path("/datadata").is_some()
    }

    /// Default backup destination under primary storage.
    pub fn timestamped_backup_path(&self) -> Option<PathBuf> {
        let stamp = Local::now().format("%F-%H-%M-%S");
        Some(PathBuf::from(format!(
            "{}/rstor/backup/{stamp}",
            self.primary_storage()?
        )))
    }
}
