//! Mount, unmount and format across the storage classes a recovery
//! environment has to deal with: flash-native partitions located by name,
//! block volumes with device/type fallback chains, removable media that
//! needs external mount helpers, and the emulated-storage alias that is
//! really a subdirectory of the data partition.
//!
//! Mounted state is never cached: every decision rescans the live mount
//! table first.

use crate::config::AppConfig;
use crate::core::volumes::{FLASH_NATIVE_FS, RAMDISK_FS, Volume, VolumeRegistry};
use crate::errors::{Result, StorageError};
use crate::flash::{FlashClass, FlashToolkit, MtdTable};
use nix::mount::{MsFlags, mount, umount};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

const EXFAT_HELPER: &str = "/sbin/mount.exfat";
const EXFAT_OPTIONS: &str = "big_writes,default_permissions,max_read=131072,max_write=131072";
const NTFS_HELPER: &str = "/sbin/mount.ntfs";
const NTFS_OPTIONS: &str = "rw,umask=0";

/// Point-in-time view of the live mount table, mount point to filesystem.
#[derive(Debug, Default)]
pub struct MountSnapshot {
    mounts: HashMap<String, String>,
}

impl MountSnapshot {
    pub fn rescan(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            StorageError::mount(path.to_string_lossy(), format!("cannot scan mounts: {e}"))
        })?;
        Ok(Self::parse(BufReader::new(file)))
    }

    pub fn parse(input: impl Read) -> Self {
        let mut mounts = HashMap::new();
        for line in BufReader::new(input).lines() {
            let Ok(line) = line else { break };
            let mut fields = line.split_whitespace();
            let (Some(_dev), Some(mount_point), Some(fs_type)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            mounts.insert(mount_point.to_string(), fs_type.to_string());
        }
        Self { mounts }
    }

    pub fn is_mounted(&self, mount_point: &str) -> bool {
        self.mounts.contains_key(mount_point)
    }

    pub fn fs_type(&self, mount_point: &str) -> Option<&str> {
        self.mounts.get(mount_point).map(String::as_str)
    }
}

pub struct MountController {
    registry: Arc<VolumeRegistry>,
    flash: Arc<dyn FlashToolkit>,
    mounts_table: PathBuf,
    mtd_table: PathBuf,
    data_encrypted: AtomicBool,
    media_preserved: AtomicBool,
}

impl MountController {
    pub fn new(
        registry: Arc<VolumeRegistry>,
        flash: Arc<dyn FlashToolkit>,
        config: &AppConfig,
    ) -> Self {
        Self {
            registry,
            flash,
            mounts_table: config.mounts_table.clone(),
            mtd_table: config.mtd_table.clone(),
            data_encrypted: AtomicBool::new(config.data_encrypted),
            media_preserved: AtomicBool::new(config.preserve_data_media),
        }
    }

    pub fn set_data_encrypted(&self, value: bool) {
        self.data_encrypted.store(value, Ordering::Relaxed);
    }

    pub fn is_data_encrypted(&self) -> bool {
        self.data_encrypted.load(Ordering::Relaxed)
    }

    pub fn preserve_data_media(&self, value: bool) {
        self.media_preserved.store(value, Ordering::Relaxed);
    }

    pub fn is_data_media_preserved(&self) -> bool {
        self.media_preserved.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Result<MountSnapshot> {
        MountSnapshot::rescan(&self.mounts_table)
    }

    /// Live filesystem type of the volume owning `path`, if mounted.
    pub fn live_fs_type(&self, path: &str) -> Option<String> {
        let volume = self.registry.volume_for_path(path)?;
        let snapshot = self.snapshot().ok()?;
        snapshot.fs_type(&volume.mount_point).map(str::to_string)
    }

    /// Free bytes on the filesystem holding `path`.
    pub fn free_bytes(&self, path: &str) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|e| StorageError::mount(path, format!("statvfs: {e}")))?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    /// Idempotent: success when the volume is already mounted.
    pub fn ensure_mounted(&self, path: &str) -> Result<()> {
        if self.registry.is_data_media_path(path) {
            // The alias has no device of its own; it rides on /data. With
            // encrypted data there is nothing to mount yet.
            if self.is_data_encrypted() {
                return Ok(());
            }
            let data_root = self
                .registry
                .data_volume()
                .map(|v| v.mount_point.clone())
                .ok_or_else(|| StorageError::UnknownVolume(PathBuf::from(path)))?;
            self.ensure_mounted(&data_root)?;
            self.setup_data_media();
            return Ok(());
        }

        let Some(volume) = self.registry.volume_for_path(path).cloned() else {
            warn!(path, "unknown volume");
            return Err(StorageError::UnknownVolume(PathBuf::from(path)));
        };
        if volume.is_ramdisk() {
            // The ramdisk is always mounted.
            return Ok(());
        }

        let snapshot = self.snapshot()?;
        if snapshot.is_mounted(&volume.mount_point) {
            return Ok(());
        }

        let _ = std::fs::create_dir_all(&volume.mount_point);

        if volume.is_flash_native() {
            self.mount_flash_native(&volume)
        } else if volume.uses_common_mount() {
            self.mount_common(&volume)
        } else {
            self.mount_auto(&volume)
        }
    }

    /// Idempotent: success when the volume is already unmounted.
    pub fn ensure_unmounted(&self, path: &str) -> Result<()> {
        if self.registry.is_data_media_path(path) {
            if self.is_data_media_preserved() || self.is_data_encrypted() {
                return Ok(());
            }
            let data_root = self
                .registry
                .data_volume()
                .map(|v| v.mount_point.clone())
                .ok_or_else(|| StorageError::UnknownVolume(PathBuf::from(path)))?;
            return self.ensure_unmounted(&data_root);
        }

        if self.registry.is_under_data(path)
            && (self.is_data_encrypted()
                || (self.registry.is_data_media() && self.is_data_media_preserved()))
        {
            return Ok(());
        }

        let Some(volume) = self.registry.volume_for_path(path).cloned() else {
            warn!(path, "unknown volume");
            return Err(StorageError::UnknownVolume(PathBuf::from(path)));
        };
        if volume.is_ramdisk() {
            return Err(StorageError::Unmount {
                mount_point: volume.mount_point,
                reason: "the ramdisk is always mounted".into(),
            });
        }

        let snapshot = self.snapshot()?;
        if !snapshot.is_mounted(&volume.mount_point) {
            return Ok(());
        }

        umount(volume.mount_point.as_str()).map_err(|e| StorageError::Unmount {
            mount_point: volume.mount_point.clone(),
            reason: e.to_string(),
        })
    }

    /// Format `target`. `device`/`fs_type` override the volume's declared
    /// configuration (used when restoring a backup made with a different
    /// filesystem).
    pub fn format(&self, target: &str, device: Option<&str>, fs_type: Option<&str>) -> Result<()> {
        if self.registry.is_data_media_path(target) {
            return self.wipe_in_place(None, target, None);
        }

        let Some(volume) = self.registry.volume_for_path(target).cloned() else {
            if target != "/sd-ext" {
                warn!(target, "unknown volume");
            }
            return Err(StorageError::UnknownVolume(PathBuf::from(target)));
        };

        let fs = fs_type.unwrap_or(&volume.fs_type).to_string();
        let device = device
            .map(str::to_string)
            .or_else(|| volume.device.clone());

        if fs == RAMDISK_FS || volume.is_ramdisk() {
            return Err(StorageError::format(target, "cannot format the ramdisk"));
        }

        // An app2sd card may be declared but not inserted.
        if target == "/sd-ext"
            && !volume
                .device
                .as_deref()
                .is_some_and(|d| Path::new(d).exists())
        {
            info!("no sd-ext card present, skipping format");
            return Err(StorageError::format(target, "device not present"));
        }

        if target != volume.mount_point {
            return self.wipe_in_place(None, target, None);
        }

        if self.registry.is_data_root(target)
            && self.registry.is_data_media()
            && self.is_data_media_preserved()
        {
            return self.wipe_in_place(None, target, None);
        }

        self.ensure_unmounted(target)
            .map_err(|e| StorageError::format(target, e))?;

        if fs == FLASH_NATIVE_FS || fs == "mtd" {
            let dev = device.ok_or_else(|| StorageError::format(target, "no device declared"))?;
            return self.flash.erase_raw(FlashClass::Mtd, &dev);
        }
        if let Some(class) = FlashClass::from_fs_type(&fs) {
            let dev = device.ok_or_else(|| StorageError::format(target, "no device declared"))?;
            return self.flash.erase_raw(class, &dev);
        }

        if fs == "ext4" {
            let dev = device.ok_or_else(|| StorageError::format(target, "no device declared"))?;
            let mut args: Vec<String> = Vec::new();
            if let Some(length) = volume.length {
                args.push("-l".into());
                args.push(length.to_string());
            }
            args.extend(["-a".into(), target.to_string(), dev]);
            return run_tool("make_ext4fs", &args)
                .map_err(|reason| StorageError::format(target, reason));
        }

        #[cfg(feature = "f2fs")]
        if fs == "f2fs" {
            let dev = device.ok_or_else(|| StorageError::format(target, "no device declared"))?;
            let length = volume.length.unwrap_or(0);
            if length < 0 {
                return Err(StorageError::format(
                    target,
                    format!("negative length {length} not supported on f2fs"),
                ));
            }
            let sectors = (length / 512).to_string();
            return run_tool(
                "/sbin/mkfs.f2fs",
                &["-t".into(), "-d1".into(), dev, sectors],
            )
            .map_err(|reason| StorageError::format(target, reason));
        }

        if fs == "rfs" {
            let dev = device.ok_or_else(|| StorageError::format(target, "no device declared"))?;
            return run_tool("/sbin/mkfs.rfs", &[dev])
                .map_err(|reason| StorageError::format(target, reason));
        }
        if fs == "ext2" || fs == "ext3" {
            let dev = device.ok_or_else(|| StorageError::format(target, "no device declared"))?;
            return run_tool("mke2fs", &["-t".into(), fs.clone(), dev])
                .map_err(|reason| StorageError::format(target, reason));
        }

        self.wipe_in_place(device.as_deref(), target, Some(&fs))
    }

    /// Format a "volume" that is really a directory tree (or a raw class
    /// reached without a mountable filesystem) by wiping it in place.
    fn wipe_in_place(&self, device: Option<&str>, target: &str, fs_type: Option<&str>) -> Result<()> {
        if let (Some(fs), Some(dev)) = (fs_type, device) {
            if let Some(class) = FlashClass::from_fs_type(fs) {
                return self.flash.erase_raw(class, dev);
            }
        }

        if target == "/sd-ext" {
            let present = self
                .registry
                .volume_for_path(target)
                .and_then(|v| v.device.as_deref())
                .is_some_and(|d| Path::new(d).exists());
            if !present {
                info!("no app2sd partition found, skipping wipe of /sd-ext");
                return Ok(());
            }
        }

        if self.registry.is_data_root(target)
            && self.registry.is_data_media()
            && self.is_data_media_preserved()
        {
            return self.wipe_data_preserving_media(target);
        }

        info!(target, "wiping directory tree");
        rmtree_except(Path::new(target), None).map_err(|e| StorageError::format(target, e))?;
        let _ = self.ensure_unmounted(target);
        Ok(())
    }

    /// Wipe the data tree but keep the emulated-storage subdirectory, and
    /// carry the layout-version marker across the wipe (its loss would make
    /// the platform re-nest user storage on next boot).
    fn wipe_data_preserving_media(&self, target: &str) -> Result<()> {
        let media_name = self
            .registry
            .media_dir()
            .and_then(|m| m.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "media".to_string());

        let marker = Path::new(target).join(".layout_version");
        let saved_layout = std::fs::read(&marker).ok();
        if saved_layout.is_some() {
            info!("preserving layout version");
        }

        let wiped = rmtree_except(Path::new(target), Some(&media_name));

        if let Some(layout) = saved_layout {
            use std::io::Write;
            let restored = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&marker)
                .and_then(|mut f| f.write_all(&layout));
            if restored.is_err() {
                warn!("failed to restore layout version marker");
            }
        }

        wiped.map_err(|e| StorageError::format(target, e))
    }

    fn mount_flash_native(&self, volume: &Volume) -> Result<()> {
        let mount_point = volume.mount_point.as_str();
        let name = volume
            .device
            .as_deref()
            .ok_or_else(|| StorageError::mount(mount_point, "no partition name declared"))?;

        let table = MtdTable::scan(&self.mtd_table)
            .map_err(|e| StorageError::mount(mount_point, format!("cannot scan flash table: {e}")))?;
        let partition = table.find(name).ok_or_else(|| {
            StorageError::mount(mount_point, format!("no flash partition named \"{name}\""))
        })?;

        mount(
            Some(&partition.block_device()),
            mount_point,
            Some(FLASH_NATIVE_FS),
            mount_flags(),
            None::<&str>,
        )
        .map_err(|e| StorageError::mount(mount_point, e))
    }

    /// Three-attempt fallback: primary device with primary type/options,
    /// primary device with the secondary pair, then secondary device with
    /// the secondary pair. First success wins; the last error propagates.
    fn mount_common(&self, volume: &Volume) -> Result<()> {
        let mount_point = volume.mount_point.as_str();
        let attempts = [
            (
                volume.device.as_deref(),
                Some(volume.fs_type.as_str()),
                volume.fs_options.as_deref(),
            ),
            (
                volume.device.as_deref(),
                volume.fs_type2.as_deref(),
                volume.fs_options2.as_deref(),
            ),
            (
                volume.device2.as_deref(),
                volume.fs_type2.as_deref(),
                volume.fs_options2.as_deref(),
            ),
        ];

        let mut last = nix::errno::Errno::ENOENT;
        for (device, fs, options) in attempts {
            let (Some(device), Some(fs)) = (device, fs) else {
                continue;
            };
            match mount(Some(device), mount_point, Some(fs), mount_flags(), options) {
                Ok(()) => return Ok(()),
                Err(e) => last = e,
            }
        }
        Err(StorageError::mount(mount_point, last))
    }

    /// Plain mount, then the exFAT and NTFS helpers in that order for
    /// auto-typed removable media.
    fn mount_auto(&self, volume: &Volume) -> Result<()> {
        let mount_point = volume.mount_point.as_str();
        let device = volume
            .device
            .as_deref()
            .ok_or_else(|| StorageError::mount(mount_point, "no device declared"))?;

        let mut last = match run_tool("mount", &[device.into(), mount_point.into()]) {
            Ok(()) => return Ok(()),
            Err(reason) => reason,
        };

        if volume.fs_type == "auto" {
            if Path::new(EXFAT_HELPER).exists() {
                match run_tool(
                    EXFAT_HELPER,
                    &[
                        "-o".into(),
                        EXFAT_OPTIONS.into(),
                        device.into(),
                        mount_point.into(),
                    ],
                ) {
                    Ok(()) => return Ok(()),
                    Err(reason) => last = reason,
                }
            }
            if Path::new(NTFS_HELPER).exists() {
                match run_tool(
                    NTFS_HELPER,
                    &[
                        "-o".into(),
                        NTFS_OPTIONS.into(),
                        device.into(),
                        mount_point.into(),
                    ],
                ) {
                    Ok(()) => return Ok(()),
                    Err(reason) => last = reason,
                }
            }
        }

        Err(StorageError::mount(mount_point, last))
    }

    /// Replace the alias mount point with a symlink into whichever storage
    /// layout the data partition already carries.
    fn setup_data_media(&self) {
        let Some(alias) = self.registry.data_media_volume() else {
            return;
        };
        let Some(media) = self.registry.media_dir() else {
            return;
        };
        let target = if self.registry.use_migrated_storage() {
            media.join("0")
        } else {
            media
        };

        let _ = std::fs::remove_dir(&alias.mount_point);
        let _ = std::fs::create_dir_all(&target);
        info!(target = %target.display(), alias = %alias.mount_point, "using data media for alias");
        let _ = std::os::unix::fs::symlink(&target, &alias.mount_point);
    }
}

fn mount_flags() -> MsFlags {
    MsFlags::MS_NOATIME | MsFlags::MS_NODEV | MsFlags::MS_NODIRATIME
}

fn run_tool(program: &str, args: &[String]) -> std::result::Result<(), String> {
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|e| format!("{program}: {e}"))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("{program} exited with {status}"))
    }
}

/// Create a directory and open up its permissions, the way backup
/// destinations are expected to be reachable from any client.
pub fn ensure_directory(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
}

/// Recursively delete the contents of `dir`, optionally sparing one
/// top-level entry. The directory itself stays.
pub fn rmtree_except(dir: &Path, except: Option<&str>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(except) = except {
            if entry.file_name().to_string_lossy() == except {
                continue;
            }
        }
        let path = entry.path();
        let meta = std::fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            rmtree_except(&path, None)?;
            std::fs::remove_dir(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::SimulatedFlashTools;
    use std::io::Cursor;

    fn fixture(table: &str, mounts: &str) -> (tempfile::TempDir, MountController, Arc<SimulatedFlashTools>) {
        let dir = tempfile::tempdir().unwrap();
        let mounts_path = dir.path().join("mounts");
        std::fs::write(&mounts_path, mounts).unwrap();

        let registry = Arc::new(VolumeRegistry::parse(Cursor::new(table.to_string())));
        let flash = Arc::new(SimulatedFlashTools::default());
        let config = AppConfig {
            mounts_table: mounts_path,
            ..AppConfig::default()
        };
        let controller = MountController::new(registry, flash.clone(), &config);
        (dir, controller, flash)
    }

    #[test]
    fn snapshot_parses_mount_table() {
        let snapshot = MountSnapshot::parse(Cursor::new(
            "/dev/block/mmcblk0p9 /system ext4 ro,relatime 0 0\n\
             tmpfs /tmp tmpfs rw 0 0\n\
             short\n",
        ));
        assert!(snapshot.is_mounted("/system"));
        assert_eq!(snapshot.fs_type("/system"), Some("ext4"));
        assert!(!snapshot.is_mounted("/data"));
    }

    #[test]
    fn already_mounted_path_is_a_no_op() {
        let (_dir, controller, _) = fixture(
            "/system ext4 /dev/nonexistent\n",
            "/dev/nonexistent /system ext4 rw 0 0\n",
        );
        // A second mount attempt would fail (no such device, no privileges);
        // success here proves none was made.
        controller.ensure_mounted("/system").unwrap();
        controller.ensure_mounted("/system/app").unwrap();
    }

    #[test]
    fn unmounted_path_unmounts_as_no_op() {
        let (_dir, controller, _) = fixture("/system ext4 /dev/nonexistent\n", "");
        controller.ensure_unmounted("/system").unwrap();
    }

    #[test]
    fn ramdisk_never_unmounts_or_formats() {
        let (_dir, controller, flash) = fixture("", "");
        controller.ensure_mounted("/tmp").unwrap();
        assert!(controller.ensure_unmounted("/tmp").is_err());
        assert!(controller.format("/tmp", None, None).is_err());
        assert!(flash.calls().is_empty(), "format of the ramdisk must never erase");
    }

    #[test]
    fn unknown_volume_is_an_error() {
        let (_dir, controller, _) = fixture("", "");
        assert!(matches!(
            controller.ensure_mounted("/nowhere"),
            Err(StorageError::UnknownVolume(_))
        ));
    }

    #[test]
    fn rmtree_except_spares_the_named_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("media")).unwrap();
        std::fs::write(dir.path().join("media/keep.jpg"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("app")).unwrap();
        std::fs::write(dir.path().join("app/gone.apk"), b"x").unwrap();
        std::fs::write(dir.path().join("file"), b"x").unwrap();

        rmtree_except(dir.path(), Some("media")).unwrap();

        assert!(dir.path().join("media/keep.jpg").exists());
        assert!(!dir.path().join("app").exists());
        assert!(!dir.path().join("file").exists());
    }

    #[test]
    fn data_media_wipe_preserves_media_and_layout_marker() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(data.join("media/0")).unwrap();
        std::fs::write(data.join("media/0/photo.jpg"), b"jpeg").unwrap();
        std::fs::create_dir_all(data.join("app")).unwrap();
        std::fs::write(data.join("app/pkg.apk"), b"apk").unwrap();
        std::fs::write(data.join(".layout_version"), b"2").unwrap();

        let table = format!(
            "{data} ext4 /dev/nonexistent\n{sdcard} datamedia {media}\n",
            data = data.display(),
            sdcard = dir.path().join("sdcard").display(),
            media = data.join("media").display(),
        );
        let (_fixture_dir, controller, flash) = fixture(&table, "");

        controller
            .format(data.to_str().unwrap(), None, None)
            .unwrap();

        assert!(data.join("media/0/photo.jpg").exists());
        assert!(!data.join("app").exists());
        assert_eq!(std::fs::read(data.join(".layout_version")).unwrap(), b"2");
        assert!(flash.calls().is_empty());
    }
}
