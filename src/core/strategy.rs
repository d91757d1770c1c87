//! Encoding strategy selection.
//!
//! Backups carry no metadata store: the strategy used to pack a partition
//! must be re-derivable at restore time from file naming alone. Selection
//! is a pure function of the declared filesystem, the administrator
//! preference and the volume's role.

use crate::config::{AppConfig, ArchiveFormat};
use crate::core::process::{self, JobPipeline};
use crate::errors::{Result, StorageError};
use crate::flash::FlashClass;
use std::path::{Path, PathBuf};

/// Probe order for restore artifacts. The flash-native image comes first;
/// `auto` is the catch-all written for volumes with no live type.
pub const PROBE_FS_ORDER: &[&str] = &[
    "yaffs2", "ext2", "ext3", "ext4", "f2fs", "ntfs", "vfat", "exfat", "rfs", "auto",
];

/// Modern extent-based types whose archives restore onto one another; a
/// declared/live mismatch inside this family is immaterial.
const EXTENT_FS_FAMILY: &[&str] = &["ext4", "f2fs"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingStrategy {
    /// Block-level copy of a raw partition class.
    RawImage(FlashClass),
    /// Flash-native filesystem image (mkyaffs2image/unyaffs).
    FlashImage,
    Tar,
    TarGzip,
}

impl EncodingStrategy {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::RawImage(_) | Self::FlashImage => "img",
            Self::Tar => "tar",
            Self::TarGzip => "tar.gz",
        }
    }
}

/// The configured streaming-archive default, with the forced 3-letter tag
/// taking precedence over the config file.
pub fn default_archive(config: &AppConfig) -> EncodingStrategy {
    if let Some(tag) = &config.forced_format {
        let tag: String = tag.chars().take(3).collect();
        return if tag == "tgz" {
            EncodingStrategy::TarGzip
        } else {
            EncodingStrategy::Tar
        };
    }
    match config.backup_format {
        ArchiveFormat::Tgz => EncodingStrategy::TarGzip,
        ArchiveFormat::Tar => EncodingStrategy::Tar,
    }
}

/// Pick the pack strategy for a filesystem-backed partition.
///
/// The data partition of an emulated-storage device always streams: its
/// tree mixes real app data with user storage and must be archived
/// uniformly. A live flash-native filesystem gets the flash image unless
/// the archive override is set.
pub fn select_backup_strategy(
    config: &AppConfig,
    is_data_media_data: bool,
    live_fs: Option<&str>,
) -> EncodingStrategy {
    let default = default_archive(config);
    if is_data_media_data || config.forced_format.is_some() {
        return default;
    }
    if live_fs == Some(crate::core::volumes::FLASH_NATIVE_FS) && !config.prefer_archive {
        return EncodingStrategy::FlashImage;
    }
    default
}

/// A restore decision recovered from the backup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePlan {
    pub strategy: EncodingStrategy,
    /// Filesystem the backup was taken from, as encoded in the file name.
    pub declared_fs: Option<String>,
    /// Artifact path without any shard suffix.
    pub archive: PathBuf,
}

/// Rediscover the unpack strategy for one partition from file naming.
/// Probes each filesystem in fixed priority order against three candidate
/// artifacts (flash image, plain tar, gzip tar), accepting either the exact
/// name or its first shard. `None` means: skip this partition.
pub fn select_restore_strategy(backup_root: &Path, leaf: &str) -> Option<RestorePlan> {
    const CANDIDATES: &[EncodingStrategy] = &[
        EncodingStrategy::FlashImage,
        EncodingStrategy::Tar,
        EncodingStrategy::TarGzip,
    ];

    for fs in PROBE_FS_ORDER {
        for strategy in CANDIDATES {
            let archive = backup_root.join(format!("{leaf}.{fs}.{}", strategy.extension()));
            let first_shard = PathBuf::from(format!("{}.a", archive.display()));
            if archive.exists() || first_shard.exists() {
                return Some(RestorePlan {
                    strategy: *strategy,
                    declared_fs: Some(fs.to_string()),
                    archive,
                });
            }
        }
    }
    None
}

/// Which filesystem the restore target should be formatted as. `None`
/// means: trust the volume's own declared configuration.
///
/// A declared/live mismatch within the extent-based family is ignored and
/// the live type wins; any other declared type is honored as-is.
pub fn effective_restore_fs(
    volume_fs: &str,
    is_data_media_data: bool,
    declared: Option<&str>,
) -> Option<String> {
    if volume_fs == "auto" || is_data_media_data {
        return None;
    }
    let declared = declared?;
    if declared != volume_fs
        && EXTENT_FS_FAMILY.contains(&volume_fs)
        && EXTENT_FS_FAMILY.contains(&declared)
    {
        return None;
    }
    Some(declared.to_string())
}

/// How archive bytes move while the line reader runs.
pub enum Pump {
    /// Pack: drain the pipeline's stdout into shard files.
    DrainToShards { base: PathBuf, limit: u64 },
    /// Unpack: feed the shard files into the pipeline's stdin.
    FeedFromShards { files: Vec<PathBuf> },
    /// The tool does its own file I/O.
    None,
}

pub struct ArchiverJob {
    pub pipeline: JobPipeline,
    pub pump: Pump,
}

impl EncodingStrategy {
    /// Spawn the pack pipeline for this strategy. `prefix` is the artifact
    /// path without extension (`<dir>/<leaf>.<fs>`).
    pub fn spawn_pack(
        &self,
        source: &Path,
        prefix: &Path,
        excludes: &[String],
        shard_bytes: u64,
    ) -> Result<ArchiverJob> {
        let base = PathBuf::from(format!("{}.{}", prefix.display(), self.extension()));
        match self {
            Self::Tar => Ok(ArchiverJob {
                pipeline: process::spawn_tar_pack(source, excludes)?,
                pump: Pump::DrainToShards {
                    base,
                    limit: shard_bytes,
                },
            }),
            Self::TarGzip => Ok(ArchiverJob {
                pipeline: process::spawn_tar_gzip_pack(source, excludes)?,
                pump: Pump::DrainToShards {
                    base,
                    limit: shard_bytes,
                },
            }),
            Self::FlashImage => Ok(ArchiverJob {
                pipeline: process::spawn_flash_image_pack(source, &base)?,
                pump: Pump::None,
            }),
            Self::RawImage(_) => Err(StorageError::encoding(
                "pack",
                "raw partitions are copied block-level, not archived",
            )),
        }
    }

    /// Spawn the unpack pipeline. `archive` is the artifact path without
    /// any shard suffix.
    pub fn spawn_unpack(&self, archive: &Path, dest: &Path) -> Result<ArchiverJob> {
        match self {
            Self::Tar => Ok(ArchiverJob {
                pipeline: process::spawn_tar_unpack(dest)?,
                pump: Pump::FeedFromShards {
                    files: process::shard_files(archive),
                },
            }),
            Self::TarGzip => Ok(ArchiverJob {
                pipeline: process::spawn_tar_gzip_unpack(dest)?,
                pump: Pump::FeedFromShards {
                    files: process::shard_files(archive),
                },
            }),
            Self::FlashImage => Ok(ArchiverJob {
                pipeline: process::spawn_flash_image_unpack(archive, dest)?,
                pump: Pump::None,
            }),
            Self::RawImage(_) => Err(StorageError::encoding(
                "unpack",
                "raw partitions are copied block-level, not archived",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AppConfig {
        AppConfig::default()
    }

    #[test]
    fn forced_tag_overrides_configured_default() {
        let mut cfg = config();
        cfg.backup_format = ArchiveFormat::Tar;
        cfg.forced_format = Some("tgz".into());
        assert_eq!(default_archive(&cfg), EncodingStrategy::TarGzip);

        cfg.forced_format = Some("tar".into());
        assert_eq!(default_archive(&cfg), EncodingStrategy::Tar);
    }

    #[test]
    fn live_flash_native_prefers_flash_image() {
        let cfg = config();
        assert_eq!(
            select_backup_strategy(&cfg, false, Some("yaffs2")),
            EncodingStrategy::FlashImage
        );

        let mut archive_cfg = config();
        archive_cfg.prefer_archive = true;
        assert_eq!(
            select_backup_strategy(&archive_cfg, false, Some("yaffs2")),
            EncodingStrategy::Tar
        );
    }

    #[test]
    fn data_media_data_always_streams() {
        let cfg = config();
        assert_eq!(
            select_backup_strategy(&cfg, true, Some("yaffs2")),
            EncodingStrategy::Tar
        );
    }

    #[test]
    fn probe_finds_sharded_gzip_archive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("boot.ext4.tar.gz.a"), b"shard").unwrap();

        let plan = select_restore_strategy(dir.path(), "boot").unwrap();
        assert_eq!(plan.strategy, EncodingStrategy::TarGzip);
        assert_eq!(plan.declared_fs.as_deref(), Some("ext4"));
        assert_eq!(
            plan.archive.file_name().unwrap().to_string_lossy(),
            "boot.ext4.tar.gz"
        );
    }

    #[test]
    fn probe_priority_is_flash_native_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("system.yaffs2.img"), b"img").unwrap();
        std::fs::write(dir.path().join("system.ext4.tar"), b"tar").unwrap();

        let plan = select_restore_strategy(dir.path(), "system").unwrap();
        assert_eq!(plan.strategy, EncodingStrategy::FlashImage);
        assert_eq!(plan.declared_fs.as_deref(), Some("yaffs2"));
    }

    #[test]
    fn nothing_found_skips_the_partition() {
        let dir = tempfile::tempdir().unwrap();
        assert!(select_restore_strategy(dir.path(), "cache").is_none());
    }

    #[test]
    fn extent_family_mismatch_is_immaterial() {
        // Live f2fs restoring an ext4 backup formats as f2fs.
        assert_eq!(effective_restore_fs("f2fs", false, Some("ext4")), None);
        assert_eq!(effective_restore_fs("ext4", false, Some("f2fs")), None);
        // Same type is honored, unrelated declared types too.
        assert_eq!(
            effective_restore_fs("ext4", false, Some("ext4")).as_deref(),
            Some("ext4")
        );
        assert_eq!(
            effective_restore_fs("rfs", false, Some("vfat")).as_deref(),
            Some("vfat")
        );
        // Auto volumes and emulated-storage data trust their own config.
        assert_eq!(effective_restore_fs("auto", false, Some("ext4")), None);
        assert_eq!(effective_restore_fs("ext4", true, Some("ext4")), None);
    }
}
