use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default streaming-archive format for filesystem-backed partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    Tar,
    Tgz,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Static volume table, loaded once at startup.
    pub volume_table: PathBuf,
    /// Live mount state, rescanned before every mount-dependent decision.
    pub mounts_table: PathBuf,
    /// Flash partition table used to locate flash-native partitions by name.
    pub mtd_table: PathBuf,

    pub backup_format: ArchiveFormat,
    /// Administrator-forced 3-letter format tag; wins over `backup_format`.
    pub forced_format: Option<String>,
    /// Prefer the streaming archive even for live flash-native filesystems.
    pub prefer_archive: bool,
    /// Verify the backup manifest before restoring.
    pub verify_digest: bool,
    /// Marker file (relative to primary storage) that hides per-file progress.
    pub hide_progress_marker: String,
    /// Board serial number, used to name the wimax image artifact.
    pub serial: Option<String>,

    pub low_space_mb: u64,
    pub cancel_window_secs: u64,
    pub progress_interval_ms: u64,
    pub shard_bytes: u64,
    /// Extra tar exclude patterns applied to every archive step.
    pub tar_excludes: Vec<String>,
    pub session_log: PathBuf,

    pub data_encrypted: bool,
    pub preserve_data_media: bool,

    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            volume_table: PathBuf::from("/etc/recovery.fstab"),
            mounts_table: PathBuf::from("/proc/mounts"),
            mtd_table: PathBuf::from("/proc/mtd"),
            backup_format: ArchiveFormat::Tar,
            forced_format: None,
            prefer_archive: false,
            verify_digest: false,
            hide_progress_marker: String::from("rstor/.hideprogress"),
            serial: None,
            low_space_mb: 150,
            cancel_window_secs: 5,
            progress_interval_ms: 300,
            shard_bytes: 1_000_000_000,
            tar_excludes: Vec::new(),
            session_log: PathBuf::from("/tmp/rstor.log"),
            data_encrypted: false,
            preserve_data_media: true,
            simulation: false,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    pub const FILE: &'static str = "/etc/rstor.toml";

    /// Layered load: built-in defaults, then the config file, then
    /// `RSTOR_`-prefixed environment variables, then CLI overrides.
    pub fn load<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(Self::FILE))
            .merge(Env::prefixed("RSTOR_"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract().context("Failed to load configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.backup_format, ArchiveFormat::Tar);
        assert!(config.forced_format.is_none());
        assert_eq!(config.shard_bytes, 1_000_000_000);
        assert!(config.preserve_data_media);
    }

    #[test]
    fn cli_overrides_win() {
        #[derive(Serialize)]
        struct Overrides {
            verbose: bool,
            forced_format: Option<String>,
        }

        let config = AppConfig::load(Some(&Overrides {
            verbose: true,
            forced_format: Some("tgz".into()),
        }))
        .unwrap();

        assert!(config.verbose);
        assert_eq!(config.forced_format.as_deref(), Some("tgz"));
    }
}
