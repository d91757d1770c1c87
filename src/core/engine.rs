//! Backup/restore orchestration.
//!
//! Strictly sequential: one partition is fully processed before the next
//! starts, because the archivers and the flash tools share one storage bus.
//! The only suspension points are reads of the running archiver's line
//! output; cancellation is observed between lines, never by preempting the
//! subprocess from another thread.

use crate::core::mounts::ensure_directory;
use crate::core::process::{self, JobPipeline};
use crate::core::progress::{self, JobProgress};
use crate::core::strategy::{self, ArchiverJob, EncodingStrategy, Pump, RestorePlan};
use crate::core::verifier;
use crate::context::AppContext;
use crate::errors::{Result, StorageError};
use crate::ui::{JobPhase, UiAdapter, UiKey};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Per-partition inclusion flags for one job.
#[derive(Debug, Clone, Copy)]
pub struct PartitionSelection {
    pub boot: bool,
    pub system: bool,
    pub data: bool,
    pub cache: bool,
    pub sdext: bool,
    pub wimax: bool,
}

impl Default for PartitionSelection {
    fn default() -> Self {
        Self {
            boot: true,
            system: true,
            data: true,
            cache: true,
            sdext: true,
            wimax: false,
        }
    }
}

enum ArchiveRole {
    Backup { job_dir: PathBuf },
    Restore,
}

/// One backup or restore invocation. Owns the progress counters and the
/// cancellation flag; dropped when the job ends.
pub struct BackupRestoreEngine {
    ctx: AppContext,
    progress: JobProgress,
    cancel: CancellationToken,
}

impl BackupRestoreEngine {
    pub fn new(ctx: AppContext) -> Self {
        let progress = JobProgress::new(
            ctx.ui.clone(),
            Duration::from_millis(ctx.config.progress_interval_ms),
        );
        Self {
            ctx,
            progress,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn backup(&mut self, dest: &Path, selection: &PartitionSelection) -> Result<()> {
        self.ctx.ui.set_phase(JobPhase::Working);
        let result = self.run_backup(dest, selection).await;
        self.finish(result)
    }

    pub async fn restore(&mut self, src: &Path, selection: &PartitionSelection) -> Result<()> {
        self.ctx.ui.set_phase(JobPhase::Working);
        let result = self.run_restore(src, selection).await;
        self.finish(result)
    }

    fn finish(&mut self, result: Result<()>) -> Result<()> {
        self.progress.reset();
        match &result {
            Ok(()) | Err(StorageError::Cancelled) => self.ctx.ui.set_phase(JobPhase::Idle),
            Err(e) => {
                self.ctx.ui.set_phase(JobPhase::Error);
                self.ctx.ui.print(&e.to_string());
            }
        }
        result
    }

    async fn run_backup(&mut self, dest: &Path, selection: &PartitionSelection) -> Result<()> {
        let dest_str = dest.to_string_lossy().into_owned();
        if let Err(e) = self.ctx.mounts.ensure_mounted(&dest_str) {
            self.ctx.ui.print("Can't mount backup path.");
            return Err(e);
        }
        self.ctx
            .ui
            .print(&format!("Starting backup to {}.", dest.display()));
        self.report_free_space(&dest_str)?;
        ensure_directory(dest)?;

        if selection.boot {
            self.backup_partition(dest, "/boot", true).await?;
        }
        if selection.wimax {
            self.backup_wimax(dest).await?;
        }
        if selection.system {
            self.backup_partition(dest, "/system", true).await?;
            for extra in ["/custpack", "/cust"] {
                if self.ctx.registry.volume_for_path(extra).is_some() {
                    self.backup_partition(dest, extra, true).await?;
                }
            }
        }
        if selection.data {
            let data_root = self.data_mount_point();
            self.backup_partition(dest, &data_root, true).await?;
            if self.ctx.registry.has_datadata() {
                self.backup_partition(dest, "/datadata", true).await?;
            }
            if let Some(secure) = self.ctx.registry.android_secure_path() {
                if Path::new(&secure).exists() {
                    self.backup_partition_extended(dest, &secure, false).await?;
                }
            }
        }
        if selection.cache {
            self.backup_partition(dest, "/cache", false).await?;
        }
        if selection.sdext {
            self.backup_sd_ext(dest).await?;
        }

        self.ctx.ui.print("Generating backup manifest...");
        if let Err(e) = verifier::write_manifest(dest) {
            // Partition payloads are already safely on disk at this point;
            // the job still fails, the data does not.
            self.ctx.ui.print("Error while generating the backup manifest!");
            return Err(e);
        }

        if std::fs::copy(&self.ctx.config.session_log, dest.join("rstor.log")).is_err() {
            warn!("could not copy the session log into the backup");
        }
        relax_permissions(dest);
        nix::unistd::sync();

        self.progress.reset();
        self.ctx.ui.print("Backup complete!");
        Ok(())
    }

    async fn run_restore(&mut self, src: &Path, selection: &PartitionSelection) -> Result<()> {
        self.progress.indeterminate();

        let src_str = src.to_string_lossy().into_owned();
        if let Err(e) = self.ctx.mounts.ensure_mounted(&src_str) {
            self.ctx.ui.print("Can't mount backup path.");
            return Err(e);
        }

        if self.ctx.config.verify_digest {
            self.ctx.ui.print("Checking backup manifest...");
            if let Err(e) = verifier::check_manifest(src) {
                self.ctx.ui.print("Manifest mismatch!");
                return Err(e);
            }
        }

        self.ctx
            .ui
            .print(&format!("Starting restore from {}.", src.display()));

        if selection.boot {
            self.restore_partition(src, "/boot", true).await?;
        }
        if selection.wimax {
            self.restore_wimax(src).await?;
        }
        if selection.system {
            self.restore_partition(src, "/system", true).await?;
            for extra in ["/custpack", "/cust"] {
                if self.ctx.registry.volume_for_path(extra).is_some() {
                    self.restore_partition(src, extra, true).await?;
                }
            }
        }
        if selection.data {
            let data_root = self.data_mount_point();
            self.restore_partition(src, &data_root, true).await?;
            if self.ctx.registry.has_datadata() {
                self.restore_partition(src, "/datadata", true).await?;
            }
            if let Some(secure) = self.ctx.registry.android_secure_path() {
                if Path::new(&secure).exists() {
                    self.restore_partition_extended(src, &secure, false).await?;
                }
            }
        }
        if selection.cache {
            self.restore_partition(src, "/cache", false).await?;
        }
        if selection.sdext {
            self.restore_partition(src, "/sd-ext", true).await?;
        }

        nix::unistd::sync();
        self.progress.reset();
        self.ctx.ui.print("Restore complete!");
        Ok(())
    }

    /// Raw single-partition dump over stdout, for stream-based transfer.
    pub async fn dump(&mut self, partition: &str) -> Result<()> {
        self.progress.indeterminate();
        match partition {
            "boot" => {
                let volume = self
                    .ctx
                    .registry
                    .volume_for_path("/boot")
                    .cloned()
                    .ok_or_else(|| StorageError::UnknownVolume(PathBuf::from("/boot")))?;
                let device = volume
                    .device
                    .ok_or_else(|| StorageError::UnknownVolume(PathBuf::from("/boot")))?;
                let mut src = tokio::fs::File::open(&device).await?;
                let mut out = tokio::io::stdout();
                tokio::io::copy(&mut src, &mut out).await?;
                out.flush().await?;
                Ok(())
            }
            "system" | "data" | "custpack" | "cust" => {
                let root = if partition == "data" {
                    self.data_mount_point()
                } else {
                    format!("/{partition}")
                };
                self.ctx.mounts.ensure_mounted(&root)?;

                let excludes = self.tar_excludes(&root);
                let mut pipeline = process::spawn_tar_pack(Path::new(&root), &excludes)?;
                let archive = pipeline
                    .take_stdout()
                    .ok_or_else(|| StorageError::encoding("tar", "no archive stream"))?;

                let mut out = tokio::io::stdout();
                let (copied, ()) = tokio::join!(
                    async {
                        let mut archive = archive;
                        tokio::io::copy(&mut archive, &mut out).await
                    },
                    async {
                        while let Ok(Some(_)) = pipeline.next_line().await {}
                    }
                );
                copied?;
                out.flush().await?;
                pipeline.wait().await
            }
            other => Err(StorageError::UnknownVolume(PathBuf::from(other))),
        }
    }

    /// Counterpart of [`dump`]: consume an archive or raw image from stdin.
    pub async fn undump(&mut self, partition: &str) -> Result<()> {
        self.progress.indeterminate();
        match partition {
            "boot" => {
                let volume = self
                    .ctx
                    .registry
                    .volume_for_path("/boot")
                    .cloned()
                    .ok_or_else(|| StorageError::UnknownVolume(PathBuf::from("/boot")))?;
                let device = volume
                    .device
                    .ok_or_else(|| StorageError::UnknownVolume(PathBuf::from("/boot")))?;
                let mut src = tokio::io::stdin();
                let mut out = tokio::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&device)
                    .await?;
                tokio::io::copy(&mut src, &mut out).await?;
                out.sync_all().await?;
                Ok(())
            }
            "system" | "data" | "custpack" | "cust" => {
                let root = if partition == "data" {
                    self.data_mount_point()
                } else {
                    format!("/{partition}")
                };
                let volume = self
                    .ctx
                    .registry
                    .volume_for_path(&root)
                    .cloned()
                    .ok_or_else(|| StorageError::UnknownVolume(PathBuf::from(&root)))?;

                let is_dm_data = self.ctx.registry.is_data_root(&root);
                let declared = strategy::effective_restore_fs(
                    &volume.fs_type,
                    is_dm_data,
                    Some(&volume.fs_type),
                );

                ensure_directory(Path::new(&root))?;
                match &declared {
                    None => self.ctx.mounts.format(&root, None, None)?,
                    Some(fs) => {
                        self.ctx
                            .mounts
                            .format(&root, volume.device.as_deref(), Some(fs))?
                    }
                }
                self.ctx.mounts.ensure_mounted(&root)?;

                let mut pipeline = process::spawn_tar_unpack(Path::new(&root))?;
                let sink = pipeline
                    .take_stdin()
                    .ok_or_else(|| StorageError::encoding("tar", "no archive sink"))?;

                let (fed, ()) = tokio::join!(
                    async {
                        let mut stdin = tokio::io::stdin();
                        let mut sink = sink;
                        let n = tokio::io::copy(&mut stdin, &mut sink).await?;
                        sink.shutdown().await?;
                        Ok::<u64, std::io::Error>(n)
                    },
                    async {
                        while let Ok(Some(_)) = pipeline.next_line().await {}
                    }
                );
                fed?;
                pipeline.wait().await?;
                nix::unistd::sync();
                Ok(())
            }
            other => Err(StorageError::UnknownVolume(PathBuf::from(other))),
        }
    }

    /// The data partition's mount point, derived from the emulated-storage
    /// alias when one is declared.
    fn data_mount_point(&self) -> String {
        self.ctx
            .registry
            .data_volume()
            .map(|v| v.mount_point.clone())
            .unwrap_or_else(|| "/data".to_string())
    }

    fn report_free_space(&self, dest: &str) -> Result<()> {
        let registry = &self.ctx.registry;
        let volume = if registry.is_data_media_path(dest) {
            registry.data_volume()
        } else {
            registry.volume_for_path(dest)
        };
        let Some(volume) = volume else {
            self.ctx.ui.print("Unable to find volume for backup path.");
            return Err(StorageError::UnknownVolume(PathBuf::from(dest)));
        };

        let free = match self.ctx.mounts.free_bytes(&volume.mount_point) {
            Ok(free) => free,
            Err(e) => {
                self.ctx.ui.print("Unable to stat backup path.");
                return Err(e);
            }
        };
        let free_mb = free / (1024 * 1024);
        self.ctx
            .ui
            .print(&format!("Backup storage space free: {free_mb} MB"));
        if free_mb < self.ctx.config.low_space_mb {
            self.ctx
                .ui
                .print("There may not be enough free space to complete the backup... continuing...");
        }
        Ok(())
    }

    /// Back up one partition root. Undeclared volumes are skipped; raw
    /// classes are copied block-level, everything else is archived.
    async fn backup_partition(&mut self, dest: &Path, root: &str, unmount_after: bool) -> Result<()> {
        let Some(volume) = self.ctx.registry.volume_for_path(root).cloned() else {
            return Ok(());
        };

        if let Some(class) = volume.flash_class() {
            self.ctx.ui.print(&format!("Backing up {root}..."));
            let device = volume.device.clone().ok_or_else(|| {
                StorageError::encoding("raw backup", format!("no device declared for {root}"))
            })?;
            let leaf = path_leaf(root);
            let artifact = dest.join(format!("{leaf}.img"));
            if let Err(e) = self.ctx.flash.backup_raw(class, &device, &artifact) {
                self.ctx
                    .ui
                    .print(&format!("Error while backing up {leaf} image!"));
                return Err(e);
            }
            self.ctx
                .ui
                .print(&format!("Backup of {leaf} image completed."));
            return Ok(());
        }

        self.backup_partition_extended(dest, root, unmount_after).await
    }

    async fn backup_partition_extended(
        &mut self,
        dest: &Path,
        mount_point: &str,
        unmount_after: bool,
    ) -> Result<()> {
        let name = path_leaf(mount_point).to_string();
        let callback = self.progress_callback_enabled();

        self.ctx.ui.print(&format!("Backing up {name}..."));
        if let Err(e) = self.ctx.mounts.ensure_mounted(mount_point) {
            self.ctx.ui.print(&format!("Can't mount {mount_point}!"));
            return Err(e);
        }

        let is_dm_data = self.ctx.registry.is_data_root(mount_point);
        let exclude_dir = if is_dm_data {
            self.ctx.registry.media_dir()
        } else {
            None
        };
        let total = progress::count_files(Path::new(mount_point), exclude_dir.as_deref());
        self.progress.begin_step(total);

        let live_fs = self.ctx.mounts.live_fs_type(mount_point);
        let strategy =
            strategy::select_backup_strategy(&self.ctx.config, is_dm_data, live_fs.as_deref());
        let prefix = dest.join(format!("{name}.{}", live_fs.as_deref().unwrap_or("auto")));

        let excludes = self.tar_excludes(mount_point);
        let job = strategy.spawn_pack(
            Path::new(mount_point),
            &prefix,
            &excludes,
            self.ctx.config.shard_bytes,
        )?;

        let result = self
            .run_archiver(
                job,
                ArchiveRole::Backup {
                    job_dir: dest.to_path_buf(),
                },
                callback,
            )
            .await;

        if unmount_after {
            let _ = self.ctx.mounts.ensure_unmounted(mount_point);
        }

        if let Err(e) = result {
            if !matches!(e, StorageError::Cancelled) {
                self.ctx
                    .ui
                    .print(&format!("Error while making a backup image of {mount_point}!"));
            }
            return Err(e);
        }
        self.ctx.ui.print(&format!("Backup of {name} completed."));
        Ok(())
    }

    async fn backup_wimax(&mut self, dest: &Path) -> Result<()> {
        let Some(volume) = self.ctx.registry.volume_for_path("/wimax").cloned() else {
            return Ok(());
        };
        let Some(device) = volume.device.clone() else {
            return Ok(());
        };
        if !Path::new(&device).exists() {
            return Ok(());
        }
        let Some(class) = volume.flash_class() else {
            warn!("wimax volume is not a raw class, skipping");
            return Ok(());
        };

        self.ctx.ui.print("Backing up WiMAX...");
        let serial = self.ctx.config.serial.clone().unwrap_or_default();
        let artifact = dest.join(format!("wimax.{serial}.img"));
        if let Err(e) = self.ctx.flash.backup_raw(class, &device, &artifact) {
            self.ctx.ui.print("Error while dumping WiMAX image!");
            return Err(e);
        }
        Ok(())
    }

    async fn backup_sd_ext(&mut self, dest: &Path) -> Result<()> {
        let device = self
            .ctx
            .registry
            .volume_for_path("/sd-ext")
            .and_then(|v| v.device.clone());
        let present = device.as_deref().is_some_and(|d| Path::new(d).exists());
        if !present {
            info!("no sd-ext found, skipping backup of /sd-ext");
            return Ok(());
        }
        if self.ctx.mounts.ensure_mounted("/sd-ext").is_err() {
            info!("could not mount sd-ext, skipping backup of /sd-ext");
            return Ok(());
        }
        self.backup_partition(dest, "/sd-ext", true).await
    }

    /// Restore one partition root. Raw classes skip quietly when the image
    /// is absent; everything else rediscovers its strategy from the backup
    /// directory.
    async fn restore_partition(&mut self, src: &Path, root: &str, unmount_after: bool) -> Result<()> {
        let Some(volume) = self.ctx.registry.volume_for_path(root).cloned() else {
            return Ok(());
        };

        if let Some(class) = volume.flash_class() {
            let leaf = path_leaf(root);
            let artifact = src.join(format!("{leaf}.img"));
            if !artifact.exists() {
                self.ctx
                    .ui
                    .print(&format!("{leaf}.img not found. Skipping restore of {root}."));
                return Ok(());
            }

            self.ctx.ui.print(&format!("Restoring {root}..."));
            self.ctx.ui.print(&format!("Erasing {leaf} before restore..."));
            if let Err(e) = self.ctx.mounts.format(root, None, None) {
                self.ctx.ui.print(&format!("Error while erasing {leaf} image!"));
                return Err(e);
            }

            self.ctx.ui.print(&format!("Restoring {leaf} image..."));
            let device = volume.device.clone().ok_or_else(|| {
                StorageError::encoding("raw restore", format!("no device declared for {root}"))
            })?;
            if let Err(e) = self.ctx.flash.restore_raw(class, &device, &artifact) {
                self.ctx.ui.print(&format!("Error while flashing {leaf} image!"));
                return Err(e);
            }
            return Ok(());
        }

        self.restore_partition_extended(src, root, unmount_after).await
    }

    async fn restore_partition_extended(
        &mut self,
        src: &Path,
        mount_point: &str,
        unmount_after: bool,
    ) -> Result<()> {
        let name = path_leaf(mount_point).to_string();
        let volume = self.ctx.registry.volume_for_path(mount_point).cloned();

        self.ctx.ui.print(&format!("Restoring {mount_point}..."));

        // Old-style single image first; otherwise rediscover the strategy
        // from the artifact names.
        let legacy = src.join(format!("{name}.img"));
        let plan = if legacy.exists() {
            RestorePlan {
                strategy: EncodingStrategy::FlashImage,
                declared_fs: None,
                archive: legacy,
            }
        } else {
            match strategy::select_restore_strategy(src, &name) {
                Some(plan) => plan,
                None => {
                    self.ctx.ui.print(&format!(
                        "{name} backup file not found. Skipping restore of {mount_point}."
                    ));
                    return Ok(());
                }
            }
        };
        info!(archive = %plan.archive.display(), "found backup artifact");

        let is_dm_data = self.ctx.registry.is_data_root(mount_point);
        let declared = match &volume {
            Some(v) => {
                strategy::effective_restore_fs(&v.fs_type, is_dm_data, plan.declared_fs.as_deref())
            }
            None => None,
        };

        ensure_directory(Path::new(mount_point))?;
        let callback = self.progress_callback_enabled();

        let formatted = match &declared {
            None => self.ctx.mounts.format(mount_point, None, None),
            Some(fs) => self.ctx.mounts.format(
                mount_point,
                volume.as_ref().and_then(|v| v.device.as_deref()),
                Some(fs),
            ),
        };
        if let Err(e) = formatted {
            self.ctx
                .ui
                .print(&format!("Error while formatting {mount_point}!"));
            return Err(e);
        }

        if let Err(e) = self.ctx.mounts.ensure_mounted(mount_point) {
            self.ctx.ui.print(&format!("Can't mount {mount_point}!"));
            return Err(e);
        }

        let job = plan.strategy.spawn_unpack(&plan.archive, Path::new(mount_point))?;
        let result = self.run_archiver(job, ArchiveRole::Restore, callback).await;

        if unmount_after {
            let _ = self.ctx.mounts.ensure_unmounted(mount_point);
        }

        if let Err(e) = result {
            if !matches!(e, StorageError::Cancelled) {
                self.ctx
                    .ui
                    .print(&format!("Error while restoring {mount_point}!"));
            }
            return Err(e);
        }
        Ok(())
    }

    async fn restore_wimax(&mut self, src: &Path) -> Result<()> {
        let Some(volume) = self.ctx.registry.volume_for_path("/wimax").cloned() else {
            return Ok(());
        };
        let Some(device) = volume.device.clone() else {
            return Ok(());
        };
        if !Path::new(&device).exists() {
            return Ok(());
        }

        let serial = self.ctx.config.serial.clone().unwrap_or_default();
        let artifact = src.join(format!("wimax.{serial}.img"));
        if !artifact.exists() {
            self.ctx
                .ui
                .print("WARNING: WiMAX partition exists, but the backup has no WiMAX image.");
            self.ctx
                .ui
                .print("         Create a new backup to protect your WiMAX keys.");
            return Ok(());
        }

        self.ctx.ui.print("Erasing WiMAX before restore...");
        if let Err(e) = self.ctx.mounts.format("/wimax", None, None) {
            self.ctx.ui.print("Error while formatting wimax!");
            return Err(e);
        }

        self.ctx.ui.print("Restoring WiMAX image...");
        let class = volume.flash_class().ok_or_else(|| {
            StorageError::encoding("raw restore", "wimax volume is not a raw class")
        })?;
        self.ctx.flash.restore_raw(class, &device, &artifact)
    }

    fn tar_excludes(&self, mount_point: &str) -> Vec<String> {
        let mut excludes = self.ctx.config.tar_excludes.clone();
        if self.ctx.registry.is_data_root(mount_point) {
            if let Some(media) = self.ctx.registry.media_dir() {
                if let Some(media_name) = media.file_name() {
                    excludes.push(format!(
                        "{}/{}",
                        path_leaf(mount_point),
                        media_name.to_string_lossy()
                    ));
                }
            }
        }
        excludes
    }

    /// Per-file progress is suppressed when the hide-progress marker exists
    /// on primary storage.
    fn progress_callback_enabled(&self) -> bool {
        let Some(primary) = self.ctx.registry.primary_storage() else {
            return true;
        };
        let marker = format!("{primary}/{}", self.ctx.config.hide_progress_marker);
        let _ = self.ctx.mounts.ensure_mounted(&marker);
        !Path::new(&marker).exists()
    }

    /// Drive one archiver pipeline to completion: pump archive bytes on one
    /// side, consume listing lines on the other, polling for cancellation
    /// between lines.
    async fn run_archiver(
        &mut self,
        job: ArchiverJob,
        role: ArchiveRole,
        callback: bool,
    ) -> Result<()> {
        let ArchiverJob { mut pipeline, pump } = job;
        let stdout = pipeline.take_stdout();
        let stdin = pipeline.take_stdin();

        let pump_fut = async move {
            match pump {
                Pump::DrainToShards { base, limit } => match stdout {
                    Some(out) => process::write_shards(out, &base, limit).await,
                    None => Ok(0),
                },
                Pump::FeedFromShards { files } => match stdin {
                    Some(sink) => process::feed_shards(&files, sink).await,
                    None => Ok(0),
                },
                Pump::None => Ok(0),
            }
        };

        let ui = self.ctx.ui.clone();
        let window = Duration::from_secs(self.ctx.config.cancel_window_secs);
        let cancel = self.cancel.clone();
        let progress = &mut self.progress;

        let watch_fut = async {
            let mut banner_pending = true;
            loop {
                match pipeline.next_line().await {
                    Ok(Some(line)) => {
                        if callback {
                            progress.on_file(line.trim_end());
                        }
                        if check_cancel(ui.as_ref(), window, &mut banner_pending, &mut pipeline)
                            .await
                        {
                            cancel.cancel();
                            break;
                        }
                    }
                    _ => break,
                }
            }
        };

        let (pump_result, ()) = tokio::join!(pump_fut, watch_fut);

        if self.cancel.is_cancelled() {
            nix::unistd::sync();
            match role {
                ArchiveRole::Backup { job_dir } => {
                    self.ctx.ui.print("Deleting incomplete backup...");
                    let _ = std::fs::remove_dir_all(&job_dir);
                }
                ArchiveRole::Restore => {
                    self.ctx
                        .ui
                        .print("Partition was left corrupted after cancel!");
                }
            }
            return Err(StorageError::Cancelled);
        }

        let waited = pipeline.wait().await;
        // A pump hitting a dead pipe is the tool's failure, reported by its
        // exit status; any other pump error (out of space, bad shard) is the
        // real cause.
        match pump_result {
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e.into()),
            _ => {}
        }
        waited
    }
}

/// One cancellation poll. A one-shot banner precedes the first poll of each
/// partition; the cancel key opens a confirmation window with a fixed
/// bounded wait, and only a confirming key inside it terminates the
/// archiver.
async fn check_cancel(
    ui: &dyn UiAdapter,
    window: Duration,
    banner_pending: &mut bool,
    pipeline: &mut JobPipeline,
) -> bool {
    if !ui.interactive() {
        return false;
    }
    if *banner_pending {
        ui.clear_keys();
        ui.print("Press the cancel key to abort this job.");
        *banner_pending = false;
    }

    if ui.poll_key() != Some(UiKey::Cancel) {
        return false;
    }

    ui.print("Really cancel? (press again to confirm)");
    ui.clear_keys();
    let deadline = Instant::now() + window;
    let confirmed = loop {
        if Instant::now() >= deadline {
            break false;
        }
        match ui.poll_key() {
            Some(UiKey::Confirm) | Some(UiKey::Cancel) => break true,
            Some(UiKey::Other) => break false,
            None => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    };
    if !confirmed {
        return false;
    }

    ui.print("Cancelling, please wait...");
    ui.clear_keys();
    pipeline.terminate().await;
    true
}

fn path_leaf(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Open up the finished backup so any client can read it back off the card.
fn relax_permissions(dir: &Path) {
    let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777));
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let _ = std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(0o777));
        }
    }
}
