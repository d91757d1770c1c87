//! End-to-end jobs against a synthetic device: a file-backed boot
//! partition, a data tree with emulated storage, and fixture volume/mount
//! tables. Archive steps shell out to the real `tar`.

use rstor::config::AppConfig;
use rstor::context::AppContext;
use rstor::core::volumes::VolumeRegistry;
use rstor::core::{BackupRestoreEngine, PartitionSelection};
use rstor::errors::StorageError;
use rstor::flash::{FlashToolkit, SimulatedFlashTools};
use rstor::ui::{JobPhase, UiAdapter, UiKey};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Front end driven by a pre-scripted key sequence.
#[derive(Default)]
struct ScriptedUi {
    keys: Mutex<VecDeque<UiKey>>,
    printed: Mutex<Vec<String>>,
}

impl ScriptedUi {
    fn with_keys(keys: &[UiKey]) -> Arc<Self> {
        Arc::new(Self {
            keys: Mutex::new(keys.iter().copied().collect()),
            printed: Mutex::new(Vec::new()),
        })
    }

    fn printed(&self) -> Vec<String> {
        self.printed.lock().unwrap().clone()
    }
}

impl UiAdapter for ScriptedUi {
    fn print(&self, msg: &str) {
        self.printed.lock().unwrap().push(msg.to_string());
    }

    fn show_progress(&self) {}
    fn set_progress(&self, _fraction: f32) {}
    fn reset_progress(&self) {}
    fn set_phase(&self, _phase: JobPhase) {}

    fn poll_key(&self) -> Option<UiKey> {
        self.keys.lock().unwrap().pop_front()
    }

    fn clear_keys(&self) {}

    fn interactive(&self) -> bool {
        true
    }
}

struct World {
    _dir: tempfile::TempDir,
    data: PathBuf,
    store: PathBuf,
    boot_device: PathBuf,
    flash: Arc<SimulatedFlashTools>,
    ctx: AppContext,
}

/// A board with a raw boot partition, an ext4 data partition carrying
/// emulated storage, and a mounted destination volume.
fn setup(ui: Arc<dyn UiAdapter>, data_mounted: bool, verify_digest: bool) -> World {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();

    let data = root.join("data");
    std::fs::create_dir_all(data.join("app")).unwrap();
    std::fs::create_dir_all(data.join("media/0")).unwrap();
    std::fs::write(data.join("app/base.apk"), b"apk bytes").unwrap();
    std::fs::write(data.join("local.prop"), b"ro.x=1").unwrap();
    std::fs::write(data.join("media/0/photo.jpg"), b"jpeg").unwrap();
    std::fs::write(data.join(".layout_version"), b"2").unwrap();

    let boot_device = root.join("bootdev");
    std::fs::write(&boot_device, b"kernel image").unwrap();

    let store = root.join("store");
    std::fs::create_dir_all(&store).unwrap();

    let table_path = root.join("volumes");
    std::fs::write(
        &table_path,
        format!(
            "/boot emmc {boot}\n\
             {data} ext4 /dev/nonexistent-data\n\
             {sdcard} datamedia {media}\n\
             {store} vfat /dev/nonexistent-store\n",
            boot = boot_device.display(),
            data = data.display(),
            sdcard = root.join("sdcard").display(),
            media = data.join("media").display(),
            store = store.display(),
        ),
    )
    .unwrap();

    let mounts_path = root.join("mounts");
    let mut mounts = format!("/dev/fixture {} vfat rw 0 0\n", store.display());
    if data_mounted {
        mounts.push_str(&format!("/dev/fixture {} ext4 rw 0 0\n", data.display()));
    }
    std::fs::write(&mounts_path, mounts).unwrap();

    let session_log = root.join("session.log");
    std::fs::write(&session_log, b"session log line\n").unwrap();

    let config = AppConfig {
        volume_table: table_path,
        mounts_table: mounts_path,
        verify_digest,
        progress_interval_ms: 1,
        session_log,
        ..AppConfig::default()
    };

    let registry = VolumeRegistry::load(&config.volume_table);
    let flash = Arc::new(SimulatedFlashTools::default());
    let toolkit: Arc<dyn FlashToolkit> = flash.clone();
    let ctx = AppContext::new(config, registry, toolkit, ui);

    World {
        _dir: dir,
        data,
        store,
        boot_device,
        flash,
        ctx,
    }
}

#[tokio::test]
async fn backup_then_restore_round_trips() {
    let ui = ScriptedUi::with_keys(&[]);
    let world = setup(ui.clone(), true, true);
    let dest = world.store.join("job-001");

    let mut engine = BackupRestoreEngine::new(world.ctx.clone());
    engine
        .backup(&dest, &PartitionSelection::default())
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(dest.join("boot.img")).unwrap(),
        b"kernel image"
    );
    assert!(dest.join("data.ext4.tar.a").exists());
    assert!(dest.join("manifest.blake3").exists());
    assert!(dest.join("rstor.log").exists());

    // Damage the live state, then restore over it.
    std::fs::write(world.data.join("local.prop"), b"tampered").unwrap();
    std::fs::write(world.data.join("junk"), b"stale").unwrap();
    std::fs::write(&world.boot_device, b"garbage").unwrap();

    let mut engine = BackupRestoreEngine::new(world.ctx.clone());
    engine
        .restore(&dest, &PartitionSelection::default())
        .await
        .unwrap();

    // Raw partition rewritten, archived tree reproduced.
    assert_eq!(std::fs::read(&world.boot_device).unwrap(), b"kernel image");
    assert_eq!(std::fs::read(world.data.join("local.prop")).unwrap(), b"ro.x=1");
    assert_eq!(
        std::fs::read(world.data.join("app/base.apk")).unwrap(),
        b"apk bytes"
    );
    // Destination was formatted first: stale files are gone.
    assert!(!world.data.join("junk").exists());
    // Emulated storage and the layout marker survive the data wipe.
    assert_eq!(
        std::fs::read(world.data.join("media/0/photo.jpg")).unwrap(),
        b"jpeg"
    );
    assert_eq!(
        std::fs::read(world.data.join(".layout_version")).unwrap(),
        b"2"
    );
}

#[tokio::test]
async fn repeated_backup_to_same_destination_is_safe() {
    let ui = ScriptedUi::with_keys(&[]);
    let world = setup(ui, true, false);
    let dest = world.store.join("job-001");

    let mut engine = BackupRestoreEngine::new(world.ctx.clone());
    engine
        .backup(&dest, &PartitionSelection::default())
        .await
        .unwrap();

    let mut engine = BackupRestoreEngine::new(world.ctx.clone());
    engine
        .backup(&dest, &PartitionSelection::default())
        .await
        .unwrap();

    assert!(dest.join("boot.img").exists());
    assert!(dest.join("data.ext4.tar.a").exists());
}

#[tokio::test]
async fn confirmed_cancellation_deletes_the_job_directory() {
    // First poll sees the cancel key, the confirmation window gets the
    // confirm key right away.
    let ui = ScriptedUi::with_keys(&[UiKey::Cancel, UiKey::Confirm]);
    let world = setup(ui.clone(), true, false);
    let dest = world.store.join("job-002");

    let mut engine = BackupRestoreEngine::new(world.ctx.clone());
    let result = engine.backup(&dest, &PartitionSelection::default()).await;

    assert!(matches!(result, Err(StorageError::Cancelled)));
    assert!(
        !dest.exists(),
        "cancelled backup must not leave a partial output directory"
    );
}

#[tokio::test]
async fn declined_cancellation_resumes_the_job() {
    // Cancel key pressed, but the confirmation window times out on an
    // unrelated key.
    let ui = ScriptedUi::with_keys(&[UiKey::Cancel, UiKey::Other]);
    let world = setup(ui, true, false);
    let dest = world.store.join("job-003");

    let mut engine = BackupRestoreEngine::new(world.ctx.clone());
    engine
        .backup(&dest, &PartitionSelection::default())
        .await
        .unwrap();
    assert!(dest.join("data.ext4.tar.a").exists());
}

#[tokio::test]
async fn failed_partition_aborts_the_whole_job() {
    // Data is not mounted and its device does not exist: every mount
    // attempt fails, and nothing after the data step may run.
    let ui = ScriptedUi::with_keys(&[]);
    let world = setup(ui.clone(), false, false);
    let dest = world.store.join("job-004");

    let mut engine = BackupRestoreEngine::new(world.ctx.clone());
    let result = engine.backup(&dest, &PartitionSelection::default()).await;

    assert!(matches!(result, Err(StorageError::Mount { .. })));
    // The earlier boot step ran...
    assert!(dest.join("boot.img").exists());
    // ...but no data artifact and no finalization happened.
    assert!(!dest.join("data.ext4.tar.a").exists());
    assert!(!dest.join("manifest.blake3").exists());
    assert!(ui.printed().iter().any(|l| l.contains("Can't mount")));
}

#[tokio::test]
async fn restore_skips_partitions_with_no_artifacts() {
    let ui = ScriptedUi::with_keys(&[]);
    let world = setup(ui.clone(), true, false);
    let empty = world.store.join("job-empty");
    std::fs::create_dir_all(&empty).unwrap();

    let mut engine = BackupRestoreEngine::new(world.ctx.clone());
    engine
        .restore(&empty, &PartitionSelection::default())
        .await
        .unwrap();

    assert!(
        ui.printed()
            .iter()
            .any(|l| l.contains("Skipping restore")),
        "missing artifacts are a skip, not a failure"
    );
    // The data tree was never formatted.
    assert!(world.data.join("app/base.apk").exists());
}

#[tokio::test]
async fn restore_fails_on_manifest_mismatch_before_touching_partitions() {
    let ui = ScriptedUi::with_keys(&[]);
    let world = setup(ui, true, true);
    let dest = world.store.join("job-005");

    let mut engine = BackupRestoreEngine::new(world.ctx.clone());
    engine
        .backup(&dest, &PartitionSelection::default())
        .await
        .unwrap();

    std::fs::write(dest.join("data.ext4.tar.a"), b"corrupted").unwrap();
    std::fs::write(&world.boot_device, b"garbage").unwrap();

    let mut engine = BackupRestoreEngine::new(world.ctx.clone());
    let result = engine.restore(&dest, &PartitionSelection::default()).await;

    assert!(matches!(result, Err(StorageError::Checksum(_))));
    // Fail-fast: the boot partition was never flashed.
    assert_eq!(std::fs::read(&world.boot_device).unwrap(), b"garbage");
    let flashed: Vec<String> = world.flash.calls();
    assert!(flashed.iter().all(|c| !c.starts_with("restore")));
}
