use crate::config::AppConfig;
use crate::core::mounts::MountController;
use crate::core::volumes::VolumeRegistry;
use crate::flash::FlashToolkit;
use crate::ui::UiAdapter;
use std::sync::Arc;

/// Process-wide collaborators threaded through every job: the immutable
/// volume registry (explicit init in main, no hidden global), the mount
/// controller, and the flash/UI seams.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub registry: Arc<VolumeRegistry>,
    pub mounts: Arc<MountController>,
    pub flash: Arc<dyn FlashToolkit>,
    pub ui: Arc<dyn UiAdapter>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        registry: VolumeRegistry,
        flash: Arc<dyn FlashToolkit>,
        ui: Arc<dyn UiAdapter>,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(registry);
        let mounts = Arc::new(MountController::new(registry.clone(), flash.clone(), &config));
        Self {
            config,
            registry,
            mounts,
            flash,
            ui,
        }
    }
}
