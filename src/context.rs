use std::sync::Arc;

use crate::adapters;
use crate::config::AppConfig;
use crate::core::drive_manager::DriveManager;
use crate::core::hardware::DriveAdapter;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub adapter: Arc<dyn DriveAdapter>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let adapter = adapters::get_adapter(config.simulation);
        Self::with_adapter(config, adapter)
    }

    pub fn with_adapter(config: AppConfig, adapter: Arc<dyn DriveAdapter>) -> Self {
        Self {
            config: Arc::new(config),
            adapter,
        }
    }

    pub fn drive_manager(&self) -> DriveManager {
        DriveManager::new(Arc::clone(&self.adapter), self.config.mount_base.clone())
    }
}
