use std::sync::Arc;

use crate::core::hardware::DriveAdapter;

#[cfg(target_os = "linux")]
mod linux;
mod simulated;

#[cfg(target_os = "linux")]
pub use linux::LinuxAdapter;
pub use simulated::{SIMULATED_PASSPHRASE, SimDisk, SimPartition, SimulatedAdapter};

pub fn get_adapter(simulation: bool) -> Arc<dyn DriveAdapter> {
    if simulation {
        return Arc::new(SimulatedAdapter::new());
    }

    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxAdapter::new())
    }

    #[cfg(not(target_os = "linux"))]
    {
        tracing::warn!("No hardware adapter for this platform, using simulation");
        Arc::new(SimulatedAdapter::new())
    }
}
