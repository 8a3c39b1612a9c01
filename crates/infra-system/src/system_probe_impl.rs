// System probe implementation
// reason: sysinfo for cross-platform system monitoring
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use sysinfo::{Disks, System};
use tracing::debug;

use clipcast_core::port::system_probe::{SystemMetrics, SystemProbe};

/// System probe implementation using sysinfo
///
/// Disk figures are for the volume holding `artifact_root`.
pub struct SystemProbeImpl {
    system: Mutex<System>,
    artifact_root: PathBuf,
    cpu_count: usize,
}

impl SystemProbeImpl {
    pub fn new(artifact_root: impl Into<PathBuf>) -> Self {
        let system = System::new_all();
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or_else(|_| system.cpus().len().max(1));

        Self {
            system: Mutex::new(system),
            artifact_root: artifact_root.into(),
            cpu_count,
        }
    }
}

/// Space on the disk whose mount point is the longest prefix of `path`
fn disk_space_for(path: &Path) -> (u64, u64) {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| (disk.available_space(), disk.total_space()))
        .unwrap_or((0, 0))
}

#[async_trait]
impl SystemProbe for SystemProbeImpl {
    async fn get_metrics(&self) -> SystemMetrics {
        let (cpu_usage_percent, memory_used_mb, memory_total_mb) = {
            let mut sys = match self.system.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            sys.refresh_cpu();
            sys.refresh_memory();
            (
                sys.global_cpu_info().cpu_usage(),
                sys.used_memory() / 1024 / 1024,
                sys.total_memory() / 1024 / 1024,
            )
        };

        let (available, total) = disk_space_for(&self.artifact_root);
        let disk_available_mb = available / 1024 / 1024;
        let disk_total_mb = total / 1024 / 1024;

        debug!(
            cpu = %cpu_usage_percent,
            mem_used_mb = %memory_used_mb,
            disk_available_mb = %disk_available_mb,
            "System metrics collected"
        );

        SystemMetrics {
            cpu_count: self.cpu_count,
            cpu_usage_percent,
            memory_used_mb,
            memory_total_mb,
            disk_available_mb,
            disk_total_mb,
        }
    }

    fn cpu_count(&self) -> usize {
        self.cpu_count
    }
}
