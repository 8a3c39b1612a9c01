// System resource monitoring port
use async_trait::async_trait;

/// System resource metrics
#[derive(Debug, Clone)]
pub struct SystemMetrics {
    pub cpu_count: usize,
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    /// Free space on the volume holding the artifact root
    pub disk_available_mb: u64,
    pub disk_total_mb: u64,
}

/// System probe port for resource monitoring
///
/// Used to size the worker pool and to pause claiming when the artifact
/// volume runs low on space.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    /// Get current system metrics
    async fn get_metrics(&self) -> SystemMetrics;

    /// Number of logical CPU cores
    fn cpu_count(&self) -> usize;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Mock SystemProbe for testing
    pub struct MockSystemProbe {
        metrics: Arc<Mutex<SystemMetrics>>,
    }

    impl MockSystemProbe {
        pub fn new(cpu_count: usize) -> Self {
            Self {
                metrics: Arc::new(Mutex::new(SystemMetrics {
                    cpu_count,
                    cpu_usage_percent: 10.0,
                    memory_used_mb: 1024,
                    memory_total_mb: 2048,
                    disk_available_mb: 100 * 1024,
                    disk_total_mb: 500 * 1024,
                })),
            }
        }

        pub fn set_disk_available_mb(&self, mb: u64) {
            self.metrics.lock().unwrap().disk_available_mb = mb;
        }
    }

    #[async_trait]
    impl SystemProbe for MockSystemProbe {
        async fn get_metrics(&self) -> SystemMetrics {
            self.metrics.lock().unwrap().clone()
        }

        fn cpu_count(&self) -> usize {
            self.metrics.lock().unwrap().cpu_count
        }
    }
}
