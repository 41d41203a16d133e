//! Controller configuration

use std::time::Duration;

/// Default scheduler pods are handed to under gang scheduling
pub const DEFAULT_GANG_SCHEDULER: &str = "kube-batch";

/// Startup options for the reconciliation core
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Co-schedule each job's pods through a PodGroup
    pub enable_gang_scheduling: bool,

    /// Scheduler name written into created pods when gang scheduling is on
    pub gang_scheduler_name: String,

    /// Number of concurrent worker loops draining the work queue
    pub worker_threads: usize,

    /// Interval between full re-enqueues of every known job
    pub resync_period: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enable_gang_scheduling: false,
            gang_scheduler_name: DEFAULT_GANG_SCHEDULER.to_string(),
            worker_threads: 1,
            resync_period: Duration::from_secs(15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ControllerConfig::default();
        assert!(!config.enable_gang_scheduling);
        assert_eq!(config.gang_scheduler_name, "kube-batch");
        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.resync_period, Duration::from_secs(15));
    }
}
