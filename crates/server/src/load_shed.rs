//! Memory-based load shedding.
//!
//! New requests are rejected with 503 once the process RSS crosses the
//! configured threshold. In-flight requests are unaffected; the check runs
//! only on admission.

use std::sync::Mutex;

use lynkr_config::LoadSheddingConfig;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Admission gate over process memory.
pub struct LoadShedder {
    config: LoadSheddingConfig,
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl LoadShedder {
    /// Build from configuration.
    pub fn new(config: LoadSheddingConfig) -> Self {
        Self {
            config,
            pid: sysinfo::get_current_pid().ok(),
            system: Mutex::new(System::new()),
        }
    }

    /// Whether a new request should be rejected right now.
    pub fn should_shed(&self) -> bool {
        if !self.config.enabled {
            return false;
        }

        let Some(pid) = self.pid else {
            return false;
        };

        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );

        let Some(process) = system.process(pid) else {
            return false;
        };

        let rss_mb = process.memory() / (1024 * 1024);
        let shed = rss_mb > self.config.max_rss_mb;

        if shed {
            log::warn!(
                "shedding load: rss {rss_mb} MiB over threshold {} MiB",
                self.config.max_rss_mb
            );
        }

        shed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_shedder_admits_everything() {
        let shedder = LoadShedder::new(LoadSheddingConfig {
            enabled: false,
            max_rss_mb: 0,
        });

        assert!(!shedder.should_shed());
    }

    #[test]
    fn generous_threshold_admits() {
        let shedder = LoadShedder::new(LoadSheddingConfig {
            enabled: true,
            max_rss_mb: 1 << 20,
        });

        assert!(!shedder.should_shed());
    }

    #[test]
    fn tiny_threshold_sheds() {
        let shedder = LoadShedder::new(LoadSheddingConfig {
            enabled: true,
            max_rss_mb: 0,
        });

        assert!(shedder.should_shed());
    }
}
