//! Host Load Probes
//!
//! The collector only sweeps while host CPU usage is below its cutoff.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use sysinfo::System;

use crate::error::Result;

/// Source of the current host CPU usage, as a percentage.
#[async_trait]
pub trait LoadProbe: Send + Sync {
    async fn cpu_usage(&self) -> Result<f32>;
}

// == System Load Probe ==
/// Samples global CPU usage of the host.
///
/// Usage is measured over `sysinfo::MINIMUM_CPU_UPDATE_INTERVAL`, so each
/// probe suspends for at least that long.
#[derive(Debug)]
pub struct SystemLoadProbe {
    system: Mutex<System>,
}

impl SystemLoadProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn refresh(&self) -> f32 {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu();
        system.global_cpu_info().cpu_usage()
    }
}

impl Default for SystemLoadProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadProbe for SystemLoadProbe {
    async fn cpu_usage(&self) -> Result<f32> {
        self.refresh();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        Ok(self.refresh())
    }
}

// == Fixed Load ==
/// Reports a constant usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedLoad(pub f32);

#[async_trait]
impl LoadProbe for FixedLoad {
    async fn cpu_usage(&self) -> Result<f32> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_load() {
        assert_eq!(FixedLoad(42.5).cpu_usage().await.unwrap(), 42.5);
    }

    #[tokio::test]
    async fn test_system_probe_reports_percentage() {
        let usage = SystemLoadProbe::new().cpu_usage().await.unwrap();
        assert!((0.0..=100.0).contains(&usage), "usage out of range: {}", usage);
    }
}
