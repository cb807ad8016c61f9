use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use sysinfo::{Disks, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::SamplingError;
use crate::types::{Capabilities, SystemLoad};

/// Host usage percentages (0.0-100.0).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemSnapshot {
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub disk_usage: f32,
}

#[async_trait]
pub trait LoadSampler: Send + Sync {
    async fn sample(&self) -> Result<SystemSnapshot, SamplingError>;
}

/// Samples the local host through sysinfo.
pub struct SystemSampler {
    system: AsyncMutex<System>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();

        Self {
            system: AsyncMutex::new(system),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadSampler for SystemSampler {
    async fn sample(&self) -> Result<SystemSnapshot, SamplingError> {
        let mut system = self.system.lock().await;

        // CPU usage is a delta between two refreshes.
        system.refresh_cpu_usage();
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
        system.refresh_cpu_usage();
        system.refresh_memory();

        if system.cpus().is_empty() {
            return Err(SamplingError::NoCpus);
        }

        let total_memory = system.total_memory();
        if total_memory == 0 {
            return Err(SamplingError::NoMemory);
        }

        Ok(SystemSnapshot {
            cpu_usage: system.global_cpu_usage(),
            memory_usage: (system.used_memory() as f64 / total_memory as f64 * 100.0) as f32,
            disk_usage: disk_usage_percent(),
        })
    }
}

/// Used space across all mounted disks.
fn disk_usage_percent() -> f32 {
    let disks = Disks::new_with_refreshed_list();
    let (total, available) = disks.list().iter().fold((0u64, 0u64), |(t, a), d| {
        (t + d.total_space(), a + d.available_space())
    });

    if total == 0 {
        return 0.0;
    }
    (total.saturating_sub(available) as f64 / total as f64 * 100.0) as f32
}

/// Advertised at registration.
pub fn local_capabilities(network_mbps: u32, max_connections: u32) -> Capabilities {
    let mut system = System::new();
    system.refresh_memory();

    Capabilities {
        cpu_cores: num_cpus::get() as u32,
        memory_mb: system.total_memory() / 1024 / 1024,
        network_mbps,
        max_connections,
    }
}

/// In-flight and completed request counts for the local proxy.
#[derive(Debug, Clone, Default)]
pub struct RequestCounters {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicU64,
    total: AtomicU64,
}

impl RequestCounters {
    /// Count a request as active until the guard drops.
    pub fn track(&self) -> RequestGuard {
        self.inner.active.fetch_add(1, Ordering::Relaxed);
        self.inner.total.fetch_add(1, Ordering::Relaxed);
        RequestGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn active(&self) -> u64 {
        self.inner.active.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    /// A load view with its own request-rate window, starting now.
    pub fn meter(&self) -> LoadMeter {
        LoadMeter {
            counters: self.clone(),
            window: Mutex::new(RateWindow {
                since: Instant::now(),
                total_at: self.total(),
                last_rate: 0.0,
            }),
        }
    }
}

/// Request counters as seen by one reporter. Each meter measures the rate
/// between its own calls, so reporters on different intervals don't shorten
/// each other's window.
#[derive(Debug)]
pub struct LoadMeter {
    counters: RequestCounters,
    window: Mutex<RateWindow>,
}

#[derive(Debug)]
struct RateWindow {
    since: Instant,
    total_at: u64,
    last_rate: f64,
}

impl LoadMeter {
    /// Requests per second since this meter's previous call. Calls less than
    /// a second apart reuse the last figure.
    pub fn requests_per_second(&self) -> f64 {
        let total = self.counters.total();
        let Ok(mut window) = self.window.lock() else {
            return 0.0;
        };

        let elapsed = window.since.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            window.last_rate = total.saturating_sub(window.total_at) as f64 / elapsed;
            window.total_at = total;
            window.since = Instant::now();
        }
        window.last_rate
    }

    pub fn load(&self, snapshot: &SystemSnapshot) -> SystemLoad {
        SystemLoad {
            cpu_usage: snapshot.cpu_usage,
            memory_usage: snapshot.memory_usage,
            active_connections: self.counters.active(),
            requests_per_second: self.requests_per_second(),
        }
    }
}

pub struct RequestGuard {
    inner: Arc<Counters>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::Relaxed);
    }
}
