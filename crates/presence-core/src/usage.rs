//! Process resource usage snapshots.
//!
//! Served by both the broker's `stats` control command and a worker's `stats`
//! probe. Memory and CPU percentage come from `sysinfo`; user/system CPU time
//! from `getrusage` on Unix.

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Memory usage in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub resident: u64,
    #[serde(rename = "virtual")]
    pub virtual_size: u64,
}

/// CPU usage: cumulative seconds plus the current percentage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub user: f64,
    pub system: f64,
    pub percent: f32,
}

/// Resource usage of one process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub memory: MemoryUsage,
    pub cpu: CpuUsage,
}

/// Source of usage snapshots.
pub trait UsageProvider: Send + Sync {
    fn snapshot(&mut self) -> UsageSnapshot;
}

/// Usage of the current process.
pub struct ProcessUsage {
    system: System,
    pid: Pid,
}

impl ProcessUsage {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }
}

impl Default for ProcessUsage {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageProvider for ProcessUsage {
    fn snapshot(&mut self) -> UsageSnapshot {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );

        let (resident, virtual_size, percent) = match self.system.process(self.pid) {
            Some(process) => (
                process.memory(),
                process.virtual_memory(),
                process.cpu_usage(),
            ),
            None => (0, 0, 0.0),
        };
        let (user, system) = cpu_times();

        UsageSnapshot {
            memory: MemoryUsage {
                resident,
                virtual_size,
            },
            cpu: CpuUsage {
                user,
                system,
                percent,
            },
        }
    }
}

/// Cumulative (user, system) CPU seconds of this process.
#[cfg(unix)]
fn cpu_times() -> (f64, f64) {
    use nix::sys::resource::{getrusage, UsageWho};

    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let (user, system) = (usage.user_time(), usage.system_time());
            (
                user.tv_sec() as f64 + user.tv_usec() as f64 / 1_000_000.0,
                system.tv_sec() as f64 + system.tv_usec() as f64 / 1_000_000.0,
            )
        }
        Err(e) => {
            tracing::debug!("getrusage failed: {}", e);
            (0.0, 0.0)
        }
    }
}

#[cfg(not(unix))]
fn cpu_times() -> (f64, f64) {
    (0.0, 0.0)
}

/// Fixed snapshot, for tests and embedders without process accounting.
#[derive(Debug, Clone, Default)]
pub struct StaticUsage(pub UsageSnapshot);

impl UsageProvider for StaticUsage {
    fn snapshot(&mut self) -> UsageSnapshot {
        self.0.clone()
    }
}
