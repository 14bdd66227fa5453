//! Host environment probing.
//!
//! Error records and vitals reports carry a little context about where they
//! were produced. Every field is read independently; a field that cannot be
//! read is left out rather than failing the capture.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tracing::debug;

use crate::{Error, Result};

/// Visible area of the host surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Memory usage hint at capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryHint {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

/// Device description attached to vitals reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryHint>,
    pub platform: String,
}

/// Read access to the host environment.
pub trait EnvironmentProbe: Send + Sync {
    fn url(&self) -> Result<String>;
    fn user_agent(&self) -> Result<String>;
    fn viewport(&self) -> Result<Viewport>;
    fn memory(&self) -> Result<MemoryHint>;

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            user_agent: read_field("user_agent", || self.user_agent()),
            viewport: read_field("viewport", || self.viewport()),
            memory: read_field("memory", || self.memory()),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }
}

/// Run a probe read, turning failures into an omitted field.
pub(crate) fn read_field<T>(field: &'static str, read: impl FnOnce() -> Result<T>) -> Option<T> {
    match read() {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(field, error = %e, "Environment field unavailable; omitting");
            None
        }
    }
}

/// Environment with fixed values; unset fields report as unavailable.
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironment {
    pub url: Option<String>,
    pub user_agent: Option<String>,
    pub viewport: Option<Viewport>,
    pub memory: Option<MemoryHint>,
}

fn unavailable<T>(field: &str) -> Result<T> {
    Err(Error::unsupported(format!("{field} is not available")))
}

impl EnvironmentProbe for StaticEnvironment {
    fn url(&self) -> Result<String> {
        self.url.clone().map_or_else(|| unavailable("url"), Ok)
    }

    fn user_agent(&self) -> Result<String> {
        self.user_agent
            .clone()
            .map_or_else(|| unavailable("user agent"), Ok)
    }

    fn viewport(&self) -> Result<Viewport> {
        self.viewport.map_or_else(|| unavailable("viewport"), Ok)
    }

    fn memory(&self) -> Result<MemoryHint> {
        self.memory.map_or_else(|| unavailable("memory"), Ok)
    }
}

/// Environment of the running process.
///
/// The user agent is derived from the crate and target, memory is this
/// process's resident set against total system memory, and there is no
/// viewport.
pub struct ProcessEnvironment {
    url: Option<String>,
    system: Mutex<System>,
}

impl ProcessEnvironment {
    pub fn new(url: Option<String>) -> Self {
        Self {
            url,
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
            )),
        }
    }
}

impl Default for ProcessEnvironment {
    fn default() -> Self {
        Self::new(None)
    }
}

impl EnvironmentProbe for ProcessEnvironment {
    fn url(&self) -> Result<String> {
        self.url.clone().map_or_else(|| unavailable("url"), Ok)
    }

    fn user_agent(&self) -> Result<String> {
        Ok(format!(
            "{}/{} ({}; {})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH
        ))
    }

    fn viewport(&self) -> Result<Viewport> {
        unavailable("viewport")
    }

    fn memory(&self) -> Result<MemoryHint> {
        let pid = Pid::from_u32(std::process::id());
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::nothing().with_memory(),
        );
        let total_bytes = system.total_memory();
        let Some(process) = system.process(pid) else {
            return unavailable("memory");
        };
        if total_bytes == 0 {
            return unavailable("memory");
        }
        Ok(MemoryHint {
            used_bytes: process.memory(),
            total_bytes,
        })
    }
}
