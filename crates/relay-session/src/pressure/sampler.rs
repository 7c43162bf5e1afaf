//! Process resource sampling.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::SampleError;
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::registry::ConnectionRegistry;

/// One reading of the pressure indicators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    /// Registered connections.
    pub connections: usize,
    /// Resident memory of this process, in bytes.
    pub memory_bytes: u64,
}

/// Source of resource readings.
pub trait ResourceSampler: Send + Sync {
    /// Take a reading. Failure is a systemic error.
    fn sample(&self) -> Result<ResourceSample, SampleError>;
}

/// Samples this process's resident memory and the registry's connection count.
pub struct ProcessSampler {
    registry: Arc<ConnectionRegistry>,
    system: Mutex<System>,
    pid: Pid,
}

impl ProcessSampler {
    /// Sampler for the current process.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Result<Self, SampleError> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| SampleError::Unavailable(e.to_string()))?;
        Ok(Self {
            registry,
            system: Mutex::new(System::new()),
            pid,
        })
    }
}

impl ResourceSampler for ProcessSampler {
    fn sample(&self) -> Result<ResourceSample, SampleError> {
        let mut system = self.system.lock();
        let _ = system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), false);
        let memory_bytes = system
            .process(self.pid)
            .map(sysinfo::Process::memory)
            .ok_or_else(|| SampleError::Unavailable(format!("process {} not visible", self.pid)))?;
        Ok(ResourceSample {
            connections: self.registry.len(),
            memory_bytes,
        })
    }
}

impl fmt::Debug for ProcessSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSampler")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}
