//! Linux-specific process metrics using procfs.
//!
//! These fields are only available on Linux:
//! - Process CPU time (user + system, nanoseconds)
//! - Open and maximum file descriptor counts
//! - Live thread count

use procfs::process::{LimitValue, Process};

use crate::error::SampleError;
use crate::sampler::MetricValue;

/// Fields contributed by [`LinuxProcess`], in discovery order.
pub const FIELDS: &[&str] = &[
    "ProcessCpuTime",
    "OpenFileDescriptorCount",
    "MaxFileDescriptorCount",
];

/// Handle on `/proc/self`.
pub struct LinuxProcess {
    process: Option<Process>,
}

impl LinuxProcess {
    pub fn new() -> Self {
        let process = match Process::myself() {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::debug!(error = %e, "procfs unavailable, Linux process fields disabled");
                None
            }
        };
        Self { process }
    }

    /// Whether `/proc/self` could be opened.
    pub fn is_available(&self) -> bool {
        self.process.is_some()
    }

    fn process(&self) -> Result<&Process, SampleError> {
        self.process.as_ref().ok_or(SampleError::Unsupported)
    }

    /// Read one of [`FIELDS`]. Returns `None` for names this module does not own.
    pub fn read(&self, name: &str) -> Option<Result<MetricValue, SampleError>> {
        let result = match name {
            "ProcessCpuTime" => self.cpu_time_nanos().map(MetricValue::from),
            "OpenFileDescriptorCount" => self
                .process()
                .and_then(|p| p.fd_count().map_err(os_error))
                .map(|n| MetricValue::from(n as u64)),
            "MaxFileDescriptorCount" => self.max_fds(),
            _ => return None,
        };
        Some(result)
    }

    /// Live threads in this process (`num_threads` in `/proc/self/stat`).
    pub fn thread_count(&self) -> Result<u64, SampleError> {
        let stat = self.process()?.stat().map_err(os_error)?;
        u64::try_from(stat.num_threads)
            .map_err(|_| SampleError::Unavailable(format!("num_threads = {}", stat.num_threads)))
    }

    fn cpu_time_nanos(&self) -> Result<u64, SampleError> {
        let stat = self.process()?.stat().map_err(os_error)?;
        let ticks = stat.utime + stat.stime;
        let per_second = procfs::ticks_per_second();
        if per_second == 0 {
            return Err(SampleError::Unavailable("clock ticks per second is 0".into()));
        }
        Ok(ticks.saturating_mul(1_000_000_000) / per_second)
    }

    fn max_fds(&self) -> Result<MetricValue, SampleError> {
        let limits = self.process()?.limits().map_err(os_error)?;
        match limits.max_open_files.soft_limit {
            LimitValue::Value(v) => Ok(MetricValue::from(v)),
            LimitValue::Unlimited => Ok(MetricValue::Integer(i64::MAX)),
        }
    }
}

impl Default for LinuxProcess {
    fn default() -> Self {
        Self::new()
    }
}

fn os_error(e: procfs::ProcError) -> SampleError {
    SampleError::Os(e.to_string())
}
