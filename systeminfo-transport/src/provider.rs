//! Host metrics provider backed by the `sysinfo` crate.

use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::error::SampleError;
use crate::sampler::{MetricValue, MetricsProvider};

#[cfg(target_os = "linux")]
use crate::linux::{self, LinuxProcess};

type Reader = fn(&SysinfoProvider) -> Result<MetricValue, SampleError>;

struct FieldDef {
    name: &'static str,
    read: Reader,
    /// Part of the subset listed when the host is not supported by sysinfo.
    portable: bool,
    /// Needs the current process to be visible.
    per_process: bool,
}

const FIELDS: &[FieldDef] = &[
    FieldDef {
        name: "AvailableProcessors",
        read: SysinfoProvider::available_processors,
        portable: false,
        per_process: false,
    },
    FieldDef {
        name: "SystemLoadAverage",
        read: SysinfoProvider::system_load_average,
        portable: false,
        per_process: false,
    },
    FieldDef {
        name: "SystemCpuLoad",
        read: SysinfoProvider::system_cpu_load,
        portable: true,
        per_process: false,
    },
    FieldDef {
        name: "ProcessCpuLoad",
        read: SysinfoProvider::process_cpu_load,
        portable: false,
        per_process: true,
    },
    FieldDef {
        name: "TotalPhysicalMemorySize",
        read: |p| Ok(p.system.total_memory().into()),
        portable: true,
        per_process: false,
    },
    FieldDef {
        name: "FreePhysicalMemorySize",
        read: |p| Ok(p.system.free_memory().into()),
        portable: true,
        per_process: false,
    },
    FieldDef {
        name: "TotalSwapSpaceSize",
        read: |p| Ok(p.system.total_swap().into()),
        portable: true,
        per_process: false,
    },
    FieldDef {
        name: "FreeSwapSpaceSize",
        read: |p| Ok(p.system.free_swap().into()),
        portable: true,
        per_process: false,
    },
    FieldDef {
        name: "CommittedVirtualMemorySize",
        read: |p| p.own_process(|process| process.virtual_memory().into()),
        portable: false,
        per_process: true,
    },
];

/// Metrics provider for the local host.
///
/// Field availability is decided at runtime: when sysinfo does not support
/// the host only the portable subset (CPU load, memory, swap) is listed,
/// and per-process fields are dropped if the current process cannot be
/// found.
pub struct SysinfoProvider {
    system: System,
    pid: Option<Pid>,
    #[cfg(target_os = "linux")]
    linux: LinuxProcess,
}

impl SysinfoProvider {
    /// Create a provider and take the baseline CPU reading, so the first
    /// tick has a usage delta to report.
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::debug!(error = %e, "Current process id unavailable");
                None
            }
        };

        let mut provider = Self {
            system: System::new(),
            pid,
            #[cfg(target_os = "linux")]
            linux: LinuxProcess::new(),
        };
        provider.refresh();
        provider
    }

    fn own_process<F>(&self, f: F) -> Result<MetricValue, SampleError>
    where
        F: FnOnce(&sysinfo::Process) -> MetricValue,
    {
        let pid = self.pid.ok_or(SampleError::Unsupported)?;
        self.system
            .process(pid)
            .map(f)
            .ok_or_else(|| SampleError::Unavailable(format!("process {} not found", pid)))
    }

    fn cpu_count(&self) -> Result<usize, SampleError> {
        match self.system.cpus().len() {
            0 => Err(SampleError::Unavailable("no CPUs reported".into())),
            n => Ok(n),
        }
    }

    fn available_processors(&self) -> Result<MetricValue, SampleError> {
        self.cpu_count().map(|n| MetricValue::from(n as u64))
    }

    #[cfg(not(windows))]
    fn system_load_average(&self) -> Result<MetricValue, SampleError> {
        Ok(MetricValue::Float(System::load_average().one))
    }

    #[cfg(windows)]
    fn system_load_average(&self) -> Result<MetricValue, SampleError> {
        Err(SampleError::Unsupported)
    }

    /// Whole-system CPU usage as a fraction in [0, 1].
    fn system_cpu_load(&self) -> Result<MetricValue, SampleError> {
        self.cpu_count()?;
        Ok(MetricValue::Float(
            f64::from(self.system.global_cpu_usage()) / 100.0,
        ))
    }

    /// Process CPU usage as a fraction of all CPUs, in [0, 1].
    fn process_cpu_load(&self) -> Result<MetricValue, SampleError> {
        let cpus = self.cpu_count()? as f64;
        self.own_process(|process| MetricValue::Float(f64::from(process.cpu_usage()) / 100.0 / cpus))
    }

    fn lookup(name: &str) -> Option<&'static FieldDef> {
        FIELDS.iter().find(|f| f.name == name)
    }
}

impl Default for SysinfoProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsProvider for SysinfoProvider {
    fn refresh(&mut self) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        if let Some(pid) = self.pid {
            self.system
                .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        }
    }

    fn available_fields(&mut self) -> Vec<String> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return FIELDS
                .iter()
                .filter(|f| f.portable)
                .map(|f| f.name.to_string())
                .collect();
        }

        #[cfg(windows)]
        let skip_load_average = true;
        #[cfg(not(windows))]
        let skip_load_average = false;

        let has_process = self.pid.is_some();

        #[allow(unused_mut)]
        let mut fields: Vec<String> = FIELDS
            .iter()
            .filter(|f| has_process || !f.per_process)
            .filter(|f| !(skip_load_average && f.name == "SystemLoadAverage"))
            .map(|f| f.name.to_string())
            .collect();

        #[cfg(target_os = "linux")]
        if self.linux.is_available() {
            fields.extend(linux::FIELDS.iter().map(|f| f.to_string()));
        }

        fields
    }

    fn read_field(&mut self, name: &str) -> Result<MetricValue, SampleError> {
        if let Some(field) = Self::lookup(name) {
            return (field.read)(self);
        }

        #[cfg(target_os = "linux")]
        if let Some(result) = self.linux.read(name) {
            return result;
        }

        Err(SampleError::Unsupported)
    }

    #[cfg(target_os = "linux")]
    fn thread_count(&mut self) -> Result<u64, SampleError> {
        self.linux.thread_count()
    }

    #[cfg(not(target_os = "linux"))]
    fn thread_count(&mut self) -> Result<u64, SampleError> {
        let pid = self.pid.ok_or(SampleError::Unsupported)?;
        let process = self
            .system
            .process(pid)
            .ok_or_else(|| SampleError::Unavailable(format!("process {} not found", pid)))?;
        process
            .tasks()
            .map(|tasks| tasks.len() as u64)
            .ok_or(SampleError::Unsupported)
    }
}
