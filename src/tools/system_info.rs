use serde::Serialize;
use sysinfo::System;

use super::{ToolDescriptor, ToolOutput};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Serialize)]
pub struct SystemReport {
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub hostname: Option<String>,
    pub architecture: &'static str,
    pub cpu_count: usize,
    pub memory_total_gb: f64,
    pub memory_available_gb: f64,
    /// Unix seconds.
    pub boot_time: u64,
}

fn gigabytes(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_GB * 100.0).round() / 100.0
}

pub fn collect_system_report() -> SystemReport {
    let system = System::new_all();
    SystemReport {
        os: System::name(),
        os_version: System::os_version(),
        kernel_version: System::kernel_version(),
        hostname: System::host_name(),
        architecture: std::env::consts::ARCH,
        cpu_count: system.cpus().len(),
        memory_total_gb: gigabytes(system.total_memory()),
        memory_available_gb: gigabytes(system.available_memory()),
        boot_time: System::boot_time(),
    }
}

pub fn system_info_tool() -> ToolDescriptor {
    ToolDescriptor::from_fn(
        "system_info",
        "Gathers operating system, CPU, memory, hostname and boot time information for this machine.",
        |_params, _state| async {
            let report = match tokio::task::spawn_blocking(collect_system_report).await {
                Ok(report) => report,
                Err(err) => return ToolOutput::error(format!("system probe failed: {err}")),
            };
            match serde_json::to_value(report) {
                Ok(value) => ToolOutput::ok(value),
                Err(err) => ToolOutput::error(format!("failed to encode system report: {err}")),
            }
        },
    )
}
