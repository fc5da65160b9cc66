//! Resource probing and per-job resource estimation.
//!
//! One [`SystemResources`] snapshot is taken at the start of each scheduling
//! cycle, debited locally as jobs are admitted, and discarded at cycle end.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use tracing::warn;

use crate::database::models::{Job, VideoQuality};

/// Current host resource availability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemResources {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub available_memory_mb: u64,
    pub disk_percent: f32,
    pub available_disk_mb: u64,
    pub gpu_available: bool,
    pub gpu_memory_available_mb: u64,
}

impl SystemResources {
    /// Conservative fallback used when the host cannot be probed.
    pub fn conservative_default() -> Self {
        Self {
            cpu_percent: 50.0,
            memory_percent: 50.0,
            available_memory_mb: 4096,
            disk_percent: 50.0,
            available_disk_mb: 10240,
            gpu_available: false,
            gpu_memory_available_mb: 0,
        }
    }
}

/// Estimated resource needs of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_space_mb: u64,
    pub gpu_required: bool,
    pub gpu_memory_mb: u64,
}

impl ResourceRequirements {
    /// Heuristic estimate scaled by video count and requested quality.
    ///
    /// 2160p doubles the memory/disk/GPU-memory estimates versus baseline;
    /// 1080p multiplies them by 1.5.
    pub fn estimate_for(job: &Job, gpu_enabled: bool) -> Self {
        let videos = job.video_urls.len().max(1) as u64;

        let cpu_cores = videos.min(4) as u32;
        let mut memory_mb = 2048 + videos * 512;
        let mut disk_space_mb = videos * 5120;
        let gpu_required = job.use_gpu && gpu_enabled;
        let mut gpu_memory_mb: u64 = if gpu_required { 2048 } else { 0 };

        match job.video_quality {
            VideoQuality::P2160 => {
                memory_mb *= 2;
                disk_space_mb *= 2;
                gpu_memory_mb *= 2;
            }
            VideoQuality::P1080 => {
                memory_mb = memory_mb * 3 / 2;
                disk_space_mb = disk_space_mb * 3 / 2;
                gpu_memory_mb = gpu_memory_mb * 3 / 2;
            }
            _ => {}
        }

        Self {
            cpu_cores,
            memory_mb,
            disk_space_mb,
            gpu_required,
            gpu_memory_mb,
        }
    }
}

/// Read-only view of host resource availability.
pub trait ResourceProbe: Send + Sync {
    fn snapshot(&self) -> SystemResources;
}

/// GPU capacity as declared by the host configuration.
///
/// There is no portable GPU telemetry source, so availability and budget
/// are configuration inputs debited like any probed resource.
#[derive(Debug, Clone, Copy)]
pub struct GpuSettings {
    pub enabled: bool,
    pub memory_mb: u64,
}

/// sysinfo-backed probe for CPU, memory, and the disk holding the temp dir.
pub struct SysinfoProbe {
    inner: Mutex<ProbeInner>,
    temp_dir: PathBuf,
    gpu: GpuSettings,
}

struct ProbeInner {
    system: System,
    disks: Disks,
}

impl SysinfoProbe {
    pub fn new(temp_dir: PathBuf, gpu: GpuSettings) -> Self {
        Self {
            inner: Mutex::new(ProbeInner {
                system: System::new_with_specifics(
                    RefreshKind::nothing()
                        .with_cpu(CpuRefreshKind::everything())
                        .with_memory(MemoryRefreshKind::everything()),
                ),
                disks: Disks::new_with_refreshed_list(),
            }),
            temp_dir,
            gpu,
        }
    }
}

impl ResourceProbe for SysinfoProbe {
    fn snapshot(&self) -> SystemResources {
        let mut inner = self.inner.lock();
        inner.system.refresh_cpu_all();
        inner.system.refresh_memory();
        inner.disks.refresh(true);

        let cpu_percent = inner.system.global_cpu_usage();

        let total_mem = inner.system.total_memory();
        let available_mem = inner.system.available_memory();
        if total_mem == 0 {
            warn!("Memory probe returned no data, using conservative defaults");
            return SystemResources {
                gpu_available: self.gpu.enabled,
                gpu_memory_available_mb: if self.gpu.enabled { self.gpu.memory_mb } else { 0 },
                ..SystemResources::conservative_default()
            };
        }
        let used_mem = total_mem.saturating_sub(available_mem);
        let memory_percent = (used_mem as f64 / total_mem as f64 * 100.0) as f32;
        let available_memory_mb = available_mem / (1024 * 1024);

        let (disk_percent, available_disk_mb) =
            match disk_for_path(&inner.disks, &self.temp_dir) {
                Some((total, available)) if total > 0 => {
                    let used = total.saturating_sub(available);
                    (
                        (used as f64 / total as f64 * 100.0) as f32,
                        available / (1024 * 1024),
                    )
                }
                _ => {
                    warn!(path = %self.temp_dir.display(), "No disk found for temp dir");
                    let fallback = SystemResources::conservative_default();
                    (fallback.disk_percent, fallback.available_disk_mb)
                }
            };

        SystemResources {
            cpu_percent,
            memory_percent,
            available_memory_mb,
            disk_percent,
            available_disk_mb,
            gpu_available: self.gpu.enabled,
            gpu_memory_available_mb: if self.gpu.enabled { self.gpu.memory_mb } else { 0 },
        }
    }
}

/// (total, available) bytes of the disk with the longest mount-point match.
fn disk_for_path(disks: &Disks, path: &Path) -> Option<(u64, u64)> {
    let path_str = path.to_string_lossy();
    let mut best_match: Option<(&sysinfo::Disk, usize)> = None;

    for disk in disks.list() {
        let mount_point = disk.mount_point().to_string_lossy();
        if path_str.starts_with(mount_point.as_ref()) {
            let mount_len = mount_point.len();
            if best_match.is_none_or(|(_, len)| mount_len > len) {
                best_match = Some((disk, mount_len));
            }
        }
    }

    best_match.map(|(disk, _)| (disk.total_space(), disk.available_space()))
}
