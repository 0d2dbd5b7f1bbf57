//! Compute device discovery and selection
//!
//! Every platform (wgpu backend) is asked for every adapter it exposes, each
//! adapter is described by a [`DeviceInfo`], and the one with the most
//! compute units wins. Ties go to the device enumerated first.

use crate::{EngineError, EngineResult};
use pendulum_physics::Field;

/// Platforms in enumeration order
const PLATFORMS: [wgpu::Backends; 4] = [
    wgpu::Backends::VULKAN,
    wgpu::Backends::METAL,
    wgpu::Backends::DX12,
    wgpu::Backends::GL,
];

/// Storage buffers the kernel binds in its compute stage (one per field)
pub const KERNEL_STORAGE_BUFFERS: u32 = Field::ALL.len() as u32;

/// Static description of one adapter
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub platform: wgpu::Backend,
    pub name: String,
    /// PCI vendor id (0 when the driver does not report one)
    pub vendor: u32,
    pub device_type: wgpu::DeviceType,
    pub driver: String,
    /// Driver / API version string
    pub driver_info: String,
    /// Estimated compute-unit count.
    ///
    /// wgpu does not report the hardware count, so this ranks device class
    /// first (discrete > integrated > virtual > CPU > other) and the
    /// per-workgroup invocation limit second.
    pub compute_units: u32,
    pub max_workgroup_invocations: u32,
    /// Workgroup (local) memory in bytes
    pub workgroup_memory: u32,
    /// Largest single (global) buffer in bytes
    pub max_buffer_size: u64,
    pub storage_buffers_per_stage: u32,
    /// Downlevel GL adapters may lack compute shaders entirely
    pub compute_shaders: bool,
}

impl DeviceInfo {
    pub fn from_adapter(adapter: &wgpu::Adapter) -> Self {
        let info = adapter.get_info();
        let limits = adapter.limits();
        let downlevel = adapter.get_downlevel_capabilities();

        Self {
            platform: info.backend,
            compute_units: estimate_compute_units(
                info.device_type,
                limits.max_compute_invocations_per_workgroup,
            ),
            name: info.name,
            vendor: info.vendor,
            device_type: info.device_type,
            driver: info.driver,
            driver_info: info.driver_info,
            max_workgroup_invocations: limits.max_compute_invocations_per_workgroup,
            workgroup_memory: limits.max_compute_workgroup_storage_size,
            max_buffer_size: limits.max_buffer_size,
            storage_buffers_per_stage: limits.max_storage_buffers_per_shader_stage,
            compute_shaders: downlevel
                .flags
                .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS),
        }
    }

    /// Whether the kernel can run on this device at all
    pub fn meets_minimum(&self) -> bool {
        self.compute_shaders && self.storage_buffers_per_stage >= KERNEL_STORAGE_BUFFERS
    }

    pub fn vendor_name(&self) -> &'static str {
        match self.vendor {
            0x10DE => "NVIDIA",
            0x1002 | 0x1022 => "AMD",
            0x8086 => "Intel",
            0x106B => "Apple",
            0x13B5 => "ARM",
            0x5143 => "Qualcomm",
            0x1010 => "Imagination",
            0x10005 => "Mesa",
            0x1414 => "Microsoft",
            _ => "unknown vendor",
        }
    }
}

/// Rank device class above everything else, then workgroup capacity
pub fn estimate_compute_units(device_type: wgpu::DeviceType, max_invocations: u32) -> u32 {
    let class_rank = match device_type {
        wgpu::DeviceType::DiscreteGpu => 4,
        wgpu::DeviceType::IntegratedGpu => 3,
        wgpu::DeviceType::VirtualGpu => 2,
        wgpu::DeviceType::Cpu => 1,
        wgpu::DeviceType::Other => 0,
    };
    class_rank * 4096 + max_invocations.min(4095)
}

/// Index of the best usable candidate.
///
/// Highest `compute_units` wins; on a tie the earlier candidate is kept.
pub fn pick_best(candidates: &[DeviceInfo]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, candidate) in candidates.iter().enumerate() {
        if !candidate.meets_minimum() {
            continue;
        }
        match best {
            Some(b) if candidates[b].compute_units >= candidate.compute_units => {}
            _ => best = Some(i),
        }
    }
    best
}

/// The adapter chosen for the process lifetime
pub struct SelectedDevice {
    pub info: DeviceInfo,
    pub adapter: wgpu::Adapter,
}

/// Enumerate all platforms and devices and return the best one
pub fn select_best_device(instance: &wgpu::Instance) -> EngineResult<SelectedDevice> {
    let mut adapters = Vec::new();
    let mut infos = Vec::new();

    for platform in PLATFORMS {
        for adapter in instance.enumerate_adapters(platform) {
            let info = DeviceInfo::from_adapter(&adapter);
            log::debug!(
                "Found device: {} ({}, {:?} on {:?}), driver {} {}, compute units ~{}, \
                 workgroup memory {} B, max buffer {} B, {} storage buffers/stage",
                info.name,
                info.vendor_name(),
                info.device_type,
                info.platform,
                info.driver,
                info.driver_info,
                info.compute_units,
                info.workgroup_memory,
                info.max_buffer_size,
                info.storage_buffers_per_stage,
            );
            adapters.push(adapter);
            infos.push(info);
        }
    }

    let best = pick_best(&infos).ok_or(EngineError::NoDeviceAvailable)?;
    let adapter = adapters.swap_remove(best);
    let info = infos.swap_remove(best);

    log::info!(
        "✓ Using device: {} by {} ({:?})",
        info.name,
        info.vendor_name(),
        info.platform
    );

    Ok(SelectedDevice { info, adapter })
}
