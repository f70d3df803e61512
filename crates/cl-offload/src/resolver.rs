//! Platform and device discovery by fixed index.

use crate::driver::{ComputeDriver, DeviceType};
use crate::error::{OffloadError, Result};
use crate::observe::{EventSink, LifecycleEvent};

/// Which platform/device pair to pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSelection {
    pub platform_index: usize,
    pub device_type: DeviceType,
    pub device_index: usize,
}

impl Default for DeviceSelection {
    fn default() -> Self {
        Self { platform_index: 0, device_type: DeviceType::ALL, device_index: 0 }
    }
}

/// A selected platform/device pair.
pub struct ResolvedDevice<D: ComputeDriver> {
    pub platform: D::Platform,
    pub device: D::Device,
    pub selection: DeviceSelection,
}

// Manual impls: derives would demand `D: Copy`/`D: Debug` of the driver.
impl<D: ComputeDriver> Clone for ResolvedDevice<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: ComputeDriver> Copy for ResolvedDevice<D> {}

impl<D: ComputeDriver> std::fmt::Debug for ResolvedDevice<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedDevice")
            .field("platform", &self.platform)
            .field("device", &self.device)
            .field("selection", &self.selection)
            .finish()
    }
}

/// Enumerate platforms and devices and pick the pair named by `selection`.
///
/// Counts are queried before the lists, the same two-call pattern the
/// native API uses. Enumeration failures surface as `NoPlatform` /
/// `NoDevice` with the driver status attached.
pub fn resolve<D: ComputeDriver>(
    driver: &D,
    selection: DeviceSelection,
    sink: &impl EventSink,
) -> Result<ResolvedDevice<D>> {
    let DeviceSelection { platform_index, device_type, device_index } = selection;

    let no_platform = |available, status| OffloadError::NoPlatform {
        requested: platform_index,
        available,
        status,
    };

    let platform_count = driver.platform_count().map_err(|e| no_platform(0, Some(e.status)))?;
    sink.record(LifecycleEvent::PlatformsEnumerated { count: platform_count });
    if platform_count == 0 || platform_index >= platform_count {
        return Err(no_platform(platform_count, None));
    }

    let platforms =
        driver.platforms().map_err(|e| no_platform(platform_count, Some(e.status)))?;
    let platform =
        *platforms.get(platform_index).ok_or_else(|| no_platform(platforms.len(), None))?;
    sink.record(LifecycleEvent::PlatformSelected {
        index: platform_index,
        name: driver.platform_name(platform),
    });

    let no_device = |available, status| OffloadError::NoDevice {
        platform_index,
        device_type: device_type.to_string(),
        requested: device_index,
        available,
        status,
    };

    let device_count =
        driver.device_count(platform, device_type).map_err(|e| no_device(0, Some(e.status)))?;
    sink.record(LifecycleEvent::DevicesEnumerated {
        count: device_count,
        device_type: device_type.to_string(),
    });
    if device_count == 0 || device_index >= device_count {
        return Err(no_device(device_count, None));
    }

    let devices = driver
        .devices(platform, device_type)
        .map_err(|e| no_device(device_count, Some(e.status)))?;
    let device = *devices.get(device_index).ok_or_else(|| no_device(devices.len(), None))?;
    sink.record(LifecycleEvent::DeviceSelected {
        index: device_index,
        name: driver.device_name(device),
    });

    Ok(ResolvedDevice { platform, device, selection })
}
