//! The boundary to the accelerator driver.
//!
//! [`ComputeDriver`] is the capability set the host layer needs from an
//! OpenCL-style runtime. Handles are associated types so a backend can use
//! its native wrappers directly; every creation call has a matching
//! `release_*` that takes the handle by value.
//!
//! Two backends ship with the crate: [`crate::host::HostDriver`], a CPU
//! reference used when no OpenCL runtime is present, and
//! `crate::opencl::OpenClDriver` behind the `opencl` feature.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DriverResult;

// ---------------------------------------------------------------------------
// Device type mask
// ---------------------------------------------------------------------------

/// Device type bitmask used when enumerating devices on a platform.
///
/// Values match the OpenCL `CL_DEVICE_TYPE_*` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceType(u64);

impl DeviceType {
    pub const DEFAULT: Self = Self(1 << 0);
    pub const CPU: Self = Self(1 << 1);
    pub const GPU: Self = Self(1 << 2);
    pub const ACCELERATOR: Self = Self(1 << 3);
    pub const CUSTOM: Self = Self(1 << 4);
    pub const ALL: Self = Self(0xFFFF_FFFF);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Whether a device of type `device` is selected by this mask.
    pub const fn matches(self, device: DeviceType) -> bool {
        self.0 & device.0 != 0
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ALL => write!(f, "all"),
            Self::DEFAULT => write!(f, "default"),
            Self::CPU => write!(f, "cpu"),
            Self::GPU => write!(f, "gpu"),
            Self::ACCELERATOR => write!(f, "accelerator"),
            Self::CUSTOM => write!(f, "custom"),
            Self(bits) => write!(f, "{bits:#x}"),
        }
    }
}

/// Serializable device-type choice for configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTypeSetting {
    #[default]
    All,
    Default,
    Cpu,
    Gpu,
    Accelerator,
}

impl DeviceTypeSetting {
    pub fn mask(self) -> DeviceType {
        match self {
            Self::All => DeviceType::ALL,
            Self::Default => DeviceType::DEFAULT,
            Self::Cpu => DeviceType::CPU,
            Self::Gpu => DeviceType::GPU,
            Self::Accelerator => DeviceType::ACCELERATOR,
        }
    }
}

impl fmt::Display for DeviceTypeSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.mask().fmt(f)
    }
}

impl std::str::FromStr for DeviceTypeSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "default" => Ok(Self::Default),
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            "accelerator" => Ok(Self::Accelerator),
            other => Err(format!("unknown device type: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Creation parameters
// ---------------------------------------------------------------------------

/// Context-properties descriptor: the platform the context belongs to.
#[derive(Debug, Clone, Copy)]
pub struct ContextProperties<P> {
    pub platform: P,
}

/// Command-queue properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueProperties {
    pub profiling: bool,
}

/// Memory flags for buffer creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemFlags {
    /// Allocate and copy the supplied host data into the new buffer.
    CopyHostPtr,
}

/// One positional kernel argument.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a, B> {
    /// A 4-byte signed scalar passed by value.
    Int(i32),
    /// A device buffer handle.
    Mem(&'a B),
}

impl<B> KernelArg<'_, B> {
    /// Size in bytes the driver is told for this argument.
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::Int(_) => std::mem::size_of::<i32>(),
            Self::Mem(_) => std::mem::size_of::<usize>(),
        }
    }
}

// ---------------------------------------------------------------------------
// ComputeDriver
// ---------------------------------------------------------------------------

/// Low-level compute API used by the host layer.
///
/// Implementations report failures as [`crate::error::DriverError`]
/// carrying the native status code; the host layer maps them onto its own
/// taxonomy and never retries.
pub trait ComputeDriver {
    type Platform: Copy + fmt::Debug;
    type Device: Copy + fmt::Debug;
    type Context;
    type Queue;
    type Program;
    type Kernel;
    type Buffer;

    fn platform_count(&self) -> DriverResult<usize>;
    fn platforms(&self) -> DriverResult<Vec<Self::Platform>>;

    fn device_count(&self, platform: Self::Platform, mask: DeviceType) -> DriverResult<usize>;
    fn devices(&self, platform: Self::Platform, mask: DeviceType)
    -> DriverResult<Vec<Self::Device>>;

    /// Human-readable platform name, for logging only.
    fn platform_name(&self, platform: Self::Platform) -> String {
        format!("{platform:?}")
    }

    /// Human-readable device name, for logging only.
    fn device_name(&self, device: Self::Device) -> String {
        format!("{device:?}")
    }

    fn create_context(
        &self,
        properties: &ContextProperties<Self::Platform>,
        devices: &[Self::Device],
    ) -> DriverResult<Self::Context>;

    fn create_queue(
        &self,
        context: &Self::Context,
        device: Self::Device,
        properties: QueueProperties,
    ) -> DriverResult<Self::Queue>;

    fn create_program_with_source(
        &self,
        context: &Self::Context,
        source: &str,
    ) -> DriverResult<Self::Program>;

    /// Build `program` for `devices`. On failure the build log is fetched
    /// separately with [`ComputeDriver::program_build_log`].
    fn build_program(
        &self,
        program: &Self::Program,
        devices: &[Self::Device],
        options: &str,
    ) -> DriverResult<()>;

    fn program_build_log(
        &self,
        program: &Self::Program,
        device: Self::Device,
    ) -> DriverResult<String>;

    fn create_kernel(&self, program: &Self::Program, name: &str) -> DriverResult<Self::Kernel>;

    /// Allocate `size_bytes` of device memory. With [`MemFlags::CopyHostPtr`]
    /// the first `size_bytes` of `host_data` are copied in.
    fn create_buffer(
        &self,
        context: &Self::Context,
        flags: MemFlags,
        size_bytes: usize,
        host_data: &[f32],
    ) -> DriverResult<Self::Buffer>;

    fn set_kernel_arg(
        &self,
        kernel: &Self::Kernel,
        index: u32,
        arg: KernelArg<'_, Self::Buffer>,
    ) -> DriverResult<()>;

    /// Enqueue an N-dimensional range. `global_work_size.len()` is the
    /// dimension count; the local size is left to the driver.
    fn enqueue_nd_range(
        &self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        global_work_size: &[usize],
    ) -> DriverResult<()>;

    fn enqueue_read_buffer(
        &self,
        queue: &Self::Queue,
        buffer: &Self::Buffer,
        blocking: bool,
        offset: usize,
        dest: &mut [f32],
    ) -> DriverResult<()>;

    /// Block until every command in `queue` has completed.
    fn finish(&self, queue: &Self::Queue) -> DriverResult<()>;

    fn release_kernel(&self, kernel: Self::Kernel) -> DriverResult<()>;
    fn release_program(&self, program: Self::Program) -> DriverResult<()>;
    fn release_queue(&self, queue: Self::Queue) -> DriverResult<()>;
    fn release_context(&self, context: Self::Context) -> DriverResult<()>;
    fn release_buffer(&self, buffer: Self::Buffer) -> DriverResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_mask_matches_every_type() {
        for t in [
            DeviceType::DEFAULT,
            DeviceType::CPU,
            DeviceType::GPU,
            DeviceType::ACCELERATOR,
            DeviceType::CUSTOM,
        ] {
            assert!(DeviceType::ALL.matches(t));
        }
        assert!(!DeviceType::GPU.matches(DeviceType::CPU));
        assert!(!DeviceType::ACCELERATOR.matches(DeviceType::CUSTOM));
    }

    #[test]
    fn device_type_display() {
        assert_eq!(DeviceType::ALL.to_string(), "all");
        assert_eq!(DeviceType::GPU.to_string(), "gpu");
        assert_eq!(DeviceType::CUSTOM.to_string(), "custom");
        assert_eq!(DeviceType::from_bits(0x6).to_string(), "0x6");
    }

    #[test]
    fn setting_parse_roundtrip() {
        for s in [
            DeviceTypeSetting::All,
            DeviceTypeSetting::Default,
            DeviceTypeSetting::Cpu,
            DeviceTypeSetting::Gpu,
            DeviceTypeSetting::Accelerator,
        ] {
            let parsed: DeviceTypeSetting = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
        assert!("fpga".parse::<DeviceTypeSetting>().is_err());
    }

    #[test]
    fn kernel_arg_sizes() {
        let buf = 7u8;
        assert_eq!(KernelArg::<u8>::Int(3).size_bytes(), 4);
        assert_eq!(KernelArg::Mem(&buf).size_bytes(), std::mem::size_of::<usize>());
    }
}
