//! Host-side OpenCL orchestration.
//!
//! This crate provides:
//! - [`resolver`]: platform/device selection by fixed index
//! - [`context`]: the single-device context and its command queue
//! - [`loader`]: program build and entry-point extraction from named sources
//! - [`dispatch`]: synchronous two-input, one-output element-wise dispatch
//! - [`session`]: a facade tying the stages together with ordered shutdown
//!
//! All device access goes through the [`ComputeDriver`] trait. The CPU
//! reference [`HostDriver`] always ships; the real OpenCL driver is behind
//! the `opencl` feature.

#![deny(unused_must_use)]

pub mod config;
pub mod context;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod host;
pub mod kernels;
pub mod loader;
pub mod observe;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod resolver;
pub mod session;

// Re-export primary public types.
pub use config::{ConfigError, OffloadConfig};
pub use context::ExecutionContext;
pub use dispatch::{BufferGuard, dispatch};
pub use driver::{
    ComputeDriver, ContextProperties, DeviceType, DeviceTypeSetting, KernelArg, MemFlags,
    QueueProperties,
};
pub use error::{ClStatus, DriverError, OffloadError, Resource, Result, Step};
pub use host::{Fault, HostCall, HostDriver, HostPlatformSpec};
pub use loader::{
    FileSourceStore, InlineSourceStore, KernelSlot, KernelSourceStore, LoadedKernel, load_kernel,
};
pub use observe::{EventSink, LifecycleEvent, MemorySink, TracingSink};
#[cfg(feature = "opencl")]
pub use opencl::OpenClDriver;
pub use resolver::{DeviceSelection, ResolvedDevice, resolve};
pub use session::Session;
