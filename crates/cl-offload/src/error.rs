//! Error types for device discovery, setup, kernel loading and dispatch.

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;

/// OpenCL status codes (subset the host layer reports by name).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ClStatus {
    Success = 0,
    DeviceNotFound = -1,
    DeviceNotAvailable = -2,
    CompilerNotAvailable = -3,
    MemObjectAllocationFailure = -4,
    OutOfResources = -5,
    OutOfHostMemory = -6,
    BuildProgramFailure = -11,
    InvalidValue = -30,
    InvalidDeviceType = -31,
    InvalidPlatform = -32,
    InvalidDevice = -33,
    InvalidContext = -34,
    InvalidQueueProperties = -35,
    InvalidCommandQueue = -36,
    InvalidHostPtr = -37,
    InvalidMemObject = -38,
    InvalidBinary = -42,
    InvalidBuildOptions = -43,
    InvalidProgram = -44,
    InvalidProgramExecutable = -45,
    InvalidKernelName = -46,
    InvalidKernelDefinition = -47,
    InvalidKernel = -48,
    InvalidArgIndex = -49,
    InvalidArgValue = -50,
    InvalidArgSize = -51,
    InvalidKernelArgs = -52,
    InvalidWorkDimension = -53,
    InvalidWorkGroupSize = -54,
    InvalidOperation = -59,
    InvalidBufferSize = -61,
    InvalidGlobalWorkSize = -63,
    PlatformNotFoundKhr = -1001,
    Unknown = i32::MIN,
}

impl ClStatus {
    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -1 => Self::DeviceNotFound,
            -2 => Self::DeviceNotAvailable,
            -3 => Self::CompilerNotAvailable,
            -4 => Self::MemObjectAllocationFailure,
            -5 => Self::OutOfResources,
            -6 => Self::OutOfHostMemory,
            -11 => Self::BuildProgramFailure,
            -30 => Self::InvalidValue,
            -31 => Self::InvalidDeviceType,
            -32 => Self::InvalidPlatform,
            -33 => Self::InvalidDevice,
            -34 => Self::InvalidContext,
            -35 => Self::InvalidQueueProperties,
            -36 => Self::InvalidCommandQueue,
            -37 => Self::InvalidHostPtr,
            -38 => Self::InvalidMemObject,
            -42 => Self::InvalidBinary,
            -43 => Self::InvalidBuildOptions,
            -44 => Self::InvalidProgram,
            -45 => Self::InvalidProgramExecutable,
            -46 => Self::InvalidKernelName,
            -47 => Self::InvalidKernelDefinition,
            -48 => Self::InvalidKernel,
            -49 => Self::InvalidArgIndex,
            -50 => Self::InvalidArgValue,
            -51 => Self::InvalidArgSize,
            -52 => Self::InvalidKernelArgs,
            -53 => Self::InvalidWorkDimension,
            -54 => Self::InvalidWorkGroupSize,
            -59 => Self::InvalidOperation,
            -61 => Self::InvalidBufferSize,
            -63 => Self::InvalidGlobalWorkSize,
            -1001 => Self::PlatformNotFoundKhr,
            _ => Self::Unknown,
        }
    }
}

/// A failed driver call: the raw status plus whatever the driver said.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("driver status {status} ({:?}): {message}", status_name(.status))]
pub struct DriverError {
    pub status: i32,
    pub message: String,
}

impl DriverError {
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    /// Shorthand for a driver error carrying a known status.
    pub fn from_status(status: ClStatus, message: impl Into<String>) -> Self {
        Self::new(status as i32, message)
    }

    pub fn code(&self) -> ClStatus {
        ClStatus::from_raw(self.status)
    }
}

/// Result of a single driver call.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// The host-side step at which an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    EnumeratePlatforms,
    EnumerateDevices,
    CreateContext,
    CreateQueue,
    FetchSource,
    CreateProgram,
    BuildProgram,
    CreateKernel,
    CreateBuffer,
    SetKernelArg,
    EnqueueKernel,
    ReadBuffer,
    Finish,
    Release,
    Validate,
    Configure,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::EnumeratePlatforms => "enumerate-platforms",
            Self::EnumerateDevices => "enumerate-devices",
            Self::CreateContext => "create-context",
            Self::CreateQueue => "create-queue",
            Self::FetchSource => "fetch-source",
            Self::CreateProgram => "create-program",
            Self::BuildProgram => "build-program",
            Self::CreateKernel => "create-kernel",
            Self::CreateBuffer => "create-buffer",
            Self::SetKernelArg => "set-kernel-arg",
            Self::EnqueueKernel => "enqueue-kernel",
            Self::ReadBuffer => "read-buffer",
            Self::Finish => "finish",
            Self::Release => "release",
            Self::Validate => "validate",
            Self::Configure => "configure",
        };
        f.write_str(s)
    }
}

/// Device resource kinds, used when reporting release failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Context,
    Queue,
    Program,
    Kernel,
    Buffer,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Context => write!(f, "context"),
            Self::Queue => write!(f, "command queue"),
            Self::Program => write!(f, "program"),
            Self::Kernel => write!(f, "kernel"),
            Self::Buffer => write!(f, "buffer"),
        }
    }
}

/// Errors produced by the offload layer.
#[derive(Debug, Error)]
pub enum OffloadError {
    #[error(
        "no OpenCL platform at index {requested} ({available} available){}",
        status_suffix(.status)
    )]
    NoPlatform { requested: usize, available: usize, status: Option<i32> },

    #[error(
        "no device of type {device_type} at index {requested} on platform {platform_index} \
         ({available} available){}",
        status_suffix(.status)
    )]
    NoDevice {
        platform_index: usize,
        device_type: String,
        requested: usize,
        available: usize,
        status: Option<i32>,
    },

    #[error("context creation failed: {source}")]
    ContextCreation {
        #[source]
        source: DriverError,
    },

    #[error("command queue creation failed: {source}")]
    QueueCreation {
        #[source]
        source: DriverError,
    },

    #[error("kernel source for '{kernel}' not found at {location}: {reason}")]
    SourceNotFound { kernel: String, location: String, reason: String },

    #[error("kernel '{kernel}' failed to compile (status {status}):\n{log}")]
    Compilation { kernel: String, status: i32, log: String },

    #[error("entry point '{kernel}' not found in compiled program: {source}")]
    EntryPointNotFound {
        kernel: String,
        #[source]
        source: DriverError,
    },

    #[error("binding kernel argument {index} failed: {source}")]
    ArgumentBinding {
        index: u32,
        #[source]
        source: DriverError,
    },

    #[error("allocating device buffer {index} ({size_bytes} bytes) failed: {source}")]
    BufferAllocation {
        index: usize,
        size_bytes: usize,
        #[source]
        source: DriverError,
    },

    #[error("dispatch failed at {step}: {source}")]
    Dispatch {
        step: Step,
        #[source]
        source: DriverError,
    },

    #[error("releasing {resource} failed: {source}")]
    Release {
        resource: Resource,
        #[source]
        source: DriverError,
    },

    #[error("invalid dispatch input: {0}")]
    InvalidInput(String),

    #[error("no kernel loaded")]
    NoKernelLoaded,

    #[error("session already shut down")]
    SessionClosed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn status_name(status: &i32) -> ClStatus {
    ClStatus::from_raw(*status)
}

fn status_suffix(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!(" [status {code}]"),
        None => String::new(),
    }
}

impl OffloadError {
    /// The step that failed.
    pub fn step(&self) -> Step {
        match self {
            Self::NoPlatform { .. } => Step::EnumeratePlatforms,
            Self::NoDevice { .. } => Step::EnumerateDevices,
            Self::ContextCreation { .. } => Step::CreateContext,
            Self::QueueCreation { .. } => Step::CreateQueue,
            Self::SourceNotFound { .. } => Step::FetchSource,
            Self::Compilation { .. } => Step::BuildProgram,
            Self::EntryPointNotFound { .. } => Step::CreateKernel,
            Self::ArgumentBinding { .. } => Step::SetKernelArg,
            Self::BufferAllocation { .. } => Step::CreateBuffer,
            Self::Dispatch { step, .. } => *step,
            Self::Release { .. } => Step::Release,
            Self::InvalidInput(_) | Self::NoKernelLoaded | Self::SessionClosed => Step::Validate,
            Self::Config(_) => Step::Configure,
        }
    }

    /// Raw driver status, when the failure came from the driver.
    pub fn status(&self) -> Option<i32> {
        match self {
            Self::NoPlatform { status, .. } | Self::NoDevice { status, .. } => *status,
            Self::Compilation { status, .. } => Some(*status),
            Self::ContextCreation { source }
            | Self::QueueCreation { source }
            | Self::EntryPointNotFound { source, .. }
            | Self::ArgumentBinding { source, .. }
            | Self::BufferAllocation { source, .. }
            | Self::Dispatch { source, .. }
            | Self::Release { source, .. } => Some(source.status),
            _ => None,
        }
    }

    /// Whether the failure ends the session: discovery and setup failures
    /// leave nothing to run on, and a closed session stays closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoPlatform { .. }
                | Self::NoDevice { .. }
                | Self::ContextCreation { .. }
                | Self::QueueCreation { .. }
                | Self::SessionClosed
                | Self::Config(_)
        )
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, OffloadError>;
