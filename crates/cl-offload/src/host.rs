//! CPU reference driver.
//!
//! [`HostDriver`] implements [`ComputeDriver`] entirely in host memory so
//! the orchestration layer can run without an OpenCL runtime. It checks
//! handle validity the way a real driver does, "compiles" programs by
//! locating `__kernel void name(` entry points, and executes element-wise
//! kernels through host closures registered per entry-point name.
//!
//! It also keeps per-resource creation/release counts, a log of accepted
//! calls, and one-shot fault injection, which is what the crate's own tests
//! use to verify ordering and leak freedom.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::driver::{
    ComputeDriver, ContextProperties, DeviceType, KernelArg, MemFlags, QueueProperties,
};
use crate::error::{ClStatus, DriverError, DriverResult, Resource};

/// Element-wise host implementation of a kernel: `out[i] = f(a[i], b[i])`.
pub type HostKernelFn = Box<dyn Fn(f32, f32) -> f32>;

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Describes one emulated platform and its devices.
#[derive(Debug, Clone)]
pub struct HostPlatformSpec {
    name: String,
    devices: Vec<(String, DeviceType)>,
}

impl HostPlatformSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), devices: Vec::new() }
    }

    #[must_use]
    pub fn device(mut self, name: impl Into<String>, device_type: DeviceType) -> Self {
        self.devices.push((name.into(), device_type));
        self
    }

    #[must_use]
    pub fn cpu(self, name: impl Into<String>) -> Self {
        self.device(name, DeviceType::CPU)
    }

    #[must_use]
    pub fn gpu(self, name: impl Into<String>) -> Self {
        self.device(name, DeviceType::GPU)
    }

    #[must_use]
    pub fn accelerator(self, name: impl Into<String>) -> Self {
        self.device(name, DeviceType::ACCELERATOR)
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostPlatform(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostDevice {
    platform: usize,
    index: usize,
}

#[derive(Debug)]
pub struct HostContext(u64);

#[derive(Debug)]
pub struct HostQueue(u64);

#[derive(Debug)]
pub struct HostProgram(u64);

#[derive(Debug)]
pub struct HostKernel(u64);

#[derive(Debug)]
pub struct HostBuffer(u64);

/// A bound kernel argument as the driver saw it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostArg {
    Int(i32),
    Buffer(u64),
}

// ---------------------------------------------------------------------------
// Call log, stats and faults
// ---------------------------------------------------------------------------

/// A driver call that was accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    CreateContext { id: u64 },
    CreateQueue { id: u64, profiling: bool },
    CreateProgram { id: u64 },
    BuildProgram { id: u64, options: String },
    CreateKernel { id: u64, name: String },
    CreateBuffer { id: u64, size_bytes: usize },
    SetKernelArg { kernel: u64, index: u32, arg: HostArg },
    EnqueueNdRange { kernel: u64, global_work_size: Vec<usize> },
    ReadBuffer { buffer: u64, blocking: bool, len: usize },
    Finish { queue: u64 },
    Release { resource: Resource, id: u64 },
}

impl HostCall {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateContext { .. } => "create-context",
            Self::CreateQueue { .. } => "create-queue",
            Self::CreateProgram { .. } => "create-program",
            Self::BuildProgram { .. } => "build-program",
            Self::CreateKernel { .. } => "create-kernel",
            Self::CreateBuffer { .. } => "create-buffer",
            Self::SetKernelArg { .. } => "set-kernel-arg",
            Self::EnqueueNdRange { .. } => "enqueue-nd-range",
            Self::ReadBuffer { .. } => "read-buffer",
            Self::Finish { .. } => "finish",
            Self::Release { resource, .. } => match resource {
                Resource::Context => "release-context",
                Resource::Queue => "release-queue",
                Resource::Program => "release-program",
                Resource::Kernel => "release-kernel",
                Resource::Buffer => "release-buffer",
            },
        }
    }
}

/// Per-resource creation and release counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostStats {
    created: HashMap<Resource, usize>,
    released: HashMap<Resource, usize>,
}

impl HostStats {
    pub fn created(&self, resource: Resource) -> usize {
        self.created.get(&resource).copied().unwrap_or(0)
    }

    pub fn released(&self, resource: Resource) -> usize {
        self.released.get(&resource).copied().unwrap_or(0)
    }

    pub fn live(&self, resource: Resource) -> usize {
        self.created(resource).saturating_sub(self.released(resource))
    }

    /// Live handles across every resource kind.
    pub fn live_total(&self) -> usize {
        [Resource::Context, Resource::Queue, Resource::Program, Resource::Kernel, Resource::Buffer]
            .into_iter()
            .map(|r| self.live(r))
            .sum()
    }

    fn on_create(&mut self, resource: Resource) {
        *self.created.entry(resource).or_default() += 1;
    }

    fn on_release(&mut self, resource: Resource) {
        *self.released.entry(resource).or_default() += 1;
    }
}

/// A one-shot failure: the next matching call returns `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    PlatformQuery(ClStatus),
    DeviceQuery(ClStatus),
    CreateContext(ClStatus),
    CreateQueue(ClStatus),
    CreateProgram(ClStatus),
    /// Fail the `nth` buffer creation (1-based) after injection.
    CreateBuffer { nth: usize, status: ClStatus },
    SetKernelArg { index: u32, status: ClStatus },
    EnqueueKernel(ClStatus),
    ReadBuffer(ClStatus),
    Finish(ClStatus),
    Release(Resource, ClStatus),
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct ContextState {
    platform: HostPlatform,
    devices: Vec<HostDevice>,
}

struct QueueState {
    profiling: bool,
}

struct ProgramState {
    context: u64,
    source: String,
    entries: Option<Vec<String>>,
    log: String,
}

struct KernelState {
    name: String,
    args: BTreeMap<u32, HostArg>,
}

#[derive(Default)]
struct HostState {
    next_id: u64,
    contexts: HashMap<u64, ContextState>,
    queues: HashMap<u64, QueueState>,
    programs: HashMap<u64, ProgramState>,
    kernels: HashMap<u64, KernelState>,
    buffers: HashMap<u64, Vec<f32>>,
    stats: HostStats,
    calls: Vec<HostCall>,
    faults: Vec<Fault>,
    last_build_options: Option<String>,
}

impl HostState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Remove and return the first fault matching `pred`.
    fn take_fault(&mut self, pred: impl Fn(&Fault) -> Option<ClStatus>) -> Option<ClStatus> {
        let pos = self.faults.iter().position(|f| pred(f).is_some())?;
        pred(&self.faults.remove(pos))
    }

    fn fail(&mut self, pred: impl Fn(&Fault) -> Option<ClStatus>, what: &str) -> DriverResult<()> {
        match self.take_fault(pred) {
            Some(status) => {
                Err(DriverError::from_status(status, format!("injected fault: {what}")))
            }
            None => Ok(()),
        }
    }

    fn buffer_fault(&mut self) -> Option<ClStatus> {
        let mut hit = None;
        self.faults.retain_mut(|f| match f {
            Fault::CreateBuffer { nth, status } if hit.is_none() => {
                if *nth <= 1 {
                    hit = Some(*status);
                    false
                } else {
                    *nth -= 1;
                    true
                }
            }
            _ => true,
        });
        hit
    }

    fn release(&mut self, resource: Resource, id: u64) -> DriverResult<()> {
        self.fail(
            |f| match f {
                Fault::Release(r, s) if *r == resource => Some(*s),
                _ => None,
            },
            "release",
        )?;
        let removed = match resource {
            Resource::Context => self.contexts.remove(&id).is_some(),
            Resource::Queue => self.queues.remove(&id).is_some(),
            Resource::Program => self.programs.remove(&id).is_some(),
            Resource::Kernel => self.kernels.remove(&id).is_some(),
            Resource::Buffer => self.buffers.remove(&id).is_some(),
        };
        if !removed {
            let status = match resource {
                Resource::Context => ClStatus::InvalidContext,
                Resource::Queue => ClStatus::InvalidCommandQueue,
                Resource::Program => ClStatus::InvalidProgram,
                Resource::Kernel => ClStatus::InvalidKernel,
                Resource::Buffer => ClStatus::InvalidMemObject,
            };
            return Err(DriverError::from_status(status, format!("unknown {resource} {id}")));
        }
        self.stats.on_release(resource);
        self.calls.push(HostCall::Release { resource, id });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HostDriver
// ---------------------------------------------------------------------------

/// In-process reference implementation of [`ComputeDriver`].
///
/// Single-threaded by construction (`RefCell` state), matching the
/// single-caller model of the orchestration layer.
pub struct HostDriver {
    platforms: Vec<HostPlatformSpec>,
    host_kernels: HashMap<String, HostKernelFn>,
    state: RefCell<HostState>,
}

impl HostDriver {
    pub fn with_platforms(platforms: Vec<HostPlatformSpec>) -> Self {
        Self { platforms, host_kernels: HashMap::new(), state: RefCell::new(HostState::default()) }
    }

    /// One platform with one CPU device.
    pub fn single_cpu() -> Self {
        Self::with_platforms(vec![
            HostPlatformSpec::new("Host Reference Platform").cpu("Host Reference Device"),
        ])
    }

    /// Register the host implementation executed for entry point `name`.
    #[must_use]
    pub fn with_host_kernel(
        mut self,
        name: impl Into<String>,
        f: impl Fn(f32, f32) -> f32 + 'static,
    ) -> Self {
        self.host_kernels.insert(name.into(), Box::new(f));
        self
    }

    /// Arm a one-shot fault.
    pub fn inject(&self, fault: Fault) {
        self.state.borrow_mut().faults.push(fault);
    }

    pub fn stats(&self) -> HostStats {
        self.state.borrow().stats.clone()
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn last_build_options(&self) -> Option<String> {
        self.state.borrow().last_build_options.clone()
    }

    pub fn queue_profiling(&self, queue: &HostQueue) -> bool {
        self.state.borrow().queues.get(&queue.0).is_some_and(|q| q.profiling)
    }

    pub fn context_platform(&self, context: &HostContext) -> Option<HostPlatform> {
        self.state.borrow().contexts.get(&context.0).map(|c| c.platform)
    }

    /// Current contents of a live buffer.
    pub fn buffer_contents(&self, buffer: &HostBuffer) -> Option<Vec<f32>> {
        self.state.borrow().buffers.get(&buffer.0).cloned()
    }

    fn platform_spec(&self, platform: HostPlatform) -> DriverResult<&HostPlatformSpec> {
        self.platforms.get(platform.0).ok_or_else(|| {
            DriverError::from_status(ClStatus::InvalidPlatform, format!("platform {}", platform.0))
        })
    }

    fn matching_devices(
        &self,
        platform: HostPlatform,
        mask: DeviceType,
    ) -> DriverResult<Vec<HostDevice>> {
        let spec = self.platform_spec(platform)?;
        let devices: Vec<HostDevice> = spec
            .devices
            .iter()
            .enumerate()
            .filter(|(_, (_, ty))| mask.matches(*ty))
            .map(|(index, _)| HostDevice { platform: platform.0, index })
            .collect();
        if devices.is_empty() {
            return Err(DriverError::from_status(
                ClStatus::DeviceNotFound,
                format!("no {mask} devices on platform {}", platform.0),
            ));
        }
        Ok(devices)
    }

    fn execute(
        &self,
        state: &mut HostState,
        kernel_id: u64,
        global_items: usize,
    ) -> DriverResult<()> {
        let kernel = state.kernels.get(&kernel_id).ok_or_else(|| {
            DriverError::from_status(ClStatus::InvalidKernel, format!("kernel {kernel_id}"))
        })?;
        let f = self.host_kernels.get(&kernel.name).ok_or_else(|| {
            DriverError::from_status(
                ClStatus::InvalidOperation,
                format!("no host implementation for kernel '{}'", kernel.name),
            )
        })?;

        let bad_args = |what: &str| {
            DriverError::from_status(
                ClStatus::InvalidKernelArgs,
                format!("kernel '{}': {what}", kernel.name),
            )
        };
        let (n, a, b, out) = match (
            kernel.args.get(&0),
            kernel.args.get(&1),
            kernel.args.get(&2),
            kernel.args.get(&3),
        ) {
            (
                Some(HostArg::Int(n)),
                Some(HostArg::Buffer(a)),
                Some(HostArg::Buffer(b)),
                Some(HostArg::Buffer(out)),
            ) => (*n, *a, *b, *out),
            _ => return Err(bad_args("expected (int, buffer, buffer, buffer)")),
        };
        let n = usize::try_from(n).map_err(|_| bad_args("negative element count"))?;

        let lhs = state.buffers.get(&a).ok_or_else(|| bad_args("input 0 released"))?;
        let rhs = state.buffers.get(&b).ok_or_else(|| bad_args("input 1 released"))?;
        let active = global_items.min(n);
        if lhs.len() < active || rhs.len() < active {
            return Err(bad_args("input buffer shorter than element count"));
        }
        let results: Vec<f32> = (0..active).map(|i| f(lhs[i], rhs[i])).collect();

        let dest = state.buffers.get_mut(&out).ok_or_else(|| bad_args("output released"))?;
        if dest.len() < active {
            return Err(bad_args("output buffer shorter than element count"));
        }
        dest[..active].copy_from_slice(&results);
        Ok(())
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::single_cpu()
    }
}

impl fmt::Debug for HostDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDriver")
            .field("platforms", &self.platforms.len())
            .field("host_kernels", &self.host_kernels.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ComputeDriver for HostDriver {
    type Platform = HostPlatform;
    type Device = HostDevice;
    type Context = HostContext;
    type Queue = HostQueue;
    type Program = HostProgram;
    type Kernel = HostKernel;
    type Buffer = HostBuffer;

    fn platform_count(&self) -> DriverResult<usize> {
        self.state.borrow_mut().fail(
            |f| match f {
                Fault::PlatformQuery(s) => Some(*s),
                _ => None,
            },
            "platform query",
        )?;
        Ok(self.platforms.len())
    }

    fn platforms(&self) -> DriverResult<Vec<HostPlatform>> {
        Ok((0..self.platforms.len()).map(HostPlatform).collect())
    }

    fn device_count(&self, platform: HostPlatform, mask: DeviceType) -> DriverResult<usize> {
        self.state.borrow_mut().fail(
            |f| match f {
                Fault::DeviceQuery(s) => Some(*s),
                _ => None,
            },
            "device query",
        )?;
        Ok(self.matching_devices(platform, mask)?.len())
    }

    fn devices(&self, platform: HostPlatform, mask: DeviceType) -> DriverResult<Vec<HostDevice>> {
        self.matching_devices(platform, mask)
    }

    fn platform_name(&self, platform: HostPlatform) -> String {
        self.platforms.get(platform.0).map(|p| p.name.clone()).unwrap_or_default()
    }

    fn device_name(&self, device: HostDevice) -> String {
        self.platforms
            .get(device.platform)
            .and_then(|p| p.devices.get(device.index))
            .map(|(name, _)| name.clone())
            .unwrap_or_default()
    }

    fn create_context(
        &self,
        properties: &ContextProperties<HostPlatform>,
        devices: &[HostDevice],
    ) -> DriverResult<HostContext> {
        let mut state = self.state.borrow_mut();
        state.fail(
            |f| match f {
                Fault::CreateContext(s) => Some(*s),
                _ => None,
            },
            "create context",
        )?;
        let spec = self.platform_spec(properties.platform)?;
        if devices.is_empty() {
            return Err(DriverError::from_status(ClStatus::InvalidValue, "no devices"));
        }
        for d in devices {
            if d.platform != properties.platform.0 || d.index >= spec.devices.len() {
                return Err(DriverError::from_status(
                    ClStatus::InvalidDevice,
                    format!("device {d:?} not on platform {}", properties.platform.0),
                ));
            }
        }
        let id = state.alloc_id();
        state
            .contexts
            .insert(id, ContextState { platform: properties.platform, devices: devices.to_vec() });
        state.stats.on_create(Resource::Context);
        state.calls.push(HostCall::CreateContext { id });
        Ok(HostContext(id))
    }

    fn create_queue(
        &self,
        context: &HostContext,
        device: HostDevice,
        properties: QueueProperties,
    ) -> DriverResult<HostQueue> {
        let mut state = self.state.borrow_mut();
        state.fail(
            |f| match f {
                Fault::CreateQueue(s) => Some(*s),
                _ => None,
            },
            "create queue",
        )?;
        let ctx = state.contexts.get(&context.0).ok_or_else(|| {
            DriverError::from_status(ClStatus::InvalidContext, format!("context {}", context.0))
        })?;
        if !ctx.devices.contains(&device) {
            return Err(DriverError::from_status(
                ClStatus::InvalidDevice,
                format!("device {device:?} not in context {}", context.0),
            ));
        }
        let id = state.alloc_id();
        state.queues.insert(id, QueueState { profiling: properties.profiling });
        state.stats.on_create(Resource::Queue);
        state.calls.push(HostCall::CreateQueue { id, profiling: properties.profiling });
        Ok(HostQueue(id))
    }

    fn create_program_with_source(
        &self,
        context: &HostContext,
        source: &str,
    ) -> DriverResult<HostProgram> {
        let mut state = self.state.borrow_mut();
        state.fail(
            |f| match f {
                Fault::CreateProgram(s) => Some(*s),
                _ => None,
            },
            "create program",
        )?;
        if !state.contexts.contains_key(&context.0) {
            return Err(DriverError::from_status(
                ClStatus::InvalidContext,
                format!("context {}", context.0),
            ));
        }
        if source.trim().is_empty() {
            return Err(DriverError::from_status(ClStatus::InvalidValue, "empty program source"));
        }
        let id = state.alloc_id();
        state.programs.insert(
            id,
            ProgramState {
                context: context.0,
                source: source.to_string(),
                entries: None,
                log: String::new(),
            },
        );
        state.stats.on_create(Resource::Program);
        state.calls.push(HostCall::CreateProgram { id });
        Ok(HostProgram(id))
    }

    fn build_program(
        &self,
        program: &HostProgram,
        devices: &[HostDevice],
        options: &str,
    ) -> DriverResult<()> {
        let mut state = self.state.borrow_mut();
        state.last_build_options = Some(options.to_string());
        let prog = state.programs.get(&program.0).ok_or_else(|| {
            DriverError::from_status(ClStatus::InvalidProgram, format!("program {}", program.0))
        })?;
        let ctx_devices = state.contexts.get(&prog.context).map(|c| c.devices.clone());
        if devices.iter().any(|d| !ctx_devices.as_ref().is_some_and(|c| c.contains(d))) {
            return Err(DriverError::from_status(ClStatus::InvalidDevice, "device not in context"));
        }
        let outcome = check_source(&prog.source);
        let prog = state.programs.get_mut(&program.0).ok_or_else(|| {
            DriverError::from_status(ClStatus::InvalidProgram, format!("program {}", program.0))
        })?;
        match outcome {
            Ok(entries) => {
                prog.entries = Some(entries);
                prog.log.clear();
            }
            Err(log) => {
                prog.entries = None;
                prog.log = log;
                return Err(DriverError::from_status(
                    ClStatus::BuildProgramFailure,
                    "program build failed",
                ));
            }
        }
        state.calls.push(HostCall::BuildProgram { id: program.0, options: options.to_string() });
        Ok(())
    }

    fn program_build_log(
        &self,
        program: &HostProgram,
        _device: HostDevice,
    ) -> DriverResult<String> {
        self.state.borrow().programs.get(&program.0).map(|p| p.log.clone()).ok_or_else(|| {
            DriverError::from_status(ClStatus::InvalidProgram, format!("program {}", program.0))
        })
    }

    fn create_kernel(&self, program: &HostProgram, name: &str) -> DriverResult<HostKernel> {
        let mut state = self.state.borrow_mut();
        let prog = state.programs.get(&program.0).ok_or_else(|| {
            DriverError::from_status(ClStatus::InvalidProgram, format!("program {}", program.0))
        })?;
        let Some(entries) = &prog.entries else {
            return Err(DriverError::from_status(
                ClStatus::InvalidProgramExecutable,
                "program has not been built",
            ));
        };
        if !entries.iter().any(|e| e == name) {
            return Err(DriverError::from_status(
                ClStatus::InvalidKernelName,
                format!("no kernel named '{name}' (have: {})", entries.join(", ")),
            ));
        }
        let id = state.alloc_id();
        state.kernels.insert(id, KernelState { name: name.to_string(), args: BTreeMap::new() });
        state.stats.on_create(Resource::Kernel);
        state.calls.push(HostCall::CreateKernel { id, name: name.to_string() });
        Ok(HostKernel(id))
    }

    fn create_buffer(
        &self,
        context: &HostContext,
        flags: MemFlags,
        size_bytes: usize,
        host_data: &[f32],
    ) -> DriverResult<HostBuffer> {
        let mut state = self.state.borrow_mut();
        if let Some(status) = state.buffer_fault() {
            return Err(DriverError::from_status(status, "injected fault: create buffer"));
        }
        if !state.contexts.contains_key(&context.0) {
            return Err(DriverError::from_status(
                ClStatus::InvalidContext,
                format!("context {}", context.0),
            ));
        }
        let elem = std::mem::size_of::<f32>();
        if size_bytes % elem != 0 {
            return Err(DriverError::from_status(
                ClStatus::InvalidBufferSize,
                format!("{size_bytes} bytes is not a whole number of floats"),
            ));
        }
        let len = size_bytes / elem;
        let data = match flags {
            MemFlags::CopyHostPtr => host_data.get(..len).map(<[f32]>::to_vec).ok_or_else(|| {
                DriverError::from_status(
                    ClStatus::InvalidHostPtr,
                    format!("host data holds {} floats, need {len}", host_data.len()),
                )
            })?,
        };
        let id = state.alloc_id();
        state.buffers.insert(id, data);
        state.stats.on_create(Resource::Buffer);
        state.calls.push(HostCall::CreateBuffer { id, size_bytes });
        Ok(HostBuffer(id))
    }

    fn set_kernel_arg(
        &self,
        kernel: &HostKernel,
        index: u32,
        arg: KernelArg<'_, HostBuffer>,
    ) -> DriverResult<()> {
        let mut state = self.state.borrow_mut();
        state.fail(
            |f| match f {
                Fault::SetKernelArg { index: i, status } if *i == index => Some(*status),
                _ => None,
            },
            "set kernel arg",
        )?;
        let host_arg = match arg {
            KernelArg::Int(v) => HostArg::Int(v),
            KernelArg::Mem(buffer) => {
                if !state.buffers.contains_key(&buffer.0) {
                    return Err(DriverError::from_status(
                        ClStatus::InvalidMemObject,
                        format!("buffer {}", buffer.0),
                    ));
                }
                HostArg::Buffer(buffer.0)
            }
        };
        let k = state.kernels.get_mut(&kernel.0).ok_or_else(|| {
            DriverError::from_status(ClStatus::InvalidKernel, format!("kernel {}", kernel.0))
        })?;
        k.args.insert(index, host_arg);
        state.calls.push(HostCall::SetKernelArg { kernel: kernel.0, index, arg: host_arg });
        Ok(())
    }

    fn enqueue_nd_range(
        &self,
        queue: &HostQueue,
        kernel: &HostKernel,
        global_work_size: &[usize],
    ) -> DriverResult<()> {
        let mut state = self.state.borrow_mut();
        state.fail(
            |f| match f {
                Fault::EnqueueKernel(s) => Some(*s),
                _ => None,
            },
            "enqueue kernel",
        )?;
        if !state.queues.contains_key(&queue.0) {
            return Err(DriverError::from_status(
                ClStatus::InvalidCommandQueue,
                format!("queue {}", queue.0),
            ));
        }
        if global_work_size.is_empty() || global_work_size.len() > 3 {
            return Err(DriverError::from_status(
                ClStatus::InvalidWorkDimension,
                format!("{} dimensions", global_work_size.len()),
            ));
        }
        // The in-order queue runs the range to completion at enqueue time.
        let items = global_work_size.iter().product();
        self.execute(&mut state, kernel.0, items)?;
        state.calls.push(HostCall::EnqueueNdRange {
            kernel: kernel.0,
            global_work_size: global_work_size.to_vec(),
        });
        Ok(())
    }

    fn enqueue_read_buffer(
        &self,
        queue: &HostQueue,
        buffer: &HostBuffer,
        blocking: bool,
        offset: usize,
        dest: &mut [f32],
    ) -> DriverResult<()> {
        let mut state = self.state.borrow_mut();
        state.fail(
            |f| match f {
                Fault::ReadBuffer(s) => Some(*s),
                _ => None,
            },
            "read buffer",
        )?;
        if !state.queues.contains_key(&queue.0) {
            return Err(DriverError::from_status(
                ClStatus::InvalidCommandQueue,
                format!("queue {}", queue.0),
            ));
        }
        let data = state.buffers.get(&buffer.0).ok_or_else(|| {
            DriverError::from_status(ClStatus::InvalidMemObject, format!("buffer {}", buffer.0))
        })?;
        let elem = std::mem::size_of::<f32>();
        if offset % elem != 0 {
            return Err(DriverError::from_status(ClStatus::InvalidValue, "unaligned offset"));
        }
        let start = offset / elem;
        let src = data.get(start..start + dest.len()).ok_or_else(|| {
            DriverError::from_status(ClStatus::InvalidValue, "read past end of buffer")
        })?;
        dest.copy_from_slice(src);
        state.calls.push(HostCall::ReadBuffer { buffer: buffer.0, blocking, len: dest.len() });
        Ok(())
    }

    fn finish(&self, queue: &HostQueue) -> DriverResult<()> {
        let mut state = self.state.borrow_mut();
        state.fail(
            |f| match f {
                Fault::Finish(s) => Some(*s),
                _ => None,
            },
            "finish",
        )?;
        if !state.queues.contains_key(&queue.0) {
            return Err(DriverError::from_status(
                ClStatus::InvalidCommandQueue,
                format!("queue {}", queue.0),
            ));
        }
        state.calls.push(HostCall::Finish { queue: queue.0 });
        Ok(())
    }

    fn release_kernel(&self, kernel: HostKernel) -> DriverResult<()> {
        self.state.borrow_mut().release(Resource::Kernel, kernel.0)
    }

    fn release_program(&self, program: HostProgram) -> DriverResult<()> {
        self.state.borrow_mut().release(Resource::Program, program.0)
    }

    fn release_queue(&self, queue: HostQueue) -> DriverResult<()> {
        self.state.borrow_mut().release(Resource::Queue, queue.0)
    }

    fn release_context(&self, context: HostContext) -> DriverResult<()> {
        self.state.borrow_mut().release(Resource::Context, context.0)
    }

    fn release_buffer(&self, buffer: HostBuffer) -> DriverResult<()> {
        self.state.borrow_mut().release(Resource::Buffer, buffer.0)
    }
}

// ---------------------------------------------------------------------------
// Source checking
// ---------------------------------------------------------------------------

/// Validate brace balance and collect `__kernel void name(` entry points.
///
/// Returns the entry names, or a build log describing every problem.
fn check_source(source: &str) -> Result<Vec<String>, String> {
    let tokens = tokenize(source);
    let mut problems = Vec::new();

    let mut depth = 0i64;
    for (tok, line) in &tokens {
        match tok.as_str() {
            "{" => depth += 1,
            "}" => {
                depth -= 1;
                if depth < 0 {
                    problems.push(format!("line {line}: unbalanced '}}'"));
                    depth = 0;
                }
            }
            _ => {}
        }
    }
    if depth > 0 {
        problems.push(format!("unbalanced braces: {depth} unclosed '{{' at end of input"));
    }

    let mut entries = Vec::new();
    for (i, (tok, line)) in tokens.iter().enumerate() {
        if tok != "__kernel" && tok != "kernel" {
            continue;
        }
        match (tokens.get(i + 1), tokens.get(i + 2), tokens.get(i + 3)) {
            (Some((v, _)), Some((name, _)), Some((paren, _)))
                if v == "void" && is_ident(name) && paren == "(" =>
            {
                entries.push(name.clone());
            }
            _ => problems.push(format!("line {line}: kernel functions must return void")),
        }
    }
    if entries.is_empty() && problems.is_empty() {
        problems.push("no __kernel functions found".to_string());
    }

    if problems.is_empty() { Ok(entries) } else { Err(problems.join("\n")) }
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Identifiers and single punctuation characters with their line numbers;
/// comments are skipped.
fn tokenize(source: &str) -> Vec<(String, usize)> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
                i += 2;
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push((chars[start..i].iter().collect(), line));
            }
            c => {
                tokens.push((c.to_string(), line));
                i += 1;
            }
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::VECTOR_ADD_SRC;

    #[test]
    fn check_source_finds_entry_points() {
        let src = "__kernel void first(int n) {}\nkernel void second(__global float* a) { }";
        assert_eq!(check_source(src).unwrap(), vec!["first", "second"]);
        assert_eq!(check_source(VECTOR_ADD_SRC).unwrap(), vec!["vector_add"]);
    }

    #[test]
    fn check_source_ignores_comments() {
        let src = "// __kernel void fake(\n/* { */ __kernel void real(int n) {}";
        assert_eq!(check_source(src).unwrap(), vec!["real"]);
    }

    #[test]
    fn check_source_reports_problems() {
        let log = check_source("__kernel void k(int n) {").unwrap_err();
        assert!(log.contains("unclosed"), "{log}");

        let log = check_source("__kernel void k(int n) {}}").unwrap_err();
        assert!(log.contains("line 1: unbalanced '}'"), "{log}");

        let log = check_source("__kernel int k(int n) { return 0; }").unwrap_err();
        assert!(log.contains("must return void"), "{log}");

        let log = check_source("void helper() {}").unwrap_err();
        assert!(log.contains("no __kernel"), "{log}");
    }

    #[test]
    fn stats_track_live_handles() {
        let mut stats = HostStats::default();
        stats.on_create(Resource::Buffer);
        stats.on_create(Resource::Buffer);
        stats.on_release(Resource::Buffer);
        assert_eq!(stats.created(Resource::Buffer), 2);
        assert_eq!(stats.live(Resource::Buffer), 1);
        assert_eq!(stats.live_total(), 1);
    }

    #[test]
    fn buffer_fault_counts_down() {
        let driver = HostDriver::single_cpu();
        let platform = driver.platforms().unwrap()[0];
        let device = driver.devices(platform, DeviceType::ALL).unwrap()[0];
        let ctx = driver.create_context(&ContextProperties { platform }, &[device]).unwrap();

        driver.inject(Fault::CreateBuffer { nth: 2, status: ClStatus::OutOfResources });
        let first = driver.create_buffer(&ctx, MemFlags::CopyHostPtr, 4, &[1.0]).unwrap();
        let err = driver.create_buffer(&ctx, MemFlags::CopyHostPtr, 4, &[1.0]).unwrap_err();
        assert_eq!(err.code(), ClStatus::OutOfResources);
        let third = driver.create_buffer(&ctx, MemFlags::CopyHostPtr, 4, &[2.0]).unwrap();

        assert_eq!(driver.buffer_contents(&third), Some(vec![2.0]));
        driver.release_buffer(first).unwrap();
        driver.release_buffer(third).unwrap();
        driver.release_context(ctx).unwrap();
        assert_eq!(driver.stats().live_total(), 0);
    }

    #[test]
    fn buffer_rejects_short_host_data() {
        let driver = HostDriver::single_cpu();
        let platform = driver.platforms().unwrap()[0];
        let device = driver.devices(platform, DeviceType::ALL).unwrap()[0];
        let ctx = driver.create_context(&ContextProperties { platform }, &[device]).unwrap();
        let err = driver.create_buffer(&ctx, MemFlags::CopyHostPtr, 8, &[1.0]).unwrap_err();
        assert_eq!(err.code(), ClStatus::InvalidHostPtr);
    }

    #[test]
    fn kernel_without_host_impl_cannot_run() {
        let driver = HostDriver::single_cpu();
        let platform = driver.platforms().unwrap()[0];
        let device = driver.devices(platform, DeviceType::ALL).unwrap()[0];
        let ctx = driver.create_context(&ContextProperties { platform }, &[device]).unwrap();
        let queue = driver.create_queue(&ctx, device, QueueProperties::default()).unwrap();
        let program = driver.create_program_with_source(&ctx, VECTOR_ADD_SRC).unwrap();
        driver.build_program(&program, &[device], "").unwrap();
        let kernel = driver.create_kernel(&program, "vector_add").unwrap();
        let err = driver.enqueue_nd_range(&queue, &kernel, &[1]).unwrap_err();
        assert_eq!(err.code(), ClStatus::InvalidOperation);
    }

    #[test]
    fn double_release_is_rejected() {
        let driver = HostDriver::single_cpu();
        let platform = driver.platforms().unwrap()[0];
        let device = driver.devices(platform, DeviceType::ALL).unwrap()[0];
        let ctx = driver.create_context(&ContextProperties { platform }, &[device]).unwrap();
        let alias = HostContext(ctx.0);
        driver.release_context(ctx).unwrap();
        let err = driver.release_context(alias).unwrap_err();
        assert_eq!(err.code(), ClStatus::InvalidContext);
    }
}
