//! OpenCL driver via the `opencl3` crate.
//!
//! Handles are the `opencl3` wrappers, which release their native object
//! when dropped; the `release_*` methods therefore consume the wrapper.
//! OpenCL rejects zero-sized allocations and empty ranges, so zero-sized
//! buffers are padded to one element and zero-sized ranges and reads are
//! skipped.

use std::cell::RefCell;
use std::ffi::c_void;
use std::ptr;

use opencl3::command_queue::{CL_QUEUE_PROFILING_ENABLE, CommandQueue};
use opencl3::context::Context;
use opencl3::device::Device;
use opencl3::error_codes::ClError;
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, CL_MEM_COPY_HOST_PTR, CL_MEM_READ_WRITE, ClMem};
use opencl3::platform::{Platform, get_platforms};
use opencl3::program::Program;
use opencl3::types::{CL_BLOCKING, cl_context_properties, cl_device_id, cl_platform_id};
use tracing::debug;

use crate::driver::{
    ComputeDriver, ContextProperties, DeviceType, KernelArg, MemFlags, QueueProperties,
};
use crate::error::{ClStatus, DriverError, DriverResult};

/// `CL_CONTEXT_PLATFORM` context-property key.
const CL_CONTEXT_PLATFORM: cl_context_properties = 0x1084;

fn cl_err(what: &str, e: ClError) -> DriverError {
    DriverError::new(e.0, format!("{what}: {e}"))
}

/// A program object; building needs mutable access to the wrapper.
pub struct ClProgram(RefCell<Program>);

/// Driver backed by the system OpenCL ICD loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenClDriver;

impl OpenClDriver {
    pub fn new() -> Self {
        Self
    }
}

impl ComputeDriver for OpenClDriver {
    type Platform = cl_platform_id;
    type Device = cl_device_id;
    type Context = Context;
    type Queue = CommandQueue;
    type Program = ClProgram;
    type Kernel = Kernel;
    type Buffer = Buffer<f32>;

    fn platform_count(&self) -> DriverResult<usize> {
        Ok(self.platforms()?.len())
    }

    fn platforms(&self) -> DriverResult<Vec<cl_platform_id>> {
        let platforms = get_platforms().map_err(|e| cl_err("clGetPlatformIDs", e))?;
        Ok(platforms.iter().map(Platform::id).collect())
    }

    fn device_count(&self, platform: cl_platform_id, mask: DeviceType) -> DriverResult<usize> {
        Ok(self.devices(platform, mask)?.len())
    }

    fn devices(
        &self,
        platform: cl_platform_id,
        mask: DeviceType,
    ) -> DriverResult<Vec<cl_device_id>> {
        Platform::new(platform).get_devices(mask.bits()).map_err(|e| cl_err("clGetDeviceIDs", e))
    }

    fn platform_name(&self, platform: cl_platform_id) -> String {
        Platform::new(platform).name().unwrap_or_else(|_| format!("{platform:?}"))
    }

    fn device_name(&self, device: cl_device_id) -> String {
        Device::new(device).name().unwrap_or_else(|_| format!("{device:?}"))
    }

    fn create_context(
        &self,
        properties: &ContextProperties<cl_platform_id>,
        devices: &[cl_device_id],
    ) -> DriverResult<Context> {
        let props = [CL_CONTEXT_PLATFORM, properties.platform as cl_context_properties, 0];
        Context::from_devices(devices, &props, None, ptr::null_mut())
            .map_err(|e| cl_err("clCreateContext", e))
    }

    /// The context holds exactly one device, which is the queue's device.
    fn create_queue(
        &self,
        context: &Context,
        device: cl_device_id,
        properties: QueueProperties,
    ) -> DriverResult<CommandQueue> {
        debug!(device = ?device, profiling = properties.profiling, "creating command queue");
        let flags = if properties.profiling { CL_QUEUE_PROFILING_ENABLE } else { 0 };
        CommandQueue::create_default_with_properties(context, flags, 0)
            .map_err(|e| cl_err("clCreateCommandQueue", e))
    }

    fn create_program_with_source(
        &self,
        context: &Context,
        source: &str,
    ) -> DriverResult<ClProgram> {
        Program::create_from_source(context, source)
            .map(|p| ClProgram(RefCell::new(p)))
            .map_err(|e| cl_err("clCreateProgramWithSource", e))
    }

    fn build_program(
        &self,
        program: &ClProgram,
        devices: &[cl_device_id],
        options: &str,
    ) -> DriverResult<()> {
        program.0.borrow_mut().build(devices, options).map_err(|e| cl_err("clBuildProgram", e))
    }

    fn program_build_log(&self, program: &ClProgram, device: cl_device_id) -> DriverResult<String> {
        program.0.borrow().get_build_log(device).map_err(|e| cl_err("clGetProgramBuildInfo", e))
    }

    fn create_kernel(&self, program: &ClProgram, name: &str) -> DriverResult<Kernel> {
        Kernel::create(&program.0.borrow(), name).map_err(|e| cl_err("clCreateKernel", e))
    }

    fn create_buffer(
        &self,
        context: &Context,
        flags: MemFlags,
        size_bytes: usize,
        host_data: &[f32],
    ) -> DriverResult<Buffer<f32>> {
        let count = size_bytes / std::mem::size_of::<f32>();
        if host_data.len() < count {
            return Err(DriverError::from_status(
                ClStatus::InvalidHostPtr,
                format!("host data holds {} floats, need {count}", host_data.len()),
            ));
        }
        let pad = [0.0f32];
        let (count, src) = if count == 0 { (1, &pad[..]) } else { (count, host_data) };
        let cl_flags = match flags {
            MemFlags::CopyHostPtr => CL_MEM_READ_WRITE | CL_MEM_COPY_HOST_PTR,
        };
        // SAFETY: `src` holds at least `count` floats and COPY_HOST_PTR copies
        // them before `create` returns; the pointer is never written through.
        unsafe { Buffer::<f32>::create(context, cl_flags, count, src.as_ptr() as *mut c_void) }
            .map_err(|e| cl_err("clCreateBuffer", e))
    }

    fn set_kernel_arg(
        &self,
        kernel: &Kernel,
        index: u32,
        arg: KernelArg<'_, Buffer<f32>>,
    ) -> DriverResult<()> {
        // SAFETY: argument sizes match the OpenCL `int` and `__global` pointer
        // parameter types the argument layout declares.
        let result = match arg {
            KernelArg::Int(v) => unsafe { kernel.set_arg(index, &v) },
            KernelArg::Mem(buffer) => unsafe { kernel.set_arg(index, &buffer.get()) },
        };
        result.map_err(|e| cl_err("clSetKernelArg", e))
    }

    fn enqueue_nd_range(
        &self,
        queue: &CommandQueue,
        kernel: &Kernel,
        global_work_size: &[usize],
    ) -> DriverResult<()> {
        if global_work_size.iter().product::<usize>() == 0 {
            debug!("skipping empty NDRange");
            return Ok(());
        }
        // SAFETY: `global_work_size` outlives the call and its length is the
        // work dimension passed alongside it.
        unsafe {
            queue.enqueue_nd_range_kernel(
                kernel.get(),
                global_work_size.len() as u32,
                ptr::null(),
                global_work_size.as_ptr(),
                ptr::null(),
                &[],
            )
        }
        .map(drop)
        .map_err(|e| cl_err("clEnqueueNDRangeKernel", e))
    }

    fn enqueue_read_buffer(
        &self,
        queue: &CommandQueue,
        buffer: &Buffer<f32>,
        blocking: bool,
        offset: usize,
        dest: &mut [f32],
    ) -> DriverResult<()> {
        if dest.is_empty() {
            return Ok(());
        }
        if !blocking {
            return Err(DriverError::from_status(
                ClStatus::InvalidOperation,
                "non-blocking reads into borrowed host memory are not supported",
            ));
        }
        // SAFETY: the read is blocking, so `dest` is not touched after return.
        unsafe { queue.enqueue_read_buffer(buffer, CL_BLOCKING, offset, dest, &[]) }
            .map(drop)
            .map_err(|e| cl_err("clEnqueueReadBuffer", e))
    }

    fn finish(&self, queue: &CommandQueue) -> DriverResult<()> {
        queue.finish().map_err(|e| cl_err("clFinish", e))
    }

    fn release_kernel(&self, kernel: Kernel) -> DriverResult<()> {
        drop(kernel);
        Ok(())
    }

    fn release_program(&self, program: ClProgram) -> DriverResult<()> {
        drop(program);
        Ok(())
    }

    fn release_queue(&self, queue: CommandQueue) -> DriverResult<()> {
        drop(queue);
        Ok(())
    }

    fn release_context(&self, context: Context) -> DriverResult<()> {
        drop(context);
        Ok(())
    }

    fn release_buffer(&self, buffer: Buffer<f32>) -> DriverResult<()> {
        drop(buffer);
        Ok(())
    }
}
