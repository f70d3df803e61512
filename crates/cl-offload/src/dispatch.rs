//! Synchronous dispatch: upload, bind, run, read back, release.

use crate::context::ExecutionContext;
use crate::driver::{ComputeDriver, KernelArg, MemFlags};
use crate::error::{OffloadError, Resource, Result, Step};
use crate::loader::LoadedKernel;
use crate::observe::{EventSink, LifecycleEvent};

/// Bytes per element in every dispatch buffer (`float`).
pub const ELEMENT_SIZE: usize = std::mem::size_of::<f32>();

/// A device buffer that is released when dropped.
///
/// The explicit [`BufferGuard::release`] path reports driver failures;
/// the drop path can only log them.
pub struct BufferGuard<'d, D: ComputeDriver> {
    driver: &'d D,
    buffer: Option<D::Buffer>,
}

impl<'d, D: ComputeDriver> BufferGuard<'d, D> {
    /// Allocate `host_data.len()` floats, initialised from `host_data`.
    pub fn copy_from(
        driver: &'d D,
        ctx: &ExecutionContext<D>,
        index: usize,
        host_data: &[f32],
    ) -> Result<Self> {
        let size_bytes = host_data.len() * ELEMENT_SIZE;
        let buffer = driver
            .create_buffer(ctx.context(), MemFlags::CopyHostPtr, size_bytes, host_data)
            .map_err(|source| OffloadError::BufferAllocation { index, size_bytes, source })?;
        Ok(Self { driver, buffer: Some(buffer) })
    }

    pub fn get(&self) -> Option<&D::Buffer> {
        self.buffer.as_ref()
    }

    pub fn release(mut self) -> Result<()> {
        match self.buffer.take() {
            Some(buffer) => self
                .driver
                .release_buffer(buffer)
                .map_err(|source| OffloadError::Release { resource: Resource::Buffer, source }),
            None => Ok(()),
        }
    }
}

impl<D: ComputeDriver> Drop for BufferGuard<'_, D> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if let Err(e) = self.driver.release_buffer(buffer) {
                tracing::warn!(error = %e, "failed to release device buffer");
            }
        }
    }
}

/// Run `kernel` over `element_count` work-items and return its output.
///
/// Arguments are bound positionally as `(int n, float* in0, float* in1,
/// float* out)`. The call returns only after a blocking read of the output
/// buffer and a full queue drain. All three buffers are released on every
/// path out of this function.
pub fn dispatch<D: ComputeDriver>(
    driver: &D,
    ctx: &ExecutionContext<D>,
    kernel: &LoadedKernel<D>,
    element_count: usize,
    input0: &[f32],
    input1: &[f32],
    sink: &impl EventSink,
) -> Result<Vec<f32>> {
    let n = validate(element_count, input0, input1)?;
    sink.record(LifecycleEvent::DispatchStarted {
        kernel: kernel.name().to_string(),
        element_count,
    });

    // Copy-on-create for the output too; the kernel overwrites it.
    let mut output = vec![0.0f32; element_count];

    let buffers = [
        BufferGuard::copy_from(driver, ctx, 0, &input0[..element_count])?,
        BufferGuard::copy_from(driver, ctx, 1, &input1[..element_count])?,
        BufferGuard::copy_from(driver, ctx, 2, &output)?,
    ];

    run(driver, ctx, kernel.handle(), n, &buffers, &mut output)?;

    let mut first_err = None;
    for guard in buffers {
        match guard.release() {
            Ok(()) => sink.record(LifecycleEvent::Released { resource: Resource::Buffer }),
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }

    sink.record(LifecycleEvent::DispatchCompleted {
        kernel: kernel.name().to_string(),
        element_count,
    });
    Ok(output)
}

fn validate(element_count: usize, input0: &[f32], input1: &[f32]) -> Result<i32> {
    if input0.len() < element_count || input1.len() < element_count {
        return Err(OffloadError::InvalidInput(format!(
            "element count {element_count} exceeds input lengths ({}, {})",
            input0.len(),
            input1.len()
        )));
    }
    i32::try_from(element_count).map_err(|_| {
        OffloadError::InvalidInput(format!("element count {element_count} does not fit in an int"))
    })
}

fn run<D: ComputeDriver>(
    driver: &D,
    ctx: &ExecutionContext<D>,
    kernel: &D::Kernel,
    n: i32,
    buffers: &[BufferGuard<'_, D>; 3],
    output: &mut [f32],
) -> Result<()> {
    let mut args: Vec<KernelArg<'_, D::Buffer>> = vec![KernelArg::Int(n)];
    for guard in buffers {
        // Guards only lose their buffer through `release`, which consumes them.
        let buffer = guard.get().ok_or_else(|| {
            OffloadError::InvalidInput("device buffer released before binding".into())
        })?;
        args.push(KernelArg::Mem(buffer));
    }

    for (index, arg) in (0u32..).zip(args) {
        driver
            .set_kernel_arg(kernel, index, arg)
            .map_err(|source| OffloadError::ArgumentBinding { index, source })?;
    }

    let global_work_size = [output.len()];
    driver
        .enqueue_nd_range(ctx.queue(), kernel, &global_work_size)
        .map_err(|source| OffloadError::Dispatch { step: Step::EnqueueKernel, source })?;

    let out_buffer = buffers[2].get().ok_or_else(|| {
        OffloadError::InvalidInput("output buffer released before read-back".into())
    })?;
    driver
        .enqueue_read_buffer(ctx.queue(), out_buffer, true, 0, output)
        .map_err(|source| OffloadError::Dispatch { step: Step::ReadBuffer, source })?;

    driver
        .finish(ctx.queue())
        .map_err(|source| OffloadError::Dispatch { step: Step::Finish, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::QueueProperties;
    use crate::error::ClStatus;
    use crate::host::{Fault, HostArg, HostCall, HostDriver};
    use crate::kernels::{VECTOR_ADD, VECTOR_ADD_SRC};
    use crate::loader::load_kernel;
    use crate::observe::MemorySink;
    use crate::resolver::{DeviceSelection, resolve};

    struct Fixture {
        driver: HostDriver,
        ctx: Option<ExecutionContext<HostDriver>>,
        kernel: Option<LoadedKernel<HostDriver>>,
    }

    impl Fixture {
        fn new() -> Self {
            let driver = HostDriver::single_cpu().with_host_kernel(VECTOR_ADD, |a, b| a + b);
            let sink = MemorySink::new();
            let r = resolve(&driver, DeviceSelection::default(), &sink).unwrap();
            let ctx =
                ExecutionContext::initialize(&driver, &r, QueueProperties::default(), &sink)
                    .unwrap();
            let kernel = load_kernel(&driver, &ctx, VECTOR_ADD, VECTOR_ADD_SRC, "", &sink).unwrap();
            Self { driver, ctx: Some(ctx), kernel: Some(kernel) }
        }

        fn run(&self, n: usize, a: &[f32], b: &[f32]) -> Result<Vec<f32>> {
            dispatch(
                &self.driver,
                self.ctx.as_ref().unwrap(),
                self.kernel.as_ref().unwrap(),
                n,
                a,
                b,
                &MemorySink::new(),
            )
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            if let Some(k) = self.kernel.take() {
                let _ = k.release(&self.driver);
            }
            if let Some(c) = self.ctx.take() {
                let _ = c.shutdown(&self.driver, &MemorySink::new());
            }
        }
    }

    #[test]
    fn sums_elementwise() {
        let fx = Fixture::new();
        let out = fx.run(3, &[1.0, 2.0, 3.0], &[10.0, 20.0, 30.0]).unwrap();
        assert_eq!(out, vec![11.0, 22.0, 33.0]);
    }

    #[test]
    fn uses_only_the_first_n_elements() {
        let fx = Fixture::new();
        let out = fx.run(2, &[1.0, 2.0, 3.0], &[1.0, 1.0, 1.0, 1.0]).unwrap();
        assert_eq!(out, vec![2.0, 3.0]);
    }

    #[test]
    fn zero_elements_still_allocates_and_releases() {
        let fx = Fixture::new();
        let out = fx.run(0, &[], &[]).unwrap();
        assert!(out.is_empty());
        assert_eq!(fx.driver.stats().created(Resource::Buffer), 3);
        assert_eq!(fx.driver.stats().live(Resource::Buffer), 0);
    }

    #[test]
    fn short_input_rejected_before_any_driver_call() {
        let fx = Fixture::new();
        let err = fx.run(3, &[1.0], &[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, OffloadError::InvalidInput(_)));
        assert_eq!(fx.driver.stats().created(Resource::Buffer), 0);
    }

    #[test]
    fn binds_count_then_three_buffers() {
        let fx = Fixture::new();
        fx.driver.clear_calls();
        fx.run(2, &[1.0, 2.0], &[3.0, 4.0]).unwrap();

        let created: Vec<u64> = fx
            .driver
            .calls()
            .iter()
            .filter_map(|c| match c {
                HostCall::CreateBuffer { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        let bound: Vec<(u32, HostArg)> = fx
            .driver
            .calls()
            .iter()
            .filter_map(|c| match c {
                HostCall::SetKernelArg { index, arg, .. } => Some((*index, *arg)),
                _ => None,
            })
            .collect();
        assert_eq!(
            bound,
            vec![
                (0, HostArg::Int(2)),
                (1, HostArg::Buffer(created[0])),
                (2, HostArg::Buffer(created[1])),
                (3, HostArg::Buffer(created[2])),
            ]
        );
    }

    #[test]
    fn protocol_order_is_bind_enqueue_read_finish_release() {
        let fx = Fixture::new();
        fx.driver.clear_calls();
        fx.run(1, &[1.0], &[2.0]).unwrap();
        let kinds: Vec<&'static str> = fx.driver.calls().iter().map(HostCall::kind).collect();
        assert_eq!(
            kinds,
            vec![
                "create-buffer",
                "create-buffer",
                "create-buffer",
                "set-kernel-arg",
                "set-kernel-arg",
                "set-kernel-arg",
                "set-kernel-arg",
                "enqueue-nd-range",
                "read-buffer",
                "finish",
                "release-buffer",
                "release-buffer",
                "release-buffer",
            ]
        );
        let read_blocking = fx.driver.calls().iter().any(|c| {
            matches!(c, HostCall::ReadBuffer { blocking: true, len: 1, .. })
        });
        assert!(read_blocking);
        let one_dim = fx.driver.calls().iter().any(|c| {
            matches!(
                c,
                HostCall::EnqueueNdRange { global_work_size, .. } if global_work_size == &vec![1]
            )
        });
        assert!(one_dim);
    }

    #[test]
    fn third_allocation_failure_releases_first_two() {
        let fx = Fixture::new();
        fx.driver.inject(Fault::CreateBuffer {
            nth: 3,
            status: ClStatus::MemObjectAllocationFailure,
        });
        let err = fx.run(4, &[0.0; 4], &[0.0; 4]).unwrap_err();
        match err {
            OffloadError::BufferAllocation { index, size_bytes, .. } => {
                assert_eq!(index, 2);
                assert_eq!(size_bytes, 16);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.driver.stats().created(Resource::Buffer), 2);
        assert_eq!(fx.driver.stats().released(Resource::Buffer), 2);
    }

    #[test]
    fn bind_failure_releases_all_buffers() {
        let fx = Fixture::new();
        fx.driver.inject(Fault::SetKernelArg { index: 2, status: ClStatus::InvalidArgSize });
        let err = fx.run(2, &[1.0, 2.0], &[3.0, 4.0]).unwrap_err();
        assert!(matches!(err, OffloadError::ArgumentBinding { index: 2, .. }));
        assert_eq!(fx.driver.stats().live(Resource::Buffer), 0);
        assert_eq!(fx.driver.stats().released(Resource::Buffer), 3);
    }

    #[test]
    fn enqueue_and_finish_failures_are_dispatch_errors() {
        let fx = Fixture::new();
        fx.driver.inject(Fault::EnqueueKernel(ClStatus::OutOfResources));
        let err = fx.run(1, &[1.0], &[1.0]).unwrap_err();
        assert!(matches!(err, OffloadError::Dispatch { step: Step::EnqueueKernel, .. }));

        fx.driver.inject(Fault::Finish(ClStatus::OutOfResources));
        let err = fx.run(1, &[1.0], &[1.0]).unwrap_err();
        assert_eq!(err.step(), Step::Finish);
        assert_eq!(fx.driver.stats().live(Resource::Buffer), 0);

        // The instance keeps working once the cause is gone.
        assert_eq!(fx.run(1, &[1.0], &[1.0]).unwrap(), vec![2.0]);
    }

    #[test]
    fn read_failure_releases_all_buffers() {
        let fx = Fixture::new();
        fx.driver.inject(Fault::ReadBuffer(ClStatus::OutOfResources));
        let err = fx.run(2, &[1.0, 2.0], &[3.0, 4.0]).unwrap_err();
        assert!(matches!(err, OffloadError::Dispatch { step: Step::ReadBuffer, .. }));
        assert_eq!(err.status(), Some(ClStatus::OutOfResources as i32));
        assert_eq!(fx.driver.stats().live(Resource::Buffer), 0);
        assert_eq!(fx.driver.stats().released(Resource::Buffer), 3);
    }

    #[test]
    fn buffer_release_failure_is_reported() {
        let fx = Fixture::new();
        fx.driver.inject(Fault::Release(Resource::Buffer, ClStatus::InvalidMemObject));
        let err = fx.run(1, &[1.0], &[1.0]).unwrap_err();
        assert!(matches!(err, OffloadError::Release { resource: Resource::Buffer, .. }));
    }
}
