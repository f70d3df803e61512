//! Session facade: resolve, initialize, load, dispatch, shut down.

use crate::config::OffloadConfig;
use crate::context::ExecutionContext;
use crate::dispatch::dispatch;
use crate::driver::ComputeDriver;
use crate::error::{OffloadError, Result};
use crate::loader::{KernelSlot, KernelSourceStore, load_kernel};
use crate::observe::{EventSink, LifecycleEvent, TracingSink};
use crate::resolver::{ResolvedDevice, resolve};

struct OpenState<D: ComputeDriver> {
    resolved: ResolvedDevice<D>,
    ctx: ExecutionContext<D>,
    slot: KernelSlot<D>,
}

/// One device, one context, one queue and at most one kernel.
///
/// Every operation takes `&mut self`, so a session runs one operation at a
/// time. After [`Session::shutdown`] every call fails with
/// [`OffloadError::SessionClosed`]. Dropping an open session shuts it down.
pub struct Session<D: ComputeDriver, S: EventSink = TracingSink> {
    driver: D,
    sink: S,
    store: Box<dyn KernelSourceStore>,
    build_options: String,
    state: Option<OpenState<D>>,
}

impl<D: ComputeDriver> Session<D> {
    /// Open a session that reports lifecycle events through `tracing`.
    pub fn open_traced(driver: D, config: &OffloadConfig) -> Result<Self> {
        Self::open(driver, config, TracingSink)
    }
}

impl<D: ComputeDriver, S: EventSink> Session<D, S> {
    /// Select the configured platform/device and create its context and
    /// queue. Kernels are looked up in `config.kernel_dir`.
    pub fn open(driver: D, config: &OffloadConfig, sink: S) -> Result<Self> {
        config.validate()?;

        let resolved = resolve(&driver, config.selection(), &sink)?;
        let ctx =
            ExecutionContext::initialize(&driver, &resolved, config.queue_properties(), &sink)?;

        tracing::info!(
            platform = %driver.platform_name(resolved.platform),
            device = %driver.device_name(resolved.device),
            profiling = ctx.profiling(),
            "offload session opened"
        );

        Ok(Self {
            driver,
            sink,
            store: Box::new(config.source_store()),
            build_options: config.build_options.clone(),
            state: Some(OpenState { resolved, ctx, slot: KernelSlot::new() }),
        })
    }

    /// Replace the store consulted by [`Session::load_kernel`].
    #[must_use]
    pub fn with_source_store(mut self, store: impl KernelSourceStore + 'static) -> Self {
        self.store = Box::new(store);
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_none()
    }

    pub fn resolved(&self) -> Option<&ResolvedDevice<D>> {
        self.state.as_ref().map(|s| &s.resolved)
    }

    /// Name of the currently loaded kernel.
    pub fn kernel_name(&self) -> Option<&str> {
        self.state.as_ref().and_then(|s| s.slot.get()).map(|k| k.name())
    }

    /// Fetch `kernel_name` from the source store and load it.
    pub fn load_kernel(&mut self, kernel_name: &str) -> Result<()> {
        if self.state.is_none() {
            return Err(OffloadError::SessionClosed);
        }
        let source = self.store.fetch(kernel_name)?;
        self.load_kernel_from_source(kernel_name, &source)
    }

    /// Build `source` and install its `kernel_name` entry point.
    ///
    /// On failure the previously loaded kernel stays installed. Once the new
    /// kernel is built it is installed; a failure releasing the old one is
    /// only logged.
    pub fn load_kernel_from_source(&mut self, kernel_name: &str, source: &str) -> Result<()> {
        let state = self.state.as_mut().ok_or(OffloadError::SessionClosed)?;
        let options = self.build_options.as_str();
        let kernel = load_kernel(&self.driver, &state.ctx, kernel_name, source, options, &self.sink)
            .inspect_err(|e| {
                tracing::warn!(kernel = kernel_name, error = %e, "kernel load failed");
            })?;
        state.slot.replace(&self.driver, kernel, &self.sink);
        Ok(())
    }

    /// Run the loaded kernel over `element_count` elements of the inputs.
    pub fn dispatch(
        &mut self,
        element_count: usize,
        input0: &[f32],
        input1: &[f32],
    ) -> Result<Vec<f32>> {
        let state = self.state.as_ref().ok_or(OffloadError::SessionClosed)?;
        let kernel = state.slot.get().ok_or(OffloadError::NoKernelLoaded)?;
        dispatch(&self.driver, &state.ctx, kernel, element_count, input0, input1, &self.sink)
    }

    /// Release the kernel, the queue and the context, in that order.
    ///
    /// Every release is attempted; the first failure is returned. The
    /// session is closed afterwards either way.
    pub fn shutdown(&mut self) -> Result<()> {
        let OpenState { mut slot, ctx, .. } = self.state.take().ok_or(OffloadError::SessionClosed)?;
        let kernel_result = slot.clear(&self.driver, &self.sink);
        let ctx_result = ctx.shutdown(&self.driver, &self.sink);
        self.sink.record(LifecycleEvent::ShutdownCompleted);
        kernel_result?;
        ctx_result
    }
}

impl<D: ComputeDriver, S: EventSink> Drop for Session<D, S> {
    fn drop(&mut self) {
        if self.state.is_some() {
            if let Err(e) = self.shutdown() {
                tracing::warn!(error = %e, "offload session shutdown on drop failed");
            }
        }
    }
}

impl<D: ComputeDriver, S: EventSink> std::fmt::Debug for Session<D, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("resolved", &self.resolved())
            .field("kernel", &self.kernel_name())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
