//! Execution context: the device-bound context and its command queue.

use crate::driver::{ComputeDriver, ContextProperties, QueueProperties};
use crate::error::{OffloadError, Resource, Result};
use crate::observe::{EventSink, LifecycleEvent};
use crate::resolver::ResolvedDevice;

/// Owns a context created for exactly one device and a queue on that
/// same context/device pair.
///
/// Both handles live until [`ExecutionContext::shutdown`], which consumes
/// the value so the pair cannot be released twice.
pub struct ExecutionContext<D: ComputeDriver> {
    device: D::Device,
    context: D::Context,
    queue: D::Queue,
    profiling: bool,
}

impl<D: ComputeDriver> ExecutionContext<D> {
    /// Create the context and queue for `resolved`.
    ///
    /// If the queue cannot be created the context is released before the
    /// error is returned.
    pub fn initialize(
        driver: &D,
        resolved: &ResolvedDevice<D>,
        queue_properties: QueueProperties,
        sink: &impl EventSink,
    ) -> Result<Self> {
        let properties = ContextProperties { platform: resolved.platform };
        let context = driver
            .create_context(&properties, &[resolved.device])
            .map_err(|source| OffloadError::ContextCreation { source })?;
        sink.record(LifecycleEvent::ContextCreated);

        let queue = match driver.create_queue(&context, resolved.device, queue_properties) {
            Ok(queue) => queue,
            Err(source) => {
                if let Err(e) = driver.release_context(context) {
                    tracing::warn!(error = %e, "failed to release context after queue failure");
                } else {
                    sink.record(LifecycleEvent::Released { resource: Resource::Context });
                }
                return Err(OffloadError::QueueCreation { source });
            }
        };
        sink.record(LifecycleEvent::QueueCreated { profiling: queue_properties.profiling });

        Ok(Self { device: resolved.device, context, queue, profiling: queue_properties.profiling })
    }

    pub fn device(&self) -> D::Device {
        self.device
    }

    pub fn context(&self) -> &D::Context {
        &self.context
    }

    pub fn queue(&self) -> &D::Queue {
        &self.queue
    }

    pub fn profiling(&self) -> bool {
        self.profiling
    }

    /// Release the queue, then the context.
    ///
    /// The context is released even when the queue release fails; the
    /// first failure is returned.
    pub fn shutdown(self, driver: &D, sink: &impl EventSink) -> Result<()> {
        let Self { context, queue, .. } = self;

        let queue_result = driver.release_queue(queue);
        if queue_result.is_ok() {
            sink.record(LifecycleEvent::Released { resource: Resource::Queue });
        }
        let context_result = driver.release_context(context);
        if context_result.is_ok() {
            sink.record(LifecycleEvent::Released { resource: Resource::Context });
        }

        queue_result
            .map_err(|source| OffloadError::Release { resource: Resource::Queue, source })?;
        context_result
            .map_err(|source| OffloadError::Release { resource: Resource::Context, source })
    }
}

impl<D: ComputeDriver> std::fmt::Debug for ExecutionContext<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("device", &self.device)
            .field("profiling", &self.profiling)
            .finish_non_exhaustive()
    }
}
