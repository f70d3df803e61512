//! Lifecycle observability.
//!
//! The host layer reports what it does through an [`EventSink`] handed to
//! it by the caller instead of logging to process-wide state. The default
//! [`TracingSink`] forwards every event to `tracing`; [`MemorySink`] keeps
//! them for inspection.

use std::cell::RefCell;

use tracing::{debug, info};

use crate::error::Resource;

/// Something the host layer did to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    PlatformsEnumerated { count: usize },
    PlatformSelected { index: usize, name: String },
    DevicesEnumerated { count: usize, device_type: String },
    DeviceSelected { index: usize, name: String },
    ContextCreated,
    QueueCreated { profiling: bool },
    ProgramBuilt { kernel: String },
    KernelLoaded { kernel: String },
    KernelReplaced { previous: String, kernel: String },
    DispatchStarted { kernel: String, element_count: usize },
    DispatchCompleted { kernel: String, element_count: usize },
    Released { resource: Resource },
    ShutdownCompleted,
}

/// Receives lifecycle events.
pub trait EventSink {
    fn record(&self, event: LifecycleEvent);
}

impl<S: EventSink + ?Sized> EventSink for &S {
    fn record(&self, event: LifecycleEvent) {
        (**self).record(event);
    }
}

/// Forwards events to `tracing` with structured fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::PlatformsEnumerated { count } => {
                debug!(count, "enumerated OpenCL platforms");
            }
            LifecycleEvent::PlatformSelected { index, name } => {
                info!(index, platform = %name, "selected platform");
            }
            LifecycleEvent::DevicesEnumerated { count, device_type } => {
                debug!(count, device_type = %device_type, "enumerated devices");
            }
            LifecycleEvent::DeviceSelected { index, name } => {
                info!(index, device = %name, "selected device");
            }
            LifecycleEvent::ContextCreated => debug!("context created"),
            LifecycleEvent::QueueCreated { profiling } => {
                debug!(profiling, "command queue created");
            }
            LifecycleEvent::ProgramBuilt { kernel } => debug!(kernel = %kernel, "program built"),
            LifecycleEvent::KernelLoaded { kernel } => info!(kernel = %kernel, "kernel loaded"),
            LifecycleEvent::KernelReplaced { previous, kernel } => {
                info!(previous = %previous, kernel = %kernel, "kernel replaced");
            }
            LifecycleEvent::DispatchStarted { kernel, element_count } => {
                debug!(kernel = %kernel, element_count, "dispatch started");
            }
            LifecycleEvent::DispatchCompleted { kernel, element_count } => {
                debug!(kernel = %kernel, element_count, "dispatch completed");
            }
            LifecycleEvent::Released { resource } => debug!(%resource, "released"),
            LifecycleEvent::ShutdownCompleted => info!("OpenCL resources released"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: RefCell<Vec<LifecycleEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events, oldest first.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.borrow().clone()
    }

    pub fn count(&self, pred: impl Fn(&LifecycleEvent) -> bool) -> usize {
        self.events.borrow().iter().filter(|e| pred(e)).count()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: LifecycleEvent) {
        self.events.borrow_mut().push(event);
    }
}
