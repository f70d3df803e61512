//! Kernel loading: source lookup, program build, entry-point extraction.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::context::ExecutionContext;
use crate::driver::ComputeDriver;
use crate::error::{OffloadError, Resource, Result};
use crate::observe::{EventSink, LifecycleEvent};

// ---------------------------------------------------------------------------
// Source storage
// ---------------------------------------------------------------------------

/// Resolves a logical kernel name to program source text.
pub trait KernelSourceStore {
    fn fetch(&self, kernel_name: &str) -> Result<String>;
}

/// Reads `<dir>/<kernel_name><suffix>` from disk.
#[derive(Debug, Clone)]
pub struct FileSourceStore {
    dir: PathBuf,
    suffix: String,
}

impl FileSourceStore {
    pub fn new(dir: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self { dir: dir.into(), suffix: suffix.into() }
    }

    pub fn path_for(&self, kernel_name: &str) -> PathBuf {
        self.dir.join(format!("{kernel_name}{}", self.suffix))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl KernelSourceStore for FileSourceStore {
    /// Lines are re-joined with `\n`, so CRLF files read the same as LF
    /// files and the text always ends in a newline.
    fn fetch(&self, kernel_name: &str) -> Result<String> {
        let path = self.path_for(kernel_name);
        let raw = fs::read_to_string(&path).map_err(|e| OffloadError::SourceNotFound {
            kernel: kernel_name.to_string(),
            location: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut text = String::with_capacity(raw.len() + 1);
        for line in raw.lines() {
            text.push_str(line);
            text.push('\n');
        }
        Ok(text)
    }
}

/// In-memory sources keyed by kernel name, e.g. `include_str!` embeds.
#[derive(Debug, Clone, Default)]
pub struct InlineSourceStore {
    sources: HashMap<String, String>,
}

impl InlineSourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, kernel_name: impl Into<String>, source: impl Into<String>) -> Self {
        self.insert(kernel_name, source);
        self
    }

    pub fn insert(&mut self, kernel_name: impl Into<String>, source: impl Into<String>) {
        self.sources.insert(kernel_name.into(), source.into());
    }
}

impl KernelSourceStore for InlineSourceStore {
    fn fetch(&self, kernel_name: &str) -> Result<String> {
        self.sources.get(kernel_name).cloned().ok_or_else(|| OffloadError::SourceNotFound {
            kernel: kernel_name.to_string(),
            location: "inline source store".to_string(),
            reason: "no source registered under this name".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// A kernel handle together with the entry point it was extracted from.
pub struct LoadedKernel<D: ComputeDriver> {
    name: String,
    handle: D::Kernel,
}

impl<D: ComputeDriver> LoadedKernel<D> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &D::Kernel {
        &self.handle
    }

    pub fn release(self, driver: &D) -> Result<()> {
        driver
            .release_kernel(self.handle)
            .map_err(|source| OffloadError::Release { resource: Resource::Kernel, source })
    }
}

impl<D: ComputeDriver> std::fmt::Debug for LoadedKernel<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedKernel").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Compile `source` in `ctx` and extract the entry point `kernel_name`.
///
/// The program object only exists for the duration of this call: it is
/// released whether the build, the extraction, or neither fails.
pub fn load_kernel<D: ComputeDriver>(
    driver: &D,
    ctx: &ExecutionContext<D>,
    kernel_name: &str,
    source: &str,
    build_options: &str,
    sink: &impl EventSink,
) -> Result<LoadedKernel<D>> {
    let program = driver.create_program_with_source(ctx.context(), source).map_err(|e| {
        OffloadError::Compilation {
            kernel: kernel_name.to_string(),
            status: e.status,
            log: e.message,
        }
    })?;

    let extracted = build_and_extract(driver, ctx, &program, kernel_name, build_options, sink);

    match driver.release_program(program) {
        Ok(()) => sink.record(LifecycleEvent::Released { resource: Resource::Program }),
        Err(e) => tracing::warn!(kernel = kernel_name, error = %e, "failed to release program"),
    }

    let handle = extracted?;
    Ok(LoadedKernel { name: kernel_name.to_string(), handle })
}

fn build_and_extract<D: ComputeDriver>(
    driver: &D,
    ctx: &ExecutionContext<D>,
    program: &D::Program,
    kernel_name: &str,
    build_options: &str,
    sink: &impl EventSink,
) -> Result<D::Kernel> {
    if let Err(e) = driver.build_program(program, &[ctx.device()], build_options) {
        let log = driver
            .program_build_log(program, ctx.device())
            .unwrap_or_else(|log_err| format!("<build log unavailable: {log_err}>"));
        return Err(OffloadError::Compilation {
            kernel: kernel_name.to_string(),
            status: e.status,
            log,
        });
    }
    sink.record(LifecycleEvent::ProgramBuilt { kernel: kernel_name.to_string() });

    driver.create_kernel(program, kernel_name).map_err(|source| {
        OffloadError::EntryPointNotFound { kernel: kernel_name.to_string(), source }
    })
}

// ---------------------------------------------------------------------------
// KernelSlot
// ---------------------------------------------------------------------------

/// Holds at most one kernel.
///
/// [`KernelSlot::replace`] releases the previous kernel as part of
/// installing the new one; a failed load never reaches the slot, so the
/// previous kernel stays usable.
pub struct KernelSlot<D: ComputeDriver> {
    current: Option<LoadedKernel<D>>,
}

impl<D: ComputeDriver> Default for KernelSlot<D> {
    fn default() -> Self {
        Self { current: None }
    }
}

impl<D: ComputeDriver> KernelSlot<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<&LoadedKernel<D>> {
        self.current.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    /// Install `kernel`, releasing whatever was there before.
    ///
    /// A failed release of the old kernel is logged and does not undo the
    /// install: the new kernel is already valid.
    pub fn replace(&mut self, driver: &D, kernel: LoadedKernel<D>, sink: &impl EventSink) {
        let new_name = kernel.name.clone();
        let previous = self.current.replace(kernel);
        sink.record(LifecycleEvent::KernelLoaded { kernel: new_name.clone() });
        let Some(previous) = previous else {
            return;
        };
        let previous_name = previous.name.clone();
        match previous.release(driver) {
            Ok(()) => sink.record(LifecycleEvent::Released { resource: Resource::Kernel }),
            Err(e) => tracing::warn!(
                kernel = %previous_name,
                error = %e,
                "failed to release replaced kernel"
            ),
        }
        sink.record(LifecycleEvent::KernelReplaced { previous: previous_name, kernel: new_name });
    }

    /// Release the held kernel, if any, leaving the slot empty.
    pub fn clear(&mut self, driver: &D, sink: &impl EventSink) -> Result<()> {
        if let Some(kernel) = self.current.take() {
            kernel.release(driver)?;
            sink.record(LifecycleEvent::Released { resource: Resource::Kernel });
        }
        Ok(())
    }
}
