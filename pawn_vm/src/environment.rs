//! The engine handle.
//!
//! An [`Environment`] owns everything runtimes share: the executable memory
//! allocator, the registry of compiled code the watchdog patches, the
//! execution monitor, the optional watchdog thread and the error listener.
//! Hosts create one with [`Environment::new`] and load runtimes from it;
//! independent environments do not interact.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pawn_core::{smx, ErrorCode, Image, ImageBuilder, PawnResult};
use pawn_jit::{CodeAllocator, CompiledFunction};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::backtrace::{ErrorListener, ErrorReport};
use crate::config::EngineConfig;
use crate::jit_bridge;
use crate::runtime::Runtime;
use crate::watchdog::{ExecutionMonitor, WatchdogPhase, WatchdogTimer};

// =============================================================================
// Code Registry
// =============================================================================

/// Every live compiled function, grouped by owning runtime.
///
/// The lock serializes patch sweeps against runtimes registering, adding
/// code and going away, so a function is never freed mid-sweep.
#[derive(Debug, Default)]
pub struct CodeRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    runtimes: FxHashMap<u64, Vec<Arc<CompiledFunction>>>,
    /// Whether loop edges are currently redirected.
    patched: bool,
    sweeps: u64,
}

impl CodeRegistry {
    pub(crate) fn register(&self, runtime: u64) {
        self.inner.lock().runtimes.entry(runtime).or_default();
    }

    /// Drop a runtime's functions. Their code is released once the runtime
    /// lets go of its own references.
    pub(crate) fn unregister(&self, runtime: u64) {
        self.inner.lock().runtimes.remove(&runtime);
    }

    /// Track a freshly compiled function; it joins an ongoing timeout
    /// already patched.
    pub(crate) fn add_function(&self, runtime: u64, function: Arc<CompiledFunction>) {
        let mut inner = self.inner.lock();
        if inner.patched {
            function.patch_loop_edges();
        }
        inner.runtimes.entry(runtime).or_default().push(function);
    }

    /// Redirect every loop edge to its timeout stub. Returns the edges written.
    pub fn patch_all(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.patched = true;
        inner.sweeps += 1;
        let edges = inner
            .runtimes
            .values()
            .flatten()
            .map(|f| f.patch_loop_edges())
            .sum();
        debug!(edges, sweep = inner.sweeps, "patched loop edges");
        edges
    }

    /// Restore every loop edge. Returns the edges written.
    pub fn unpatch_all(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.patched = false;
        let edges = inner
            .runtimes
            .values()
            .flatten()
            .map(|f| f.unpatch_loop_edges())
            .sum();
        debug!(edges, "restored loop edges");
        edges
    }

    pub fn is_patched(&self) -> bool {
        self.inner.lock().patched
    }

    /// Completed patch sweeps.
    pub fn patch_sweeps(&self) -> u64 {
        self.inner.lock().sweeps
    }

    pub fn live_runtimes(&self) -> usize {
        self.inner.lock().runtimes.len()
    }

    /// Copies of every live function's code, ordered by runtime and then by
    /// compilation.
    pub fn code_snapshot(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.lock();
        let mut ids: Vec<_> = inner.runtimes.keys().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .flat_map(|id| inner.runtimes[id].iter())
            .map(|f| f.code_bytes().to_vec())
            .collect()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Code cache and compiler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeStats {
    /// Executable bytes currently mapped.
    pub live_bytes: usize,
    /// Executable buffers currently mapped.
    pub live_buffers: usize,
    pub total_bytes: u64,
    pub total_buffers: u64,
    pub functions_compiled: u64,
    pub patch_sweeps: u64,
    pub live_runtimes: usize,
}

// =============================================================================
// Environment
// =============================================================================

/// Shared engine state for a family of runtimes.
pub struct Environment {
    config: EngineConfig,
    jit_enabled: AtomicBool,
    allocator: CodeAllocator,
    registry: Arc<CodeRegistry>,
    monitor: Arc<ExecutionMonitor>,
    watchdog: Mutex<Option<WatchdogTimer>>,
    listener: RwLock<Option<Arc<dyn ErrorListener>>>,
    next_runtime_id: AtomicU64,
    functions_compiled: AtomicU64,
}

impl Environment {
    /// Create an environment, starting the watchdog when the configuration
    /// asks for one.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let env = Arc::new(Environment {
            jit_enabled: AtomicBool::new(config.jit_enabled),
            allocator: CodeAllocator::with_limit(config.max_code_bytes),
            registry: Arc::new(CodeRegistry::default()),
            monitor: Arc::new(ExecutionMonitor::new()),
            watchdog: Mutex::new(None),
            listener: RwLock::new(None),
            next_runtime_id: AtomicU64::new(1),
            functions_compiled: AtomicU64::new(0),
            config,
        });
        if let Some(timeout) = env.config.watchdog_timeout {
            env.start_watchdog(timeout);
        }
        debug!(jit = env.is_jit_enabled(), "environment created");
        env
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Choose the executor for runtimes created from now on.
    pub fn set_jit_enabled(&self, enabled: bool) {
        self.jit_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_jit_enabled(&self) -> bool {
        self.jit_enabled.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Watchdog
    // =========================================================================

    /// Start a watchdog that aborts scripts running longer than
    /// `timeout_ms` without returning to the host.
    ///
    /// Returns `false` for a zero timeout, when a watchdog is already
    /// installed, or when the thread cannot be spawned.
    pub fn install_watchdog_timer(&self, timeout_ms: u64) -> bool {
        if timeout_ms == 0 {
            return false;
        }
        self.start_watchdog(Duration::from_millis(timeout_ms))
    }

    fn start_watchdog(&self, timeout: Duration) -> bool {
        let mut slot = self.watchdog.lock();
        if slot.is_some() {
            return false;
        }
        match WatchdogTimer::start(timeout, Arc::clone(&self.registry), Arc::clone(&self.monitor)) {
            Ok(timer) => {
                *slot = Some(timer);
                true
            }
            Err(err) => {
                warn!(%err, "failed to start the watchdog thread");
                false
            }
        }
    }

    /// Stop the watchdog thread, if any.
    pub fn shutdown_watchdog(&self) {
        let timer = self.watchdog.lock().take();
        drop(timer);
    }

    pub fn watchdog_phase(&self) -> Option<WatchdogPhase> {
        self.watchdog.lock().as_ref().map(WatchdogTimer::phase)
    }

    // =========================================================================
    // Error Reporting
    // =========================================================================

    /// Receive a report for every failed top-level or nested invocation.
    pub fn set_error_listener(&self, listener: impl ErrorListener + 'static) {
        *self.listener.write() = Some(Arc::new(listener));
    }

    pub fn clear_error_listener(&self) {
        *self.listener.write() = None;
    }

    pub(crate) fn report_error(&self, report: &ErrorReport) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_error(report);
        }
    }

    // =========================================================================
    // Runtimes
    // =========================================================================

    /// Load an SMX file and create a runtime for it.
    pub fn load_binary(self: &Arc<Self>, path: impl AsRef<Path>) -> PawnResult<Runtime> {
        let image = smx::load_file(path)?;
        self.load_image(image)
    }

    /// Create a runtime for an already validated image.
    pub fn load_image(self: &Arc<Self>, image: Image) -> PawnResult<Runtime> {
        Runtime::new(Arc::clone(self), Arc::new(image))
    }

    /// A runtime with no code, useful as scratch memory for natives.
    pub fn create_empty_runtime(self: &Arc<Self>, name: &str, heap_size: u32) -> PawnResult<Runtime> {
        let mut builder = ImageBuilder::new(name);
        builder.heap_size(heap_size);
        let image = builder.build()?;
        self.load_image(image)
    }

    pub(crate) fn next_runtime_id(&self) -> u64 {
        self.next_runtime_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn registry(&self) -> &CodeRegistry {
        &self.registry
    }

    pub fn live_runtimes(&self) -> usize {
        self.registry.live_runtimes()
    }

    // =========================================================================
    // Compiled Code
    // =========================================================================

    /// Compile the function at `offset` for runtime `runtime`.
    pub(crate) fn compile_function(
        &self,
        runtime: u64,
        image: &Image,
        offset: u32,
    ) -> Result<Arc<CompiledFunction>, ErrorCode> {
        let function = pawn_jit::compile(
            image,
            offset,
            &jit_bridge::helpers(),
            self.config.compile_options(),
            &self.allocator,
        )?;
        let function = Arc::new(function);
        self.registry.add_function(runtime, Arc::clone(&function));
        self.functions_compiled.fetch_add(1, Ordering::Relaxed);
        debug!(
            image = image.name(),
            offset,
            size = function.native_size(),
            loop_edges = function.loop_edges().len(),
            "compiled function"
        );
        Ok(function)
    }

    pub fn code_stats(&self) -> CodeStats {
        let cache = self.allocator.stats();
        CodeStats {
            live_bytes: cache.live_bytes,
            live_buffers: cache.live_buffers,
            total_bytes: cache.total_bytes,
            total_buffers: cache.total_buffers,
            functions_compiled: self.functions_compiled.load(Ordering::Relaxed),
            patch_sweeps: self.registry.patch_sweeps(),
            live_runtimes: self.registry.live_runtimes(),
        }
    }

    /// Redirect every loop edge as a timeout would.
    pub fn patch_loop_edges(&self) -> usize {
        self.registry.patch_all()
    }

    pub fn unpatch_loop_edges(&self) -> usize {
        self.registry.unpatch_all()
    }

    /// Copies of every live function's generated code, taken under the
    /// patch lock.
    pub fn compiled_code(&self) -> Vec<Vec<u8>> {
        self.registry.code_snapshot()
    }

    // =========================================================================
    // Timeouts
    // =========================================================================

    pub(crate) fn enter_invoke(self: &Arc<Self>) -> InvokeScope {
        self.monitor.enter();
        InvokeScope {
            env: Arc::clone(self),
        }
    }

    /// Whether script code is running anywhere in this environment.
    pub fn is_running(&self) -> bool {
        self.monitor.is_running()
    }

    pub(crate) fn timeout_pending(&self) -> bool {
        self.monitor.timeout_pending()
    }

    /// Interpreter loop-edge check: claim an outstanding timeout.
    #[inline]
    pub(crate) fn poll_timeout(&self) -> bool {
        self.monitor.timeout_pending() && self.acknowledge_timeout()
    }

    /// Claim an outstanding timeout, restoring patched code before returning.
    ///
    /// Exactly one caller gets `true` per declared timeout.
    pub(crate) fn acknowledge_timeout(&self) -> bool {
        if !self.monitor.timeout_pending() {
            return false;
        }
        let watchdog = self.watchdog.lock();
        match watchdog.as_ref() {
            Some(timer) => timer.acknowledge(),
            None => {
                self.monitor.set_timeout_pending(false);
                self.registry.unpatch_all();
                false
            }
        }
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.config)
            .field("jit_enabled", &self.is_jit_enabled())
            .field("live_runtimes", &self.live_runtimes())
            .field("watchdog", &self.watchdog_phase())
            .finish()
    }
}

/// Marks one invocation as running for the watchdog.
///
/// When the outermost invocation ends with a timeout still unclaimed, the
/// timeout is acknowledged so the next call starts clean.
pub(crate) struct InvokeScope {
    env: Arc<Environment>,
}

impl Drop for InvokeScope {
    fn drop(&mut self) {
        if self.env.monitor.leave() == 0 && self.env.monitor.timeout_pending() {
            self.env.acknowledge_timeout();
        }
    }
}
