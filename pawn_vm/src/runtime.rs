//! A loaded script instance.
//!
//! A [`Runtime`] pairs an immutable [`Image`] with its own guest memory,
//! native bindings and compiled code. Every entry into script code goes
//! through [`Runtime::invoke`], which checks the call can start, runs the
//! chosen executor, verifies the script left the stack, heap and return
//! stack where it found them, and always restores the cursors afterwards.

use std::fmt;
use std::sync::Arc;

use pawn_core::{Cell, ErrorCode, Image, PawnError, PawnResult, MAX_EXEC_PARAMS, STACK_MARGIN};
use pawn_jit::tier1::decode_function;
use pawn_jit::CompiledFunction;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::backtrace::{Backtrace, ErrorReport};
use crate::environment::Environment;
use crate::executor::Executor;
use crate::function::Function;
use crate::native::{BindError, NativeFlags, NativeFn, NativeTable};
use crate::state::{Cursors, RuntimeState};

/// One script instance.
pub struct Runtime {
    id: u64,
    env: Arc<Environment>,
    image: Arc<Image>,
    executor: Executor,
    pub(crate) state: RuntimeState,
    pub(crate) natives: NativeTable,
    compiled: FxHashMap<u32, Arc<CompiledFunction>>,
    /// Function offsets the interpreter has already checked.
    verified: FxHashSet<u32>,
    paused: bool,
    /// Nested invocations currently running on this runtime.
    depth: u32,
    error_message: Option<String>,
}

impl Runtime {
    pub(crate) fn new(env: Arc<Environment>, image: Arc<Image>) -> PawnResult<Self> {
        let state = RuntimeState::new(image.data(), image.heap_size())?;
        let natives = NativeTable::new(&image);
        let id = env.next_runtime_id();
        let executor = Executor::select(env.is_jit_enabled());
        env.registry().register(id);
        debug!(
            id,
            image = image.name(),
            memory = state.mem_size(),
            jitted = executor.is_jitted(),
            "runtime created"
        );
        Ok(Runtime {
            id,
            env,
            image,
            executor,
            state,
            natives,
            compiled: FxHashMap::default(),
            verified: FxHashSet::default(),
            paused: false,
            depth: 0,
            error_message: None,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Identifier unique within the environment.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        self.image.name()
    }

    #[inline]
    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    #[inline]
    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn executor(&self) -> Executor {
        self.executor
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut RuntimeState {
        &mut self.state
    }

    pub fn natives(&self) -> &NativeTable {
        &self.natives
    }

    pub(crate) fn debug_breaks(&self) -> bool {
        self.env.config().debug_breaks
    }

    /// Whether script code of this runtime is on the call stack.
    pub fn is_running(&self) -> bool {
        self.depth > 0
    }

    // =========================================================================
    // Symbols
    // =========================================================================

    /// Handle to the public function named `name`.
    pub fn find_function(&mut self, name: &str) -> Option<Function<'_>> {
        let id = self.image.find_public(name)?;
        self.function_by_id(id)
    }

    /// Handle to the public function with index `id`.
    pub fn function_by_id(&mut self, id: u32) -> Option<Function<'_>> {
        let public = self.image.publics().get(id as usize)?;
        let (name, offset) = (public.name.clone(), public.code_offset);
        Some(Function::new(self, id, name, offset))
    }

    /// Code offset of the public function named `name`.
    pub fn public_offset(&self, name: &str) -> Option<u32> {
        let id = self.image.find_public(name)?;
        self.image
            .publics()
            .get(id as usize)
            .map(|p| p.code_offset)
    }

    /// Address of the public variable named `name`.
    pub fn find_pubvar(&self, name: &str) -> Option<u32> {
        let id = self.image.find_pubvar(name)?;
        self.image.pubvars().get(id as usize).map(|v| v.address)
    }

    // =========================================================================
    // Natives
    // =========================================================================

    /// Replace the binding of native `index`; `None` unbinds it.
    pub fn update_native_binding(
        &mut self,
        index: u32,
        func: Option<NativeFn>,
        flags: NativeFlags,
        user_data: usize,
    ) -> Result<(), BindError> {
        self.natives.bind(index, func, flags, user_data)
    }

    /// Bind the native named `name`.
    pub fn bind_native<F>(&mut self, name: &str, func: F) -> Result<(), BindError>
    where
        F: Fn(&mut Runtime, &[Cell]) -> Cell + Send + Sync + 'static,
    {
        let index = self
            .natives
            .find(name)
            .ok_or_else(|| BindError::NotFound(name.to_string()))?;
        self.natives
            .bind(index, Some(Arc::new(func)), NativeFlags::empty(), 0)
    }

    /// Fail the running native call with `code` once the native returns.
    ///
    /// Returns a placeholder the native can hand back as its result. The
    /// first error thrown during one native call wins.
    pub fn throw_native_error(&mut self, code: ErrorCode, message: impl Into<String>) -> Cell {
        self.state.set_native_fault(code, message);
        0
    }

    pub(crate) fn set_error_message(&mut self, message: String) {
        self.error_message = Some(message);
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// A paused runtime refuses new invocations with `NotRunnable`.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    // =========================================================================
    // Memory
    // =========================================================================

    pub fn read_cell(&self, addr: u32) -> Result<Cell, ErrorCode> {
        self.state.read_cell(addr)
    }

    pub fn write_cell(&mut self, addr: u32, value: Cell) -> Result<(), ErrorCode> {
        self.state.write_cell(addr, value)
    }

    pub fn read_string(&self, addr: u32) -> Result<String, ErrorCode> {
        self.state.read_string(addr)
    }

    /// Write `text` at `addr`, truncated to `max_bytes` with the terminator.
    /// Returns the bytes written, excluding the terminator.
    pub fn write_string(&mut self, addr: u32, text: &str, max_bytes: u32) -> Result<u32, ErrorCode> {
        self.state.write_string(addr, text, max_bytes)
    }

    /// The `len` bytes of guest memory at `addr`, if all of them are valid.
    pub fn local_to_phys(&mut self, addr: u32, len: u32) -> Result<&mut [u8], ErrorCode> {
        self.state.bytes_mut(addr, len)
    }

    pub fn heap_alloc(&mut self, cells: u32) -> Result<u32, ErrorCode> {
        self.state.heap_alloc(cells)
    }

    pub fn heap_pop(&mut self, addr: u32) -> Result<(), ErrorCode> {
        self.state.heap_pop(addr)
    }

    pub fn heap_release(&mut self, addr: u32) -> Result<(), ErrorCode> {
        self.state.heap_release(addr)
    }

    // =========================================================================
    // Invocation
    // =========================================================================

    /// Run the function whose `PROC` is at `offset` with `params` and
    /// return its result.
    ///
    /// Failures are logged, reported to the environment's error listener,
    /// and leave the cursors exactly as they were before the call.
    pub fn invoke(&mut self, offset: u32, params: &[Cell]) -> PawnResult<Cell> {
        match self.check_runnable(params.len()) {
            Ok(()) => {}
            Err(code) => return Err(self.fail(code, Backtrace::default())),
        }
        if self.depth == 0 {
            self.state.take_native_fault();
            self.error_message = None;
        }

        let saved = self.state.save_cursors();
        for &param in params.iter().rev() {
            self.state.push_unchecked(param);
        }
        self.state.push_unchecked(params.len() as Cell);
        self.state.cip = offset;

        self.depth += 1;
        let result = {
            let _scope = self.env.enter_invoke();
            let executor = self.executor;
            executor.run(self, offset)
        };
        self.depth -= 1;

        let outcome = match result {
            Ok(value) => self
                .check_leaks(&saved)
                .map(|()| value)
                .map_err(|code| (code, Backtrace::default())),
            Err(code) => Err((code, self.capture_backtrace(&saved))),
        };
        self.state.restore_cursors(saved);

        outcome.map_err(|(code, backtrace)| self.fail(code, backtrace))
    }

    /// Conditions checked before any argument is pushed.
    fn check_runnable(&mut self, argc: usize) -> Result<(), ErrorCode> {
        if argc > MAX_EXEC_PARAMS {
            return Err(ErrorCode::ParamsMax);
        }
        if self.env.timeout_pending() {
            // A timeout outstanding between calls is stale; during a call it
            // aborts everything still running.
            if self.env.is_running() {
                return Err(ErrorCode::Timeout);
            }
            self.env.acknowledge_timeout();
        }
        if self.paused {
            return Err(ErrorCode::NotRunnable);
        }
        self.state
            .check_stack_space(4 * (argc as u32 + 1) + STACK_MARGIN)
    }

    fn check_leaks(&mut self, saved: &Cursors) -> Result<(), ErrorCode> {
        let (sp, hp, rp) = (self.state.sp(), self.state.hp(), self.state.rp());
        if sp != saved.sp {
            self.set_error_message(format!(
                "stack pointer is {sp:#x} after the call, expected {:#x}",
                saved.sp
            ));
            return Err(ErrorCode::StackLeak);
        }
        if hp != saved.hp {
            self.set_error_message(format!(
                "heap pointer is {hp:#x} after the call, expected {:#x}",
                saved.hp
            ));
            return Err(ErrorCode::HeapLeak);
        }
        if rp != saved.rp {
            self.set_error_message(format!(
                "return stack depth is {rp} after the call, expected {}",
                saved.rp
            ));
            return Err(ErrorCode::StackLeak);
        }
        Ok(())
    }

    /// Frames of the failed call: the faulting instruction, then each call
    /// site pushed since the call began, innermost first.
    fn capture_backtrace(&self, saved: &Cursors) -> Backtrace {
        let sites = self.state.call_sites();
        let from = (saved.rp as usize).min(sites.len());
        let cips = std::iter::once(self.state.cip()).chain(sites[from..].iter().rev().copied());
        Backtrace::resolve(&self.image, cips)
    }

    fn fail(&mut self, code: ErrorCode, backtrace: Backtrace) -> PawnError {
        let message = self
            .error_message
            .take()
            .unwrap_or_else(|| code.message().to_string());
        warn!(runtime = self.name(), code = code.as_i32(), %message, "script error");
        let report = ErrorReport {
            runtime: self.name().to_string(),
            code,
            message: message.clone(),
            backtrace,
        };
        self.env.report_error(&report);
        PawnError::Vm { code, message }
    }

    /// The compiled code for the function at `offset`, compiling it on
    /// first use.
    pub(crate) fn compiled_function(&mut self, offset: u32) -> Result<Arc<CompiledFunction>, ErrorCode> {
        if let Some(function) = self.compiled.get(&offset) {
            return Ok(Arc::clone(function));
        }
        let function = self.env.compile_function(self.id, &self.image, offset)?;
        self.compiled.insert(offset, Arc::clone(&function));
        Ok(function)
    }

    /// Check the function at `offset` once under the rules the compiler
    /// applies, so a malformed function fails the same way in both executors.
    pub(crate) fn verify_function(&mut self, offset: u32) -> Result<(), ErrorCode> {
        if self.verified.contains(&offset) {
            return Ok(());
        }
        decode_function(&self.image, offset)?;
        self.verified.insert(offset);
        Ok(())
    }

    /// Functions compiled so far.
    pub fn compiled_functions(&self) -> usize {
        self.compiled.len()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("executor", &self.executor)
            .field("compiled", &self.compiled.len())
            .field("paused", &self.paused)
            .finish()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.env.registry().unregister(self.id);
        debug!(id = self.id, "runtime destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use pawn_core::{ImageBuilder, Opcode};

    fn env() -> Arc<Environment> {
        Environment::new(EngineConfig::interpreter_only())
    }

    fn add_image() -> Image {
        let mut b = ImageBuilder::new("add");
        let counter = b.data_cells(&[7]);
        b.pubvar("counter", counter);
        b.public("add");
        b.begin_function("add");
        b.op1(Opcode::LoadSPri, 12);
        b.op1(Opcode::LoadSAlt, 16);
        b.op(Opcode::Add);
        b.op(Opcode::Retn);
        b.end_function();
        b.build().unwrap()
    }

    #[test]
    fn test_invoke_restores_cursors() {
        let env = env();
        let mut rt = env.load_image(add_image()).unwrap();
        let before = rt.state().save_cursors();
        let add = rt.public_offset("add").unwrap();
        assert_eq!(rt.invoke(add, &[2, 40]).unwrap(), 42);
        assert_eq!(rt.state().save_cursors(), before);
    }

    #[test]
    fn test_too_many_params() {
        let env = env();
        let mut rt = env.load_image(add_image()).unwrap();
        let params = [0; MAX_EXEC_PARAMS + 1];
        let err = rt.invoke(0, &params).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ParamsMax);
    }

    #[test]
    fn test_paused_runtime_is_not_runnable() {
        let env = env();
        let mut rt = env.load_image(add_image()).unwrap();
        rt.set_paused(true);
        assert_eq!(rt.invoke(0, &[1, 2]).unwrap_err().code(), ErrorCode::NotRunnable);
        rt.set_paused(false);
        assert_eq!(rt.invoke(0, &[1, 2]).unwrap(), 3);
    }

    #[test]
    fn test_pubvars_and_memory() {
        let env = env();
        let mut rt = env.load_image(add_image()).unwrap();
        let addr = rt.find_pubvar("counter").unwrap();
        assert_eq!(rt.read_cell(addr).unwrap(), 7);
        rt.write_cell(addr, 9).unwrap();
        assert_eq!(rt.local_to_phys(addr, 4).unwrap(), &9i32.to_le_bytes());
        assert!(rt.find_pubvar("missing").is_none());
    }

    #[test]
    fn test_heap_leak_detected() {
        let env = env();
        let mut b = ImageBuilder::new("leak");
        b.public("main");
        b.begin_function("main");
        b.op1(Opcode::Heap, 16);
        b.op(Opcode::Retn);
        b.end_function();
        let mut rt = env.load_image(b.build().unwrap()).unwrap();
        let hp = rt.state().hp();
        let err = rt.invoke(0, &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::HeapLeak);
        assert_eq!(rt.state().hp(), hp);
    }

    #[test]
    fn test_backtrace_reaches_listener() {
        use parking_lot::Mutex;

        let env = env();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        env.set_error_listener(move |report: &ErrorReport| sink.lock().push(report.clone()));

        let mut b = ImageBuilder::new("nested");
        let inner = b.new_label();
        b.public("main");
        b.begin_function("outer");
        b.op1(Opcode::PushC, 0);
        let call_site = b.here();
        b.call(inner);
        b.op(Opcode::Retn);
        b.end_function();
        b.bind(inner);
        b.begin_function("inner");
        b.op1(Opcode::ConstPri, 1);
        b.op1(Opcode::ConstAlt, 0);
        let fault = b.here();
        b.op(Opcode::Sdiv);
        b.op(Opcode::Retn);
        b.end_function();

        let mut rt = env.load_image(b.build().unwrap()).unwrap();
        let err = rt.invoke(0, &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DivideByZero);
        assert_eq!(rt.state().rp(), 0);

        let reports = reports.lock();
        assert_eq!(reports.len(), 1);
        let frames = reports[0].backtrace.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].cip, fault);
        assert_eq!(frames[0].function.as_deref(), Some("inner"));
        assert_eq!(frames[1].cip, call_site);
        assert_eq!(frames[1].function.as_deref(), Some("outer"));
    }

    #[test]
    fn test_native_stack_leak() {
        let mut configs = vec![EngineConfig::interpreter_only()];
        if pawn_jit::is_supported() {
            configs.push(EngineConfig::for_testing());
        }
        for config in configs {
            let env = Environment::new(config);
            let mut b = ImageBuilder::new("leaky");
            b.native("host");
            b.public("main");
            b.begin_function("main");
            b.op1(Opcode::PushC, 21);
            b.op2(Opcode::SysreqN, 0, 1);
            b.op(Opcode::Retn);
            b.end_function();
            let mut rt = env.load_image(b.build().unwrap()).unwrap();
            rt.bind_native("host", |rt, _| {
                rt.state_mut().push(99).unwrap();
                0
            })
            .unwrap();
            let sp = rt.state().sp();
            let main = rt.public_offset("main").unwrap();
            assert_eq!(rt.invoke(main, &[]).unwrap_err().code(), ErrorCode::StackLeak);
            assert_eq!(rt.state().sp(), sp);
        }
    }

    #[test]
    fn test_bind_native_by_name() {
        let env = env();
        let mut b = ImageBuilder::new("natives");
        b.native("twice");
        let mut rt = env.load_image(b.build().unwrap()).unwrap();
        rt.bind_native("twice", |_, params| params[1] * 2).unwrap();
        assert!(rt.natives().get(0).unwrap().is_bound());
        assert_eq!(
            rt.bind_native("nope", |_, _| 0).unwrap_err(),
            BindError::NotFound("nope".into())
        );
    }
}
