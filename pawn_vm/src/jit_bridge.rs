//! Glue between generated code and the runtime.
//!
//! Generated code reaches the VM only through the [`RuntimeHelpers`] table
//! built here. Each helper recovers the [`Runtime`] from the context's
//! opaque pointer, adopts the cursors the generated code spilled, does its
//! work through [`RuntimeState`](crate::state::RuntimeState), and publishes
//! the cursors back. Panics never cross the `extern "C"` boundary; they are
//! caught and reported as [`ErrorCode::Fatal`].

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

use pawn_core::{Cell, ErrorCode, RoundingMode};
use pawn_jit::{JitContext, RuntimeHelpers};
use tracing::{error, trace};

use crate::native;
use crate::runtime::Runtime;

/// The helper table every function is compiled against.
pub(crate) fn helpers() -> RuntimeHelpers {
    RuntimeHelpers {
        invoke_native: helper_invoke_native,
        compile_call: helper_compile_call,
        timeout: helper_timeout,
        generate_array: helper_generate_array,
        tracker_push: helper_tracker_push,
        tracker_pop: helper_tracker_pop,
        copy_memory: helper_copy_memory,
        fill_memory: helper_fill_memory,
        round_float: helper_round_float,
        debug_break: helper_debug_break,
    }
}

/// Compile (or look up) the function at `offset` and run it.
pub(crate) fn execute(rt: &mut Runtime, offset: u32) -> Result<Cell, ErrorCode> {
    let function = rt.compiled_function(offset)?;
    let mut ctx = rt.state.jit_context(std::ptr::null_mut());
    ctx.runtime = rt as *mut Runtime as *mut c_void;

    // SAFETY: the context covers this runtime's memory and return stack,
    // which stay allocated and unmoved for the whole call, and `runtime`
    // points at the runtime the helpers expect.
    let status = unsafe { function.invoke(&mut ctx) };

    rt.state.load_from_jit(&ctx);
    ErrorCode::check(status)?;
    Ok(ctx.pri)
}

/// Run `f` against the runtime behind `ctx` with cursors synchronized.
///
/// # Safety
///
/// `ctx` must be the live context of a call started by [`execute`].
unsafe fn with_runtime<F>(ctx: *mut JitContext, f: F) -> i32
where
    F: FnOnce(&mut Runtime, &mut JitContext) -> Result<(), ErrorCode>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: upheld by the caller; generated code is suspended in the
        // helper call, so nothing else touches the context or the runtime.
        let ctx = unsafe { &mut *ctx };
        let rt = unsafe { &mut *(ctx.runtime as *mut Runtime) };
        rt.state.load_from_jit(ctx);
        let result = f(rt, ctx);
        rt.state.store_to_jit(ctx);
        result
    }));
    match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(code)) => code.as_i32(),
        Err(_) => {
            error!("panic inside a runtime helper");
            ErrorCode::Fatal.as_i32()
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

unsafe extern "C" fn helper_invoke_native(ctx: *mut JitContext, index: i32) -> i32 {
    unsafe {
        with_runtime(ctx, |rt, ctx| {
            ctx.pri = native::invoke_native(rt, index as u32)?;
            Ok(())
        })
    }
}

/// Reached through a call thunk the first time a call site executes.
///
/// Points the site's slot at the callee, so later calls bypass this
/// helper, and runs the callee on the caller's context.
unsafe extern "C" fn helper_compile_call(
    ctx: *mut JitContext,
    target: u32,
    slot: *const AtomicUsize,
) -> i32 {
    let compiled = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: as in `with_runtime`; the borrow ends before the callee runs.
        let rt = unsafe { &mut *((*ctx).runtime as *mut Runtime) };
        rt.compiled_function(target)
    }));
    let function = match compiled {
        Ok(Ok(function)) => function,
        Ok(Err(code)) => return code.as_i32(),
        Err(_) => {
            error!(target, "panic while compiling a call target");
            return ErrorCode::Fatal.as_i32();
        }
    };

    // SAFETY: the slot belongs to the caller, which the runtime keeps alive
    // together with the callee.
    if let Some(slot) = unsafe { slot.as_ref() } {
        slot.store(function.entry_address(), Ordering::Release);
    }
    trace!(target, entry = function.entry_address(), "call site bound");

    // SAFETY: the caller spilled its cursors into `ctx` before the call.
    unsafe { function.invoke(&mut *ctx) }
}

/// Reached from a patched loop edge.
unsafe extern "C" fn helper_timeout(ctx: *mut JitContext) -> i32 {
    unsafe {
        with_runtime(ctx, |rt, _| {
            if rt.env().acknowledge_timeout() {
                Err(ErrorCode::Timeout)
            } else {
                Ok(())
            }
        })
    }
}

unsafe extern "C" fn helper_generate_array(ctx: *mut JitContext, dims: i32, autozero: i32) -> i32 {
    unsafe { with_runtime(ctx, |rt, _| rt.state.generate_array(dims, autozero != 0)) }
}

unsafe extern "C" fn helper_tracker_push(ctx: *mut JitContext, bytes: i32) -> i32 {
    unsafe {
        with_runtime(ctx, |rt, _| {
            rt.state.tracker_push(bytes as u32);
            Ok(())
        })
    }
}

unsafe extern "C" fn helper_tracker_pop(ctx: *mut JitContext) -> i32 {
    unsafe { with_runtime(ctx, |rt, _| rt.state.tracker_pop_set_heap()) }
}

unsafe extern "C" fn helper_copy_memory(ctx: *mut JitContext, bytes: i32) -> i32 {
    unsafe {
        with_runtime(ctx, |rt, ctx| {
            rt.state
                .copy_memory(ctx.pri as u32, ctx.alt as u32, bytes as u32)
        })
    }
}

unsafe extern "C" fn helper_fill_memory(ctx: *mut JitContext, bytes: i32) -> i32 {
    unsafe {
        with_runtime(ctx, |rt, ctx| {
            rt.state.fill_memory(ctx.alt as u32, bytes as u32, ctx.pri)
        })
    }
}

unsafe extern "C" fn helper_round_float(ctx: *mut JitContext, mode: i32) -> i32 {
    unsafe {
        with_runtime(ctx, |rt, ctx| {
            let mode = RoundingMode::from_i32(mode).ok_or(ErrorCode::InstructionParam)?;
            ctx.pri = rt.state.round_float(mode)?;
            Ok(())
        })
    }
}

unsafe extern "C" fn helper_debug_break(ctx: *mut JitContext) -> i32 {
    unsafe {
        with_runtime(ctx, |rt, _| {
            let cip = rt.state.cip();
            rt.state.record_break(cip);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineConfig, Environment};
    use pawn_core::{ImageBuilder, Opcode};

    fn jit_env() -> Option<std::sync::Arc<Environment>> {
        pawn_jit::is_supported().then(|| Environment::new(EngineConfig::for_testing()))
    }

    #[test]
    fn test_helper_table_is_complete() {
        let table = helpers();
        assert_ne!(table.invoke_native as usize, table.timeout as usize);
        assert_ne!(table.copy_memory as usize, table.fill_memory as usize);
    }

    #[test]
    fn test_jit_executes_and_caches() {
        let Some(env) = jit_env() else { return };
        let mut b = ImageBuilder::new("jit");
        b.public("main");
        b.begin_function("main");
        b.op1(Opcode::ConstPri, 5);
        b.op1(Opcode::ConstAlt, 7);
        b.op(Opcode::Add);
        b.op(Opcode::Retn);
        let mut rt = env.load_image(b.build().unwrap()).unwrap();
        let main = rt.public_offset("main").unwrap();
        assert_eq!(rt.invoke(main, &[]).unwrap(), 12);
        assert_eq!(rt.invoke(main, &[]).unwrap(), 12);
        assert_eq!(env.code_stats().functions_compiled, 1);
    }

    #[test]
    fn test_lazy_call_compiles_callee_once() {
        let Some(env) = jit_env() else { return };
        let mut b = ImageBuilder::new("calls");
        let callee = b.new_label();
        b.public("main");
        b.begin_function("main");
        b.op1(Opcode::PushC, 0);
        b.call(callee);
        b.op1(Opcode::PushC, 0);
        b.call(callee);
        b.op(Opcode::Add);
        b.op(Opcode::Retn);
        b.bind(callee);
        b.begin_function("three");
        b.op1(Opcode::ConstPri, 3);
        b.op(Opcode::Retn);
        let mut rt = env.load_image(b.build().unwrap()).unwrap();
        let main = rt.public_offset("main").unwrap();
        // PRI comes from the second call, ALT is still zero.
        assert_eq!(rt.invoke(main, &[]).unwrap(), 3);
        assert_eq!(env.code_stats().functions_compiled, 2);
    }
}
