//! End-to-end invocation scenarios, run under every available executor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pawn_core::{Cell, ErrorCode, Image, ImageBuilder, Opcode};
use pawn_vm::{EngineConfig, Environment, ErrorReport, Runtime};

// =============================================================================
// Helpers
// =============================================================================

/// Every configuration the host can run: the interpreter, plus the JIT
/// when this target executes generated code.
fn configs() -> Vec<EngineConfig> {
    let mut configs = vec![EngineConfig::interpreter_only()];
    if pawn_jit::is_supported() {
        configs.push(EngineConfig::for_testing());
        configs.push(EngineConfig::default());
    }
    configs
}

/// An image with a single public `main` built by `body`.
fn single(body: impl FnOnce(&mut ImageBuilder)) -> Image {
    let mut b = ImageBuilder::new("scenario");
    b.public("main");
    b.begin_function("main");
    body(&mut b);
    b.end_function();
    b.build().unwrap()
}

fn call_main(rt: &mut Runtime, params: &[Cell]) -> Result<Cell, ErrorCode> {
    let mut f = rt.find_function("main").unwrap();
    f.push_cells(params).unwrap();
    f.execute().map_err(|e| e.code())
}

fn for_each_executor(image: impl Fn() -> Image, check: impl Fn(&mut Runtime)) {
    for config in configs() {
        let env = Environment::new(config);
        let mut rt = env.load_image(image()).unwrap();
        check(&mut rt);
    }
}

// =============================================================================
// Arithmetic
// =============================================================================

#[test]
fn test_add_constants() {
    for_each_executor(
        || {
            single(|b| {
                b.op1(Opcode::ConstPri, 5);
                b.op1(Opcode::ConstAlt, 7);
                b.op(Opcode::Add);
                b.op(Opcode::Retn);
            })
        },
        |rt| {
            let before = rt.state().save_cursors();
            assert_eq!(call_main(rt, &[]), Ok(12));
            assert_eq!(rt.state().save_cursors().sp, before.sp);
            assert_eq!(rt.state().hp(), before.hp);
            assert_eq!(rt.state().rp(), before.rp);
        },
    );
}

#[test]
fn test_divide_by_zero() {
    for_each_executor(
        || {
            single(|b| {
                b.op1(Opcode::ConstPri, 10);
                b.op1(Opcode::ConstAlt, 0);
                b.op(Opcode::Sdiv);
                b.op(Opcode::Retn);
            })
        },
        |rt| {
            let sp = rt.state().sp();
            assert_eq!(call_main(rt, &[]), Err(ErrorCode::DivideByZero));
            assert_eq!(rt.state().sp(), sp);
        },
    );
}

#[test]
fn test_recursive_calls() {
    // fib(n) = n < 2 ? n : fib(n - 1) + fib(n - 2)
    let image = || {
        let mut b = ImageBuilder::new("fib");
        let fib = b.new_label();
        let recurse = b.new_label();
        b.public("main");
        b.bind(fib);
        b.begin_function("fib");
        b.op1(Opcode::LoadSPri, 12);
        b.op1(Opcode::ConstAlt, 2);
        b.jump(Opcode::Jsgeq, recurse);
        b.op(Opcode::Retn);
        b.bind(recurse);
        b.op(Opcode::DecPri);
        b.op(Opcode::PushPri);
        b.op1(Opcode::PushC, 1);
        b.call(fib);
        b.op(Opcode::PushPri);
        b.op1(Opcode::LoadSPri, 12);
        b.op1(Opcode::AddC, -2);
        b.op(Opcode::PushPri);
        b.op1(Opcode::PushC, 1);
        b.call(fib);
        b.op(Opcode::PopAlt);
        b.op(Opcode::Add);
        b.op(Opcode::Retn);
        b.end_function();
        b.build().unwrap()
    };
    for_each_executor(image, |rt| {
        assert_eq!(call_main(rt, &[0]), Ok(0));
        assert_eq!(call_main(rt, &[1]), Ok(1));
        assert_eq!(call_main(rt, &[15]), Ok(610));
    });
}

#[test]
fn test_callee_inherits_registers() {
    // `sum` reads PRI and ALT without setting them; `noop` leaves PRI alone.
    let image = || {
        let mut b = ImageBuilder::new("inherit");
        let sum = b.new_label();
        let noop = b.new_label();
        b.public("main");
        b.begin_function("main");
        b.op1(Opcode::ConstPri, 40);
        b.op1(Opcode::ConstAlt, 2);
        b.op1(Opcode::PushC, 0);
        b.call(sum);
        b.op1(Opcode::PushC, 0);
        b.call(noop);
        b.op(Opcode::Retn);
        b.end_function();
        b.bind(sum);
        b.begin_function("sum");
        b.op(Opcode::Add);
        b.op1(Opcode::ConstAlt, 99);
        b.op(Opcode::Retn);
        b.end_function();
        b.bind(noop);
        b.begin_function("noop");
        b.op(Opcode::Retn);
        b.end_function();
        b.build().unwrap()
    };
    for_each_executor(image, |rt| {
        assert_eq!(call_main(rt, &[]), Ok(42));
    });
}

#[test]
fn test_runaway_recursion_hits_a_limit() {
    let image = || {
        let mut b = ImageBuilder::new("deep");
        let me = b.new_label();
        b.public("main");
        b.bind(me);
        b.begin_function("main");
        b.op1(Opcode::Stack, -400);
        b.op1(Opcode::PushC, 0);
        b.call(me);
        b.op(Opcode::Retn);
        b.end_function();
        b.build().unwrap()
    };
    for_each_executor(image, |rt| {
        let before = rt.state().save_cursors();
        let err = call_main(rt, &[]).unwrap_err();
        assert!(matches!(err, ErrorCode::StackLow), "got {err:?}");
        assert_eq!(rt.state().save_cursors(), before);
        // The runtime stays usable.
        assert_eq!(call_main(rt, &[]).unwrap_err(), ErrorCode::StackLow);
    });
}

#[test]
fn test_malformed_branches_fail_before_running() {
    // PROC@0, CONST.pri@4 (operand @8), JUMP@12 into the CONST operand.
    let into_operand = || {
        single(|b| {
            b.op1(Opcode::ConstPri, 1);
            b.op1(Opcode::Jump, 8);
            b.op(Opcode::Retn);
        })
    };
    // A jump from `main` to the start of another function.
    let across_functions = || {
        let mut b = ImageBuilder::new("across");
        let other = b.new_label();
        b.public("main");
        b.begin_function("main");
        b.op1(Opcode::ConstPri, 1);
        b.jump(Opcode::Jump, other);
        b.end_function();
        b.bind(other);
        b.begin_function("other");
        b.op(Opcode::Retn);
        b.end_function();
        b.build().unwrap()
    };
    for image in [into_operand as fn() -> Image, across_functions] {
        for_each_executor(image, |rt| {
            let before = rt.state().save_cursors();
            assert_eq!(call_main(rt, &[]), Err(ErrorCode::InstructionParam));
            assert_eq!(rt.state().save_cursors(), before);
        });
    }
}

#[test]
fn test_malformed_callee_fails_at_the_call() {
    let image = || {
        let mut b = ImageBuilder::new("callee");
        let broken = b.new_label();
        b.public("main");
        b.begin_function("main");
        b.op1(Opcode::PushC, 0);
        b.call(broken);
        b.op(Opcode::Retn);
        b.end_function();
        b.bind(broken);
        b.begin_function("broken");
        b.op1(Opcode::Jump, 2);
        b.op(Opcode::Retn);
        b.end_function();
        b.build().unwrap()
    };
    for_each_executor(image, |rt| {
        assert_eq!(call_main(rt, &[]), Err(ErrorCode::InstructionParam));
    });
}

// =============================================================================
// Leaks
// =============================================================================

#[test]
fn test_unreleased_heap_is_a_leak() {
    for_each_executor(
        || {
            single(|b| {
                b.op1(Opcode::Heap, 16);
                b.op(Opcode::Retn);
            })
        },
        |rt| {
            let hp = rt.state().hp();
            assert_eq!(call_main(rt, &[]), Err(ErrorCode::HeapLeak));
            assert_eq!(rt.state().hp(), hp);
        },
    );
}

/// `main` calls native 0 with one argument and returns its result.
fn native_caller() -> Image {
    let mut b = ImageBuilder::new("natives");
    b.native("host");
    b.public("main");
    b.begin_function("main");
    b.op1(Opcode::PushC, 21);
    b.op2(Opcode::SysreqN, 0, 1);
    b.op(Opcode::Retn);
    b.end_function();
    b.build().unwrap()
}

#[test]
fn test_native_result() {
    for_each_executor(native_caller, |rt| {
        rt.bind_native("host", |_, params| {
            assert_eq!(params, [1, 21]);
            params[1] * 2
        })
        .unwrap();
        assert_eq!(call_main(rt, &[]), Ok(42));
        assert_eq!(rt.state().last_native(), Some(0));
    });
}

#[test]
fn test_native_heap_leak() {
    for_each_executor(native_caller, |rt| {
        rt.bind_native("host", |rt, _| {
            rt.heap_alloc(4).unwrap();
            0
        })
        .unwrap();
        assert_eq!(call_main(rt, &[]), Err(ErrorCode::HeapLeak));
    });
}

#[test]
fn test_native_error_wins_over_leak() {
    for_each_executor(native_caller, |rt| {
        let reports = Arc::new(Mutex::new(Vec::<ErrorReport>::new()));
        let sink = Arc::clone(&reports);
        rt.env()
            .set_error_listener(move |r: &ErrorReport| sink.lock().push(r.clone()));
        rt.bind_native("host", |rt, _| {
            rt.heap_alloc(4).unwrap();
            rt.throw_native_error(ErrorCode::Native, "bad argument")
        })
        .unwrap();
        assert_eq!(call_main(rt, &[]), Err(ErrorCode::Native));
        let reports = reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].message, "bad argument");
        assert_eq!(reports[0].backtrace.frames()[0].function.as_deref(), Some("main"));
    });
}

#[test]
fn test_unbound_native() {
    for_each_executor(native_caller, |rt| {
        assert_eq!(rt.natives().missing().collect::<Vec<_>>(), ["host"]);
        assert_eq!(call_main(rt, &[]), Err(ErrorCode::InvalidNative));
    });
}

#[test]
fn test_native_reenters_script() {
    let image = || {
        let mut b = ImageBuilder::new("reenter");
        b.native("again");
        b.public("main");
        b.begin_function("main");
        b.op1(Opcode::PushC, 3);
        b.op2(Opcode::SysreqN, 0, 1);
        b.op(Opcode::Retn);
        b.end_function();
        b.public("triple");
        b.begin_function("triple");
        b.op1(Opcode::LoadSPri, 12);
        b.op1(Opcode::SmulC, 3);
        b.op(Opcode::Retn);
        b.end_function();
        b.build().unwrap()
    };
    let calls = Arc::new(AtomicUsize::new(0));
    for_each_executor(image, |rt| {
        let counter = Arc::clone(&calls);
        rt.bind_native("again", move |rt, params| {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut f = rt.find_function("triple").unwrap();
            f.push_cell(params[1]).unwrap();
            f.execute().unwrap_or(-1)
        })
        .unwrap();
        assert_eq!(call_main(rt, &[]), Ok(9));
    });
    assert_eq!(calls.load(Ordering::SeqCst), configs().len());
}

// =============================================================================
// Watchdog
// =============================================================================

fn spin_image() -> Image {
    let mut b = ImageBuilder::new("spin");
    let top = b.new_label();
    b.public("spin");
    b.begin_function("spin");
    b.bind(top);
    b.op(Opcode::IncPri);
    b.jump(Opcode::Jump, top);
    b.end_function();
    b.public("add");
    b.begin_function("add");
    b.op1(Opcode::ConstPri, 5);
    b.op1(Opcode::ConstAlt, 7);
    b.op(Opcode::Add);
    b.op(Opcode::Retn);
    b.end_function();
    b.build().unwrap()
}

#[test]
fn test_watchdog_aborts_infinite_loop() {
    for config in configs() {
        let env = Environment::new(config);
        assert!(env.install_watchdog_timer(50));
        let mut rt = env.load_image(spin_image()).unwrap();

        let start = Instant::now();
        let err = rt.find_function("spin").unwrap().execute().unwrap_err();
        let elapsed = start.elapsed();
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert!(elapsed >= Duration::from_millis(25), "fired after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "fired after {elapsed:?}");

        assert_eq!(rt.find_function("add").unwrap().execute().unwrap(), 12);
        assert!(!env.is_running());
        assert_eq!(env.code_stats().live_runtimes, 1);
    }
}

#[test]
fn test_watchdog_timeout_is_repeatable() {
    for config in configs() {
        let env = Environment::new(config);
        env.install_watchdog_timer(20);
        let mut rt = env.load_image(spin_image()).unwrap();
        for _ in 0..2 {
            let err = rt.find_function("spin").unwrap().execute().unwrap_err();
            assert_eq!(err.code(), ErrorCode::Timeout);
        }
        if rt.executor().is_jitted() {
            assert!(env.code_stats().patch_sweeps >= 2);
        }
    }
}

#[test]
fn test_watchdog_ignores_steady_progress() {
    for config in configs() {
        let env = Environment::new(config);
        env.install_watchdog_timer(40);
        let mut rt = env.load_image(spin_image()).unwrap();
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(150) {
            assert_eq!(rt.find_function("add").unwrap().execute().unwrap(), 12);
        }
        env.shutdown_watchdog();
    }
}
