//! Interpreter versus JIT dispatch.
//!
//! Each workload runs under both executors:
//! 1. **Loop**: a counted loop, one backward edge per iteration
//! 2. **Fibonacci**: recursive calls through `CALL`/`RETN`
//! 3. **Natives**: a loop calling a trivial host function

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pawn_core::{Image, ImageBuilder, Opcode};
use pawn_vm::{EngineConfig, Environment};

// =============================================================================
// Workloads
// =============================================================================

/// `main(n)`: sum of 1..=n.
fn loop_sum() -> Image {
    let mut b = ImageBuilder::new("loop");
    let top = b.new_label();
    let done = b.new_label();
    b.public("main");
    b.begin_function("main");
    b.op1(Opcode::PushC, 0);
    b.op1(Opcode::LoadSPri, 12);
    b.bind(top);
    b.jump(Opcode::Jzer, done);
    b.op(Opcode::PushPri);
    b.op1(Opcode::LoadSAlt, -4);
    b.op(Opcode::Add);
    b.op1(Opcode::StorSPri, -4);
    b.op(Opcode::PopPri);
    b.op(Opcode::DecPri);
    b.jump(Opcode::Jump, top);
    b.bind(done);
    b.op(Opcode::PopPri);
    b.op(Opcode::Retn);
    b.end_function();
    b.build().expect("loop image")
}

/// `main(n)`: recursive Fibonacci.
fn fibonacci() -> Image {
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
    b.build().expect("fib image")
}

/// `main(n)`: calls `tick` n times.
fn native_loop() -> Image {
    let mut b = ImageBuilder::new("natives");
    let top = b.new_label();
    let done = b.new_label();
    b.native("tick");
    b.public("main");
    b.begin_function("main");
    b.op1(Opcode::LoadSPri, 12);
    b.bind(top);
    b.jump(Opcode::Jzer, done);
    b.op(Opcode::PushPri);
    b.op(Opcode::PushPri);
    b.op2(Opcode::SysreqN, 0, 1);
    b.op(Opcode::PopPri);
    b.op(Opcode::DecPri);
    b.jump(Opcode::Jump, top);
    b.bind(done);
    b.op(Opcode::Retn);
    b.end_function();
    b.build().expect("native image")
}

fn executors() -> Vec<(&'static str, EngineConfig)> {
    let mut list = vec![("interpreter", EngineConfig::interpreter_only())];
    if pawn_jit::is_supported() {
        list.push(("jit", EngineConfig::default()));
    }
    list
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_workload(c: &mut Criterion, group_name: &str, image: fn() -> Image, arg: i32) {
    let mut group = c.benchmark_group(group_name);
    group.throughput(Throughput::Elements(arg as u64));
    for (name, config) in executors() {
        let env = Environment::new(config);
        let mut rt = env.load_image(image()).expect("load");
        if !rt.natives().is_empty() {
            rt.bind_native("tick", |_, params| params[1]).expect("bind");
        }
        let main = rt.public_offset("main").expect("main");
        // Compile outside the measurement.
        rt.invoke(main, &[1]).expect("warm-up");

        group.bench_with_input(BenchmarkId::new(name, arg), &arg, |bench, &n| {
            bench.iter(|| black_box(rt.invoke(main, &[black_box(n)]).expect("invoke")))
        });
    }
    group.finish();
}

fn bench_loop(c: &mut Criterion) {
    bench_workload(c, "loop_sum", loop_sum, 100_000);
}

fn bench_fibonacci(c: &mut Criterion) {
    bench_workload(c, "fibonacci", fibonacci, 20);
}

fn bench_natives(c: &mut Criterion) {
    bench_workload(c, "native_calls", native_loop, 10_000);
}

criterion_group!(benches, bench_loop, bench_fibonacci, bench_natives);
criterion_main!(benches);
