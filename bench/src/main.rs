use moca_native::NativeConfig;
use moca_native::jit::sparc::Sparc;
use moca_native::jit::{CodeSpace, PatchKind, patch_immediate};
use moca_native::scenario::{CallSpec, FrameSpec, Process, Scenario};
use moca_native::stack::{DescriptorTable, NativeSupport};
use serde::Serialize;
use std::time::Instant;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    iterations: u32,
    total_secs: f64,
    per_iter_nanos: f64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    frames: usize,
    results: Vec<BenchmarkResult>,
}

const FRAMES: usize = 10_000;

fn deep_stack(frames: usize, config: &NativeConfig) -> Process {
    let frames = (0..frames)
        .map(|i| FrameSpec {
            return_address: 0x10_0000 + i * 0x10,
            frame_size: 1 + i % 4,
            arity: i % 3,
            live: vec![0],
            slots: Vec::new(),
            handler: None,
        })
        .collect();
    let scenario = Scenario {
        fail_handler: 0x200,
        mode_switch: 0x100,
        call: CallSpec::default(),
        frames,
    };
    match scenario.build(config) {
        Ok(process) => process,
        Err(e) => panic!("benchmark scenario is invalid: {}", e),
    }
}

fn run(name: &str, iterations: u32, mut f: impl FnMut()) -> BenchmarkResult {
    let start = Instant::now();
    for _ in 0..iterations {
        f();
    }
    let total_secs = start.elapsed().as_secs_f64();
    BenchmarkResult {
        name: name.to_string(),
        iterations,
        total_secs,
        per_iter_nanos: total_secs * 1e9 / iterations as f64,
    }
}

fn main() {
    let config = NativeConfig {
        min_stack_words: 0,
        ..Default::default()
    };
    let process = deep_stack(FRAMES, &config);
    let support = NativeSupport::new(&process.table, &config, process.fail_handler);
    let mut results = Vec::new();

    // Full walk of every frame
    results.push(run("walk", 100, || {
        let frames = support.frames(&process.stack, &process.ctx).unwrap();
        assert_eq!(frames.len(), FRAMES);
    }));

    // Root collection for one collector pass
    results.push(run("live_roots", 100, || {
        let roots = support.live_roots(&process.stack, &process.ctx).unwrap();
        assert_eq!(roots.len(), FRAMES);
    }));

    // Returning through every frame with the trap moving along
    results.push(run("trap_cycle", 10, || {
        let mut stack = process.stack.clone();
        let mut ctx = process.ctx.clone();
        let start = process.table.find(ctx.return_address).unwrap();
        support.install_or_advance(&mut stack, &mut ctx, start).unwrap();
        while let Some(limit) = ctx.gray_limit {
            stack.set_top(limit);
            support.handle_stack_trap(&mut stack, &mut ctx).unwrap();
        }
    }));

    // Uncaught exception unwinding to the terminator
    results.push(run("unwind", 100, || {
        let mut stack = process.stack.clone();
        let mut ctx = process.ctx.clone();
        let handler = support.find_handler(&mut stack, &mut ctx, -1).unwrap();
        assert_eq!(handler, process.fail_handler);
    }));

    // Immediate patch and flush
    let mut words = [0x0300_0000u32, 0x8210_6000];
    results.push(run("patch_immediate", 100_000, || {
        let mut space = CodeSpace::new(&mut words);
        let base = space.base();
        patch_immediate::<Sparc>(&mut space, base, 0xDEAD_BEEF, PatchKind::Constant)
            .unwrap()
            .commit();
    }));

    let output = BenchmarkOutput {
        frames: FRAMES,
        results,
    };
    println!("{}", serde_json::to_string_pretty(&output).unwrap());
}
