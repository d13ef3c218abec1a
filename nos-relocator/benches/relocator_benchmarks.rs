//! Relocator benchmarks

use std::hint::black_box;
use std::ptr::NonNull;

use criterion::{criterion_group, criterion_main, Criterion};
use nos_relocator::compiler::TrampolineCompiler;
use nos_relocator::{
    BootState, CopyOp, CpuMode, Long64State, Machine, MemoryKind, Preference, Relocator,
    RelocatorConfig, RelocatorContext, StaticMemoryMap,
};

struct Buffered;

unsafe impl Machine for Buffered {
    fn cpu_mode(&self) -> CpuMode {
        CpuMode::Long64
    }

    fn direct_access(&self, _target: u64, _size: u64) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn jump(&self, entry: u64) -> ! {
        panic!("jump to {:#x}", entry)
    }
}

/// Fragmented map: 256 free 60 KiB windows separated by reserved pages
fn fragmented_map() -> StaticMemoryMap {
    (0..256u64).fold(StaticMemoryMap::new(), |map, i| {
        map.with_region(i * 0x1_0000, 0xF000, MemoryKind::Available)
            .with_region(i * 0x1_0000 + 0xF000, 0x1000, MemoryKind::Reserved)
    })
}

fn bench_alloc_in_range(c: &mut Criterion) {
    let context =
        RelocatorContext::new(fragmented_map(), Buffered, RelocatorConfig::default()).unwrap();
    c.bench_function("alloc_in_range_low_32_chunks", |b| {
        b.iter(|| {
            let mut relocator = Relocator::new_in(&context);
            for _ in 0..32 {
                let id = relocator
                    .alloc_in_range(0, u64::MAX, black_box(0x8000), 0x1000, Preference::Low, false)
                    .unwrap();
                black_box(id);
            }
        })
    });
    c.bench_function("alloc_in_range_best_fit_32_chunks", |b| {
        b.iter(|| {
            let mut relocator = Relocator::new_in(&context);
            for _ in 0..32 {
                let id = relocator
                    .alloc_in_range(0, u64::MAX, black_box(0x3000), 16, Preference::Any, false)
                    .unwrap();
                black_box(id);
            }
        })
    });
}

fn bench_compile(c: &mut Criterion) {
    let config = RelocatorConfig::default();
    let copies: Vec<CopyOp> = (0..64u64)
        .filter_map(|i| CopyOp::new(0x1000_0000 + i * 0x1_0000, 0x10_0000 + i * 0x2_0000, 0x1_0000))
        .collect();
    let state = BootState::Long64(Long64State { rip: 0x10_0000, ..Default::default() });
    c.bench_function("compile_64_copies_long64", |b| {
        b.iter(|| {
            let program = TrampolineCompiler::new(CpuMode::Long64, &config)
                .compile(black_box(&copies), &state)
                .unwrap();
            black_box(program.link(0x8000).unwrap());
        })
    });
}

fn bench_copy_replay(c: &mut Criterion) {
    let mut memory = vec![0u8; 0x2_0000];
    let op = CopyOp::new(0x1000, 0x1800, 0x1_0000).unwrap();
    c.bench_function("copy_replay_backward_64k", |b| b.iter(|| black_box(op.replay(&mut memory))));
}

criterion_group!(benches, bench_alloc_in_range, bench_compile, bench_copy_replay);

criterion_main!(benches);
