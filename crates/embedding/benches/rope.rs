use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use embedding::positional::{RopeConfig, RotaryState, RotaryWrite, RotationStyle};

fn bench_rotary_decode(c: &mut Criterion) {
    let device = Device::Cpu;
    let heads = 32usize;
    let shapes = &[
        (64usize, RotationStyle::Half),
        (128, RotationStyle::Half),
        (128, RotationStyle::Interleaved),
    ];

    for &rows in &[1usize, 8] {
        let mut group = c.benchmark_group(format!("rotary/decode/rows{rows}"));
        for &(head_dim, style) in shapes {
            let cfg = RopeConfig {
                head_dim,
                style,
                ..RopeConfig::default()
            };
            let mut state = RotaryState::new(cfg, 2048, 2048, &device).expect("rotary state");
            let q = Tensor::randn(0f32, 1.0, (1, rows, heads, head_dim), &device)
                .expect("q")
                .to_dtype(DType::F32)
                .expect("cast q");
            let k = q.clone();
            let ids = Tensor::full(511u32, (rows, 1), &device).expect("position ids");
            group.throughput(Throughput::Elements((2 * rows * heads * head_dim) as u64));
            group.bench_function(BenchmarkId::from_parameter(format!("{head_dim}/{style:?}")), |b| {
                b.iter(|| {
                    state.reset_gather();
                    let out = state
                        .apply(
                            black_box(&q),
                            black_box(&k),
                            &ids,
                            0,
                            1,
                            512,
                            RotaryWrite::NewStorage,
                        )
                        .expect("apply");
                    black_box(out);
                });
            });
        }
        group.finish();
    }
}

fn bench_table_growth(c: &mut Criterion) {
    let device = Device::Cpu;
    let cfg = RopeConfig {
        head_dim: 128,
        ..RopeConfig::default()
    };
    c.bench_function("rotary/grow/2048", |b| {
        b.iter(|| {
            let mut state = RotaryState::new(cfg.clone(), 2048, 2048, &device).expect("state");
            state.ensure_capacity(black_box(2048)).expect("grow");
            black_box(state.current_max_len());
        });
    });
}

criterion_group!(benches, bench_rotary_decode, bench_table_growth);
criterion_main!(benches);
