//! Performance benchmarks for the buffer-binding hot path
//!
//! These cover the per-commit work: shm pixel conversion, memoized GPU
//! rebinds, and the configure/ack handshake bookkeeping.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use alcove::presenter::{bind_buffer, BufferRecord, BufferSource};
use alcove::shell::ShellSessionManager;
use alcove::view::ViewManager;
use memmap2::MmapOptions;
use wayland_server::protocol::wl_shm;
use wayland_server::WEnum;

fn shm_record(id: u32, width: i32, height: i32) -> BufferRecord {
    let stride = width * 4;
    let len = (stride * height) as usize;
    let mut map = MmapOptions::new().len(len).map_anon().unwrap();
    for (i, byte) in map.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    BufferRecord {
        id,
        width,
        height,
        source: BufferSource::Shm {
            map: Arc::new(map.make_read_only().unwrap()),
            stride,
            offset: 0,
            format: WEnum::Value(wl_shm::Format::Xrgb8888),
        },
    }
}

/// Benchmark shm pixel conversion across buffer sizes
fn bench_shm_conversion(c: &mut Criterion) {
    let mut group = c.benchmark_group("shm_conversion");

    for size in [64i32, 256, 512, 1024].iter() {
        let record = shm_record(1, *size, *size);
        group.bench_with_input(format!("convert_{}x{}", size, size), size, |b, _| {
            let mut views = ViewManager::new();
            let view = views.ensure_view(7);
            b.iter(|| {
                // The shm path reconverts on every bind.
                black_box(bind_buffer(&mut views, view, Some(&record)).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark the memoized GPU rebind (no image rebuild)
fn bench_gpu_rebind(c: &mut Criterion) {
    let mut group = c.benchmark_group("gpu_rebind");

    group.bench_function("rebind_same_buffer", |b| {
        let record = gpu_record(42);
        let mut views = ViewManager::new();
        let view = views.ensure_view(7);
        bind_buffer(&mut views, view, Some(&record)).unwrap();

        b.iter(|| {
            black_box(bind_buffer(&mut views, view, Some(&record)).unwrap());
        });
    });

    group.finish();
}

fn gpu_record(id: u32) -> BufferRecord {
    use alcove::presenter::DmabufPlane;
    let fd = std::fs::File::open("/dev/null").unwrap().into();
    BufferRecord {
        id,
        width: 256,
        height: 256,
        source: BufferSource::Dmabuf {
            planes: vec![DmabufPlane {
                fd,
                offset: 0,
                stride: 1024,
            }],
            fourcc: 0x34325241,
            modifier: 0,
        },
    }
}

/// Benchmark the configure/ack handshake bookkeeping
fn bench_session_handshake(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_handshake");

    group.bench_function("configure_ack_cycle", |b| {
        b.iter_batched(
            || {
                let mut sessions = ShellSessionManager::new();
                sessions.bind_client(1);
                let id = sessions.request_surface(1, 100).unwrap();
                (sessions, id)
            },
            |(mut sessions, id)| {
                for i in 0..100u32 {
                    let pending = sessions
                        .configure(id, 800 + i, 600, None)
                        .unwrap();
                    black_box(sessions.ack_configure(100, pending.serial));
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_shm_conversion,
    bench_gpu_rebind,
    bench_session_handshake
);

criterion_main!(benches);
