//! Benchmarks for per-packet work: id allocation, header framing and the
//! KCP send/input path.
//!
//! Run with: cargo bench --bench hot_paths

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use relic::network::kcp::Kcp;
use relic::network::PackInfo;
use relic::{IdFactory, RuntimeId};

fn benchmark_runtime_ids(c: &mut Criterion) {
    let ids = IdFactory::new(1001, 1);

    let mut group = c.benchmark_group("id_factory");
    group.throughput(Throughput::Elements(1));
    group.bench_function("next_runtime_id", |b| b.iter(|| black_box(ids.next_runtime_id().ok())));
    group.bench_function("next_entity_id", |b| b.iter(|| black_box(ids.next_entity_id().ok())));
    group.finish();
}

fn benchmark_packet_framing(c: &mut Criterion) {
    let pack = PackInfo::new(200_000_001, Bytes::from(vec![7u8; 256]))
        .with_rpc_id(42)
        .with_route(RuntimeId::from_parts(10, 1001, 5).unwrap_or_default());
    let encoded = pack.to_bytes();

    let mut group = c.benchmark_group("packet");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode_256", |b| b.iter(|| black_box(pack.to_bytes())));
    group.bench_function("decode_256", |b| {
        b.iter(|| black_box(PackInfo::decode(encoded.clone(), 1024 * 1024).ok()))
    });
    group.finish();
}

fn benchmark_kcp_link(c: &mut Criterion) {
    let message = vec![3u8; 1024];

    let mut group = c.benchmark_group("kcp");
    group.throughput(Throughput::Elements(100));
    group.sample_size(20);
    group.bench_function("deliver_100_messages", |b| {
        b.iter(|| {
            let wire_a = Arc::new(Mutex::new(VecDeque::<Vec<u8>>::new()));
            let wire_b = Arc::new(Mutex::new(VecDeque::<Vec<u8>>::new()));
            let out_a = wire_a.clone();
            let out_b = wire_b.clone();
            let mut a = Kcp::new(1, Box::new(move |data: &[u8]| out_a.lock().push_back(data.to_vec())));
            let mut b = Kcp::new(1, Box::new(move |data: &[u8]| out_b.lock().push_back(data.to_vec())));
            for kcp in [&mut a, &mut b] {
                kcp.set_nodelay(1, 10, 2, true);
                kcp.set_wndsize(256, 256);
            }

            for _ in 0..100 {
                let _ = a.send(&message);
            }
            let mut received = 0;
            let mut now = 0;
            while received < 100 && now < 10_000 {
                a.update(now);
                b.update(now);
                let outgoing: Vec<_> = wire_a.lock().drain(..).collect();
                for datagram in outgoing {
                    let _ = b.input(&datagram);
                }
                let acks: Vec<_> = wire_b.lock().drain(..).collect();
                for datagram in acks {
                    let _ = a.input(&datagram);
                }
                while b.recv().is_ok() {
                    received += 1;
                }
                now += 10;
            }
            black_box(received)
        });
    });
    group.finish();
}

criterion_group!(benches, benchmark_runtime_ids, benchmark_packet_framing, benchmark_kcp_link);
criterion_main!(benches);
