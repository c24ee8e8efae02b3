//! Throughput benchmarks for packet encoding and frame parsing
//!
//! Run with: cargo bench --bench packet_codec

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use proclaunch_protocol::{Packet, PacketParser, StartProcess, Token};

fn output_packet(size: usize) -> Packet {
    Packet::ReadyReadStandardOutput {
        token: Token::new(1),
        data: Bytes::from(vec![b'x'; size]),
    }
}

fn bench_serialize_start(c: &mut Criterion) {
    let mut start = StartProcess::new(
        Token::new(1),
        "/usr/bin/env",
        vec!["make".into(), "-j8".into(), "all".into()],
    );
    start.working_dir = "/home/user/project".into();
    start.env = (0..32).map(|i| format!("VAR_{i}=value_{i}")).collect();
    let packet = Packet::StartProcess(start);

    c.bench_function("serialize_start_process", |b| {
        b.iter(|| black_box(&packet).serialize())
    });
}

fn bench_parse_output(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_ready_read");

    for size in [64usize, 4096, 65536] {
        let frame = output_packet(size).serialize();
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| {
                let mut parser = PacketParser::new();
                parser.feed(black_box(frame));
                let raw = parser.parse().unwrap().unwrap();
                black_box(raw.decode().unwrap())
            })
        });
    }

    group.finish();
}

fn bench_parse_chunked(c: &mut Criterion) {
    let stream: Vec<u8> = (0..100)
        .flat_map(|_| output_packet(512).serialize().to_vec())
        .collect();

    c.bench_function("parse_chunked_stream", |b| {
        b.iter(|| {
            let mut parser = PacketParser::new();
            let mut count = 0;
            for chunk in stream.chunks(1500) {
                parser.feed(chunk);
                while let Some(raw) = parser.parse().unwrap() {
                    black_box(raw);
                    count += 1;
                }
            }
            assert_eq!(count, 100);
        })
    });
}

criterion_group!(
    benches,
    bench_serialize_start,
    bench_parse_output,
    bench_parse_chunked
);
criterion_main!(benches);
